//! Attendance ledger: one append-only CSV file per calendar day.
//!
//! Files live at `<dir>/attendance_<YYYY-MM-DD>.csv` with a `Name,Time,Date`
//! header. An identity is recorded at most once per date. The guard is keyed
//! by `(name, date)`, so a process running across midnight accepts new marks
//! on the new day. The first mark for a date seeds the guard from that date's
//! file, so a restarted process does not record anyone twice.

use crate::types::UNRECOGNIZED;
use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

const FILE_PREFIX: &str = "attendance_";
const FILE_EXTENSION: &str = "csv";
const HEADER: [&str; 3] = ["Name", "Time", "Date"];
const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("attendance directory {path}: {source}")]
    Directory {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("attendance file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Source of the current local date and time.
pub trait Clock: Send {
    fn now(&self) -> NaiveDateTime;
}

/// Wall-clock time in the local timezone.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// One recorded attendance row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub name: String,
    pub time: NaiveTime,
    pub date: NaiveDate,
}

/// Per-day attendance store with a single-mark-per-day guard.
pub struct Ledger {
    dir: PathBuf,
    clock: Box<dyn Clock>,
    recorded: HashSet<(String, NaiveDate)>,
    seeded: HashSet<NaiveDate>,
}

impl Ledger {
    /// Open the ledger in `dir` using the system clock, creating the directory.
    pub fn open(dir: &Path) -> Result<Self, LedgerError> {
        Self::with_clock(dir, Box::new(SystemClock))
    }

    pub fn with_clock(dir: &Path, clock: Box<dyn Clock>) -> Result<Self, LedgerError> {
        std::fs::create_dir_all(dir).map_err(|source| LedgerError::Directory {
            path: dir.to_path_buf(),
            source,
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
            clock,
            recorded: HashSet::new(),
            seeded: HashSet::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Today's date according to the ledger clock.
    pub fn today(&self) -> NaiveDate {
        self.clock.now().date()
    }

    /// Path of the ledger file for `date`.
    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!(
            "{FILE_PREFIX}{}.{FILE_EXTENSION}",
            date.format(DATE_FORMAT)
        ))
    }

    /// Record attendance for `name` now.
    ///
    /// Returns `Ok(false)` without writing for the unrecognized sentinel, an
    /// empty name, a name with control characters, or a name already
    /// recorded today.
    pub fn mark(&mut self, name: &str) -> Result<bool, LedgerError> {
        if name.trim().is_empty() || name == UNRECOGNIZED {
            return Ok(false);
        }
        if name.chars().any(char::is_control) {
            tracing::warn!(name = ?name, "refusing to record name with control characters");
            return Ok(false);
        }

        let now = self.clock.now();
        let date = now.date();
        self.seed(date)?;

        let key = (name.to_string(), date);
        if self.recorded.contains(&key) {
            return Ok(false);
        }

        let event = AttendanceEvent {
            name: name.to_string(),
            time: now.time(),
            date,
        };
        self.append(&event)?;
        self.recorded.insert(key);

        tracing::info!(
            name,
            time = %event.time.format(TIME_FORMAT),
            date = %date,
            "attendance marked"
        );
        Ok(true)
    }

    /// Whether `name` already has a record for today.
    pub fn is_marked_today(&mut self, name: &str) -> Result<bool, LedgerError> {
        let date = self.today();
        self.seed(date)?;
        Ok(self.recorded.contains(&(name.to_string(), date)))
    }

    /// Number of identities recorded today.
    pub fn count_today(&mut self) -> Result<usize, LedgerError> {
        let date = self.today();
        self.seed(date)?;
        Ok(self.recorded.iter().filter(|(_, d)| *d == date).count())
    }

    /// Rows recorded for `date` (default: today) in arrival order.
    ///
    /// A date without a file yields an empty report.
    pub fn report(&self, date: Option<NaiveDate>) -> Result<Vec<AttendanceEvent>, LedgerError> {
        let date = date.unwrap_or_else(|| self.today());
        let path = self.path_for(date);

        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(LedgerError::Io { path, source }),
        };

        let mut events = Vec::new();
        for (line_no, line) in contents.lines().enumerate() {
            if line.is_empty() || (line_no == 0 && is_header(line)) {
                continue;
            }
            match parse_row(line) {
                Some(event) => events.push(event),
                None => tracing::warn!(
                    path = %path.display(),
                    line = line_no + 1,
                    "skipping malformed attendance row"
                ),
            }
        }
        Ok(events)
    }

    /// Dates that have a ledger file, ascending.
    pub fn dates(&self) -> Result<Vec<NaiveDate>, LedgerError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|source| LedgerError::Directory {
            path: self.dir.clone(),
            source,
        })?;

        let mut dates: Vec<NaiveDate> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let file_name = entry.file_name();
                let stem = file_name
                    .to_str()?
                    .strip_prefix(FILE_PREFIX)?
                    .strip_suffix(&format!(".{FILE_EXTENSION}"))?
                    .to_string();
                NaiveDate::parse_from_str(&stem, DATE_FORMAT).ok()
            })
            .collect();
        dates.sort();
        Ok(dates)
    }

    /// Load names already on disk for `date` into the guard, once per date.
    fn seed(&mut self, date: NaiveDate) -> Result<(), LedgerError> {
        if self.seeded.contains(&date) {
            return Ok(());
        }
        let existing = self.report(Some(date))?;
        if !existing.is_empty() {
            tracing::debug!(date = %date, count = existing.len(), "seeded attendance guard from disk");
        }
        for event in existing {
            self.recorded.insert((event.name, date));
        }
        self.seeded.insert(date);
        Ok(())
    }

    /// Append one row, writing the header first when the file is empty.
    fn append(&self, event: &AttendanceEvent) -> Result<(), LedgerError> {
        let path = self.path_for(event.date);
        let io_err = |source: std::io::Error| LedgerError::Io {
            path: path.clone(),
            source,
        };

        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(io_err)?;
        let empty = file.metadata().map_err(io_err)?.len() == 0;

        let mut buf = String::new();
        if empty {
            buf.push_str(&format_row(&HEADER));
        }
        let time = event.time.format(TIME_FORMAT).to_string();
        let date = event.date.format(DATE_FORMAT).to_string();
        buf.push_str(&format_row(&[&event.name, &time, &date]));

        file.write_all(buf.as_bytes()).map_err(io_err)?;
        file.flush().map_err(io_err)?;
        Ok(())
    }
}

fn is_header(line: &str) -> bool {
    split_fields(line.trim_end_matches('\r')).is_some_and(|fields| fields == HEADER)
}

fn format_row(fields: &[&str]) -> String {
    let mut line = fields
        .iter()
        .map(|f| escape_field(f))
        .collect::<Vec<_>>()
        .join(",");
    line.push_str("\r\n");
    line
}

fn escape_field(field: &str) -> String {
    if field.contains([',', '"', '\r', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Split one CSV line into fields, honoring double-quoted fields.
fn split_fields(line: &str) -> Option<Vec<String>> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, in_quotes) {
            ('"', true) if chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            ('"', true) => in_quotes = false,
            ('"', false) if current.is_empty() => in_quotes = true,
            (',', false) => fields.push(std::mem::take(&mut current)),
            (c, _) => current.push(c),
        }
    }
    if in_quotes {
        return None;
    }
    fields.push(current);
    Some(fields)
}

fn parse_row(line: &str) -> Option<AttendanceEvent> {
    let fields = split_fields(line.trim_end_matches('\r'))?;
    let [name, time, date] = fields.as_slice() else {
        return None;
    };
    Some(AttendanceEvent {
        name: name.clone(),
        time: NaiveTime::parse_from_str(time, TIME_FORMAT).ok()?,
        date: NaiveDate::parse_from_str(date, DATE_FORMAT).ok()?,
    })
}
