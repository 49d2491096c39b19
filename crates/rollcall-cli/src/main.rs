use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance scanner CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start scanning
    Start,
    /// Stop scanning
    Stop,
    /// Show daemon status
    Status,
    /// Show attendance for a day
    Report {
        /// Day to report (YYYY-MM-DD); defaults to today
        #[arg(short, long)]
        date: Option<NaiveDate>,
    },
    /// List days that have attendance records
    Dates,
    /// Enroll a person from an image file
    Enroll {
        /// Name to record attendance under
        #[arg(short, long)]
        name: String,
        /// Image containing the person's face
        #[arg(short, long)]
        image: PathBuf,
    },
    /// Remove an enrolled person
    Remove {
        name: String,
    },
    /// List enrolled people
    List,
    /// Re-read the enrollment directory
    Reload,
    /// List local V4L2 capture devices
    Devices,
}

#[zbus::proxy(
    interface = "org.rollcall.Scanner1",
    default_service = "org.rollcall.Scanner1",
    default_path = "/org/rollcall/Scanner1"
)]
trait Scanner {
    async fn start(&self) -> zbus::Result<bool>;
    async fn stop(&self) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
    async fn report(&self, date: &str) -> zbus::Result<String>;
    async fn dates(&self) -> zbus::Result<Vec<String>>;
    async fn enroll(&self, name: &str, image_path: &str) -> zbus::Result<String>;
    async fn remove(&self, name: &str) -> zbus::Result<()>;
    async fn list_identities(&self) -> zbus::Result<Vec<String>>;
    async fn reload(&self) -> zbus::Result<u32>;
}

#[derive(Debug, Deserialize)]
struct ReportRow {
    name: String,
    time: String,
    date: String,
}

fn format_report(rows: &[ReportRow]) -> String {
    if rows.is_empty() {
        return "No attendance recorded".to_string();
    }
    let width = rows.iter().map(|r| r.name.len()).max().unwrap_or(0).max(4);
    let mut out = format!("{:<width$}  {:<8}  {}\n", "Name", "Time", "Date");
    for row in rows {
        out.push_str(&format!("{:<width$}  {:<8}  {}\n", row.name, row.time, row.date));
    }
    out
}

async fn connect(system: bool) -> Result<ScannerProxy<'static>> {
    tracing::debug!(system, "connecting to rollcalld");
    let conn = if system {
        zbus::Connection::system().await?
    } else {
        zbus::Connection::session().await?
    };
    ScannerProxy::new(&conn)
        .await
        .context("rollcalld is not reachable on D-Bus")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Commands::Devices = cli.command {
        let devices = rollcall_hw::Camera::list_devices();
        if devices.is_empty() {
            println!("No V4L2 capture devices found");
        }
        for d in devices {
            println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
        }
        return Ok(());
    }

    let proxy = connect(cli.system).await?;

    match cli.command {
        Commands::Start => {
            if proxy.start().await? {
                println!("Scanning started");
            } else {
                println!("Already scanning");
            }
        }
        Commands::Stop => {
            if proxy.stop().await? {
                println!("Scanning stopped");
            } else {
                println!("Not scanning");
            }
        }
        Commands::Status => {
            let raw = proxy.status().await?;
            let status: serde_json::Value = serde_json::from_str(&raw)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Report { date } => {
            let date = date.map(|d| d.format("%Y-%m-%d").to_string()).unwrap_or_default();
            let raw = proxy.report(&date).await?;
            let rows: Vec<ReportRow> = serde_json::from_str(&raw)?;
            println!("{}", format_report(&rows).trim_end());
        }
        Commands::Dates => {
            for date in proxy.dates().await? {
                println!("{date}");
            }
        }
        Commands::Enroll { name, image } => {
            // The daemon resolves the path itself, so hand it an absolute one.
            let image = std::fs::canonicalize(&image)
                .with_context(|| format!("cannot access {}", image.display()))?;
            if let Err(e) = image::open(&image) {
                bail!("{} is not a readable image: {e}", image.display());
            }
            let stored = proxy.enroll(&name, &image.to_string_lossy()).await?;
            println!("Enrolled {name} ({stored})");
        }
        Commands::Remove { name } => {
            proxy.remove(&name).await?;
            println!("Removed {name}");
        }
        Commands::List => {
            let names = proxy.list_identities().await?;
            if names.is_empty() {
                println!("No one enrolled");
            }
            for name in names {
                println!("{name}");
            }
        }
        Commands::Reload => {
            let count = proxy.reload().await?;
            println!("Gallery reloaded: {count} enrolled");
        }
        Commands::Devices => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_report_date() {
        let cli = Cli::try_parse_from(["rollcall", "report", "--date", "2024-03-09"]).unwrap();
        match cli.command {
            Commands::Report { date } => {
                assert_eq!(date, NaiveDate::from_ymd_opt(2024, 3, 9));
            }
            _ => panic!("expected report"),
        }
    }

    #[test]
    fn test_parse_rejects_bad_date() {
        assert!(Cli::try_parse_from(["rollcall", "report", "--date", "09/03/2024"]).is_err());
    }

    #[test]
    fn test_parse_enroll_global_flag() {
        let cli =
            Cli::try_parse_from(["rollcall", "enroll", "-n", "alice", "-i", "a.jpg", "--system"])
                .unwrap();
        assert!(cli.system);
        assert!(matches!(cli.command, Commands::Enroll { ref name, .. } if name == "alice"));
    }

    #[test]
    fn test_format_report() {
        let rows: Vec<ReportRow> = serde_json::from_str(
            r#"[{"name":"alice","time":"08:15:02","date":"2024-03-09"},
                {"name":"bo","time":"08:16:40","date":"2024-03-09"}]"#,
        )
        .unwrap();
        let text = format_report(&rows);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Name   Time      Date");
        assert_eq!(lines[1], "alice  08:15:02  2024-03-09");
        assert_eq!(lines[2], "bo     08:16:40  2024-03-09");
    }

    #[test]
    fn test_format_report_empty() {
        assert_eq!(format_report(&[]), "No attendance recorded");
    }
}
