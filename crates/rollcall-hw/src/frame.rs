//! Frame type and pixel conversion for YUYV, packed RGB24 and MJPEG buffers.

use image::RgbImage;

/// A captured RGB frame.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("MJPEG decode failed: {0}")]
    Decode(#[from] image::ImageError),
}

/// Convert packed YUYV (4:2:2) to RGB using BT.601 coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share U/V.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        for y in [chunk[0], chunk[2]] {
            let y = y as f32;
            rgb.push(clamp_u8(y + 1.402 * v));
            rgb.push(clamp_u8(y - 0.344_136 * u - 0.714_136 * v));
            rgb.push(clamp_u8(y + 1.772 * u));
        }
    }

    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        expected: (width * height * 3) as usize,
        actual: 0,
    })
}

/// Wrap a packed RGB24 buffer, ignoring trailing padding.
pub fn rgb24_to_image(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 3) as usize;
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    RgbImage::from_raw(width, height, buf[..expected].to_vec()).ok_or(FrameError::InvalidLength {
        expected,
        actual: buf.len(),
    })
}

/// Decode one MJPEG frame (a standalone JPEG image).
pub fn decode_mjpeg(buf: &[u8]) -> Result<RgbImage, FrameError> {
    let img = image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)?;
    Ok(img.to_rgb8())
}

fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_yuyv_neutral_chroma_is_gray() {
        // 2x1 image: [Y0=100, U=128, Y1=200, V=128]
        let yuyv = vec![100, 128, 200, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert_eq!(rgb.get_pixel(0, 0), &Rgb([100, 100, 100]));
        assert_eq!(rgb.get_pixel(1, 0), &Rgb([200, 200, 200]));
    }

    #[test]
    fn test_yuyv_red_chroma() {
        // High V pushes red up and green down.
        let yuyv = vec![128, 128, 128, 228];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        let p = rgb.get_pixel(0, 0);
        assert!(p[0] > 200, "red {p:?}");
        assert!(p[1] < 128, "green {p:?}");
        assert_eq!(p[2], 128);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        let yuyv = vec![100, 128]; // too short for 2x1
        assert!(matches!(
            yuyv_to_rgb(&yuyv, 2, 1),
            Err(FrameError::InvalidLength { expected: 4, actual: 2 })
        ));
    }

    #[test]
    fn test_rgb24_ignores_padding() {
        let buf = vec![1, 2, 3, 4, 5, 6, 0, 0];
        let img = rgb24_to_image(&buf, 2, 1).unwrap();
        assert_eq!(img.get_pixel(1, 0), &Rgb([4, 5, 6]));
    }

    #[test]
    fn test_rgb24_too_short() {
        assert!(rgb24_to_image(&[0; 5], 2, 1).is_err());
    }

    #[test]
    fn test_decode_mjpeg_roundtrip_dimensions() {
        let src = RgbImage::from_pixel(16, 8, Rgb([120, 60, 30]));
        let mut jpeg = Vec::new();
        src.write_to(&mut std::io::Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)
            .unwrap();
        let decoded = decode_mjpeg(&jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (16, 8));
    }

    #[test]
    fn test_decode_mjpeg_garbage() {
        assert!(decode_mjpeg(b"not a jpeg").is_err());
    }
}
