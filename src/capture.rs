use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::info;

/// Writes tightly packed RGBA8 pixels as a binary PPM, dropping alpha.
pub fn write_ppm(mut out: impl Write, rgba: &[u8], width: u32, height: u32) -> Result<()> {
    let expected = width as usize * height as usize * 4;
    if rgba.len() != expected {
        bail!(
            "{width}x{height} capture needs {expected} bytes, got {}",
            rgba.len()
        );
    }

    write!(out, "P6\n{width} {height}\n255\n")?;
    let rgb: Vec<u8> = rgba
        .chunks_exact(4)
        .flat_map(|px| [px[0], px[1], px[2]])
        .collect();
    out.write_all(&rgb)?;
    out.flush()?;
    Ok(())
}

pub fn save_ppm(path: &Path, rgba: &[u8], width: u32, height: u32) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    write_ppm(BufWriter::new(file), rgba, width, height)
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!("saved {width}x{height} capture to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_header_and_rgb() {
        let rgba = [
            255, 0, 0, 255, 0, 255, 0, 128, //
            0, 0, 255, 0, 10, 20, 30, 40,
        ];
        let mut out = Vec::new();
        write_ppm(&mut out, &rgba, 2, 2).unwrap();

        let header = b"P6\n2 2\n255\n";
        assert_eq!(&out[..header.len()], header);
        assert_eq!(
            &out[header.len()..],
            &[255, 0, 0, 0, 255, 0, 0, 0, 255, 10, 20, 30]
        );
    }

    #[test]
    fn rejects_mismatched_length() {
        let mut out = Vec::new();
        assert!(write_ppm(&mut out, &[0; 12], 2, 2).is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn empty_image_is_just_a_header() {
        let mut out = Vec::new();
        write_ppm(&mut out, &[], 0, 0).unwrap();
        assert_eq!(out, b"P6\n0 0\n255\n");
    }
}
