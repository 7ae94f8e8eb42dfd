use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use dicom_object::{from_reader, DefaultDicomObject, OpenFileOptions, Tag};
use dicom_pixeldata::PixelDecoder;

/// Decoded pixel planes, one entry per frame.
#[derive(Debug, Clone)]
pub enum FramePixels {
    Mono(Vec<Arc<[i32]>>),
    Rgb {
        samples_per_pixel: u16,
        frames: Vec<Arc<[u8]>>,
    },
}

#[derive(Debug, Clone)]
pub struct DicomImage {
    pub width: usize,
    pub height: usize,
    pub pixels: FramePixels,
    pub invert: bool,
    pub window_center: f32,
    pub window_width: f32,
}

impl DicomImage {
    pub fn frame_count(&self) -> usize {
        match &self.pixels {
            FramePixels::Mono(frames) => frames.len(),
            FramePixels::Rgb { frames, .. } => frames.len(),
        }
    }
}

/// Header fields read without touching pixel data. Used to size stacks of
/// locally opened files before any frame is decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHeader {
    pub sop_instance_uid: Option<String>,
    pub frame_count: usize,
    pub modality: Option<String>,
    pub series_description: Option<String>,
}

const PIXEL_DATA: Tag = Tag(0x7FE0, 0x0010);

pub fn read_instance_header(path: &Path) -> Result<InstanceHeader> {
    let obj = OpenFileOptions::new()
        .read_until(PIXEL_DATA)
        .open_file(path)
        .with_context(|| format!("Could not open {}", path.display()))?;
    Ok(InstanceHeader {
        sop_instance_uid: read_string(&obj, "SOPInstanceUID"),
        frame_count: read_frame_count(&obj)?,
        modality: read_string(&obj, "Modality"),
        series_description: read_string(&obj, "SeriesDescription"),
    })
}

/// Decodes a Part 10 stream as served by the backend, with or without the
/// 128-byte preamble.
pub fn decode_dicom_bytes(bytes: &[u8]) -> Result<DicomImage> {
    let Some(offset) = magic_offset(bytes) else {
        bail!("Not a DICOM file: missing DICM marker");
    };
    let obj =
        from_reader(Cursor::new(&bytes[offset..])).context("Could not parse DICOM data set")?;
    decode_object(&obj)
}

fn decode_object(obj: &DefaultDicomObject) -> Result<DicomImage> {
    let width: usize = obj
        .element_by_name("Columns")
        .context("Missing Columns tag")?
        .to_int()
        .context("Invalid Columns value")?;
    let height: usize = obj
        .element_by_name("Rows")
        .context("Missing Rows tag")?
        .to_int()
        .context("Invalid Rows value")?;
    let frame_count = read_frame_count(obj)?;

    let photometric = read_string(obj, "PhotometricInterpretation")
        .unwrap_or_else(|| "MONOCHROME2".to_string());
    let invert = photometric.eq_ignore_ascii_case("MONOCHROME1");

    let decoded = obj.decode_pixel_data().context("Failed to decode PixelData")?;
    if decoded.columns() as usize != width || decoded.rows() as usize != height {
        bail!(
            "Decoded frame dimensions mismatch: decoded={}x{}, tags={}x{}",
            decoded.columns(),
            decoded.rows(),
            width,
            height
        );
    }
    let bits_allocated = decoded.bits_allocated();
    if bits_allocated != 8 && bits_allocated != 16 {
        bail!("BitsAllocated={bits_allocated} is not supported (only 8/16)");
    }
    let frame_count = frame_count.min(decoded.number_of_frames().max(1) as usize);
    let samples_per_pixel = decoded.samples_per_pixel();

    match samples_per_pixel {
        1 => {
            let mut frames = Vec::with_capacity(frame_count);
            for frame_index in 0..frame_count {
                let samples: Vec<i32> = decoded
                    .to_vec_frame(frame_index as u32)
                    .with_context(|| format!("Could not convert frame {frame_index} to i32"))?;
                if samples.len() != width * height {
                    bail!(
                        "Decoded pixel count mismatch in frame {frame_index}: got {}, expected {}",
                        samples.len(),
                        width * height
                    );
                }
                frames.push(Arc::<[i32]>::from(samples.into_boxed_slice()));
            }

            let (min_value, max_value) = frames
                .first()
                .and_then(|frame| min_max(frame))
                .context("No pixels available for rendering")?;
            let window_center = read_float_first(obj, "WindowCenter")
                .unwrap_or_else(|| (min_value + max_value) as f32 / 2.0);
            let window_width = read_float_first(obj, "WindowWidth")
                .unwrap_or_else(|| (max_value - min_value).max(1) as f32);

            Ok(DicomImage {
                width,
                height,
                pixels: FramePixels::Mono(frames),
                invert,
                window_center,
                window_width: window_width.max(1.0),
            })
        }
        spp if spp >= 3 => {
            let expected_len = width
                .checked_mul(height)
                .and_then(|v| v.checked_mul(spp as usize))
                .context("Overflow while calculating color frame size")?;
            let bits_shift = decoded.bits_stored().saturating_sub(8);
            let mut frames = Vec::with_capacity(frame_count);
            for frame_index in 0..frame_count {
                let samples: Vec<u8> = if bits_allocated == 8 {
                    decoded
                        .to_vec_frame(frame_index as u32)
                        .with_context(|| format!("Could not convert frame {frame_index} to u8"))?
                } else {
                    let wide: Vec<u16> = decoded
                        .to_vec_frame(frame_index as u32)
                        .with_context(|| format!("Could not convert frame {frame_index} to u16"))?;
                    wide.into_iter()
                        .map(|sample| (sample >> bits_shift) as u8)
                        .collect()
                };
                if samples.len() != expected_len {
                    bail!(
                        "Color pixel count mismatch in frame {frame_index}: got {}, expected {}",
                        samples.len(),
                        expected_len
                    );
                }
                frames.push(Arc::<[u8]>::from(samples.into_boxed_slice()));
            }

            Ok(DicomImage {
                width,
                height,
                pixels: FramePixels::Rgb {
                    samples_per_pixel: spp,
                    frames,
                },
                invert: false,
                window_center: 127.5,
                window_width: 255.0,
            })
        }
        other => bail!(
            "Unsupported SamplesPerPixel={other} (supports 1 for monochrome and >=3 for color)"
        ),
    }
}

fn magic_offset(bytes: &[u8]) -> Option<usize> {
    if bytes.len() >= 132 && &bytes[128..132] == b"DICM" {
        return Some(128);
    }
    if bytes.len() >= 4 && &bytes[..4] == b"DICM" {
        return Some(0);
    }
    None
}

fn read_frame_count(obj: &DefaultDicomObject) -> Result<usize> {
    match read_int_first(obj, "NumberOfFrames") {
        Some(value) if value > 0 => Ok(value as usize),
        Some(value) => bail!("Invalid NumberOfFrames={value} (must be >= 1)"),
        None => Ok(1),
    }
}

fn read_string(obj: &DefaultDicomObject, name: &str) -> Option<String> {
    obj.element_by_name(name)
        .ok()
        .and_then(|el| el.to_str().ok())
        .map(|v| v.trim_end_matches('\0').trim().to_string())
        .filter(|v| !v.is_empty())
}

fn read_float_first(obj: &DefaultDicomObject, name: &str) -> Option<f32> {
    read_string(obj, name).and_then(|value| parse_multi_valued_number(&value))
}

fn read_int_first(obj: &DefaultDicomObject, name: &str) -> Option<i32> {
    read_string(obj, name)
        .and_then(|value| value.split('\\').next().and_then(|v| v.trim().parse().ok()))
}

fn parse_multi_valued_number(value: &str) -> Option<f32> {
    value.split('\\').next()?.trim().parse::<f32>().ok()
}

fn min_max(values: &[i32]) -> Option<(i32, i32)> {
    let first = *values.first()?;
    Some(
        values
            .iter()
            .fold((first, first), |(lo, hi), &v| (lo.min(v), hi.max(v))),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_found_with_and_without_preamble() {
        let mut with_preamble = vec![0u8; 128];
        with_preamble.extend_from_slice(b"DICM\x02\x00");
        assert_eq!(magic_offset(&with_preamble), Some(128));
        assert_eq!(magic_offset(b"DICM\x02\x00\x00\x00"), Some(0));
        assert_eq!(magic_offset(b"not dicom"), None);
    }

    #[test]
    fn garbage_bytes_are_rejected_with_context() {
        let err = decode_dicom_bytes(b"<html>404</html>").expect_err("must fail");
        assert!(err.to_string().contains("DICM"));

        let mut truncated = vec![0u8; 128];
        truncated.extend_from_slice(b"DICM");
        assert!(decode_dicom_bytes(&truncated).is_err());
    }

    #[test]
    fn multi_valued_window_takes_first_value() {
        assert_eq!(parse_multi_valued_number("40\\400"), Some(40.0));
        assert_eq!(parse_multi_valued_number(" 1024.5 "), Some(1024.5));
        assert_eq!(parse_multi_valued_number("abc"), None);
    }

    #[test]
    fn min_max_scans_every_sample() {
        assert_eq!(min_max(&[5, -3, 12, 0]), Some((-3, 12)));
        assert_eq!(min_max(&[]), None);
    }

    #[test]
    fn missing_file_reports_path() {
        let path =
            std::env::temp_dir().join(format!("radview-missing-{}.dcm", std::process::id()));
        let err = read_instance_header(&path).expect_err("missing file");
        assert!(err.to_string().contains("radview-missing"));
    }
}
