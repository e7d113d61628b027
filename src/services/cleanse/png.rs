//! PNG chunk filter. Text, EXIF and timestamp chunks are dropped; image data,
//! palette, gamma and the embedded ICC profile are kept so colours do not shift.

use tracing::debug;

use super::{CleanseError, DocumentKind};

const SIGNATURE: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
const DROPPED_CHUNKS: [&[u8; 4]; 5] = [b"tEXt", b"zTXt", b"iTXt", b"eXIf", b"tIME"];

fn corrupt(reason: &str) -> CleanseError {
    CleanseError::corrupt(DocumentKind::Png, reason)
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let raw: [u8; 4] = bytes.get(at..at + 4)?.try_into().ok()?;
    Some(u32::from_be_bytes(raw))
}

pub fn strip(bytes: &[u8]) -> Result<Vec<u8>, CleanseError> {
    if !bytes.starts_with(SIGNATURE) {
        return Err(corrupt("missing PNG signature"));
    }

    let mut out = Vec::with_capacity(bytes.len());
    out.extend_from_slice(SIGNATURE);

    let mut pos = SIGNATURE.len();
    let mut dropped = 0usize;
    loop {
        let length = read_u32(bytes, pos).ok_or_else(|| corrupt("truncated chunk header"))? as usize;
        let chunk_type = bytes
            .get(pos + 4..pos + 8)
            .ok_or_else(|| corrupt("truncated chunk header"))?;
        // length + type + data + crc
        let end = pos
            .checked_add(12)
            .and_then(|n| n.checked_add(length))
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| corrupt("chunk runs past end of file"))?;

        if DROPPED_CHUNKS.iter().any(|dropped| dropped.as_slice() == chunk_type) {
            dropped += 1;
        } else {
            out.extend_from_slice(&bytes[pos..end]);
        }
        pos = end;

        if chunk_type == b"IEND" {
            break;
        }
    }

    if pos < bytes.len() {
        debug!(trailing = bytes.len() - pos, "discarding data after IEND");
    }
    debug!(dropped, "png metadata chunks removed");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn crc32(data: &[u8]) -> u32 {
        let mut crc = 0xFFFF_FFFFu32;
        for &byte in data {
            crc ^= u32::from(byte);
            for _ in 0..8 {
                let mask = (crc & 1).wrapping_neg();
                crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
            }
        }
        !crc
    }

    fn chunk(kind: &[u8; 4], data: &[u8]) -> Vec<u8> {
        let mut out = (data.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(kind);
        out.extend_from_slice(data);
        let mut crc_input = kind.to_vec();
        crc_input.extend_from_slice(data);
        out.extend_from_slice(&crc32(&crc_input).to_be_bytes());
        out
    }

    fn png_with_text() -> Vec<u8> {
        let img = image::RgbImage::from_fn(4, 4, |x, y| image::Rgb([x as u8 * 60, y as u8 * 60, 90]));
        let mut encoded = Cursor::new(Vec::new());
        img.write_to(&mut encoded, image::ImageFormat::Png).unwrap();
        let encoded = encoded.into_inner();

        // Signature (8) + IHDR chunk (25).
        let (head, tail) = encoded.split_at(33);
        let mut out = head.to_vec();
        out.extend(chunk(b"tEXt", b"Author\0Alice Author"));
        out.extend(chunk(b"tIME", &[0x07, 0xE8, 1, 2, 3, 4, 5]));
        out.extend_from_slice(tail);
        out
    }

    #[test]
    fn drops_text_and_time_chunks() {
        let original = png_with_text();
        let cleaned = strip(&original).unwrap();
        assert!(cleaned.len() < original.len());
        assert!(!cleaned.windows(6).any(|w| w == b"Author"));
        assert!(!cleaned.windows(4).any(|w| w == b"tIME"));
        assert!(cleaned.windows(4).any(|w| w == b"IDAT"));
    }

    #[test]
    fn pixels_are_untouched() {
        let original = png_with_text();
        let cleaned = strip(&original).unwrap();
        let a = image::load_from_memory(&original).unwrap().to_rgba8();
        let b = image::load_from_memory(&cleaned).unwrap().to_rgba8();
        assert_eq!(a, b);
    }

    #[test]
    fn truncated_file_is_corrupt() {
        let original = png_with_text();
        assert!(matches!(
            strip(&original[..original.len() - 6]),
            Err(CleanseError::Corrupt { .. })
        ));
    }
}
