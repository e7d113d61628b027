//! JPEG marker-segment filter.
//!
//! A JPEG is a sequence of marker segments with entropy-coded scan data after
//! each SOS. The segments carrying EXIF/XMP (APP1), IPTC/Photoshop (APP13),
//! comments and other vendor blocks are dropped wherever they sit, including
//! between the scans of a progressive image. JFIF (APP0), ICC profiles
//! (APP2), the Adobe colour transform (APP14) and all coding tables are kept,
//! and scan data is copied byte for byte, so the image decodes identically.
//! Anything after the first EOI is discarded.
//!
//! The EXIF orientation tag goes with APP1; a rotated photo is shown unrotated
//! afterwards.

use tracing::debug;

use super::{CleanseError, DocumentKind};

const SOI: u8 = 0xD8;
const EOI: u8 = 0xD9;
const SOS: u8 = 0xDA;
const TEM: u8 = 0x01;
const COM: u8 = 0xFE;

fn corrupt(reason: &str) -> CleanseError {
    CleanseError::corrupt(DocumentKind::Jpeg, reason)
}

fn is_dropped(marker: u8) -> bool {
    matches!(marker, 0xE1 | 0xE3..=0xED | 0xEF | COM)
}

fn is_standalone(marker: u8) -> bool {
    matches!(marker, TEM | 0xD0..=0xD7)
}

/// End of the length-prefixed segment whose length field starts at `body_at`.
fn segment_end(bytes: &[u8], body_at: usize) -> Result<usize, CleanseError> {
    let length = bytes
        .get(body_at..body_at + 2)
        .map(|raw| usize::from(u16::from_be_bytes([raw[0], raw[1]])))
        .ok_or_else(|| corrupt("truncated segment length"))?;
    if length < 2 {
        return Err(corrupt("segment length below minimum"));
    }
    let end = body_at + length;
    if end > bytes.len() {
        return Err(corrupt("segment runs past end of file"));
    }
    Ok(end)
}

/// Where the entropy-coded data starting at `from` stops: the first marker
/// that is neither a stuffed zero nor a restart marker, or end of input.
fn scan_end(bytes: &[u8], from: usize) -> usize {
    let mut at = from;
    while at + 1 < bytes.len() {
        if bytes[at] == 0xFF && !matches!(bytes[at + 1], 0x00 | 0xD0..=0xD7) {
            return at;
        }
        at += 1;
    }
    bytes.len()
}

pub fn strip(bytes: &[u8]) -> Result<Vec<u8>, CleanseError> {
    if bytes.len() < 2 || bytes[0] != 0xFF || bytes[1] != SOI {
        return Err(corrupt("missing start-of-image marker"));
    }

    let mut out = Vec::with_capacity(bytes.len());
    out.extend_from_slice(&[0xFF, SOI]);

    let mut pos = 2;
    let mut dropped = 0usize;
    let mut scans = 0usize;
    while pos < bytes.len() {
        if bytes[pos] != 0xFF {
            return Err(corrupt("expected a marker between segments"));
        }
        // Markers may be preceded by any number of 0xFF fill bytes.
        let mut marker_at = pos + 1;
        while bytes.get(marker_at) == Some(&0xFF) {
            marker_at += 1;
        }
        let marker = *bytes
            .get(marker_at)
            .ok_or_else(|| corrupt("file ends inside a marker"))?;
        let body_at = marker_at + 1;

        match marker {
            SOS => {
                let header_end = segment_end(bytes, body_at)?;
                let data_end = scan_end(bytes, header_end);
                out.extend_from_slice(&[0xFF, SOS]);
                out.extend_from_slice(&bytes[body_at..data_end]);
                scans += 1;
                pos = data_end;
            }
            EOI => {
                out.extend_from_slice(&[0xFF, EOI]);
                break;
            }
            marker if is_standalone(marker) => {
                out.extend_from_slice(&[0xFF, marker]);
                pos = body_at;
            }
            marker => {
                let end = segment_end(bytes, body_at)?;
                if is_dropped(marker) {
                    dropped += 1;
                } else {
                    out.extend_from_slice(&[0xFF, marker]);
                    out.extend_from_slice(&bytes[body_at..end]);
                }
                pos = end;
            }
        }
    }

    if scans == 0 {
        return Err(corrupt("no image scan found"));
    }

    debug!(dropped, scans, "jpeg metadata segments removed");
    Ok(out)
}
