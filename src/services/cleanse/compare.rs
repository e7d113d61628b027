//! Checks that a cleansed document still renders like the original.
//!
//! Images must decode to identical pixels. PDFs must keep every page's
//! content stream. DOCX packages must keep the same parts, byte-identical
//! media and the same visible body text.

use image::ImageFormat;
use tracing::warn;

use super::{CleanseError, DocumentKind, docx, pdf};

pub fn render_equivalent(
    kind: DocumentKind,
    original: &[u8],
    cleaned: &[u8],
) -> Result<bool, CleanseError> {
    match kind {
        DocumentKind::Png => same_pixels(kind, ImageFormat::Png, original, cleaned),
        DocumentKind::Jpeg => same_pixels(kind, ImageFormat::Jpeg, original, cleaned),
        DocumentKind::Pdf => {
            let before = pdf::page_fingerprints(original)?;
            let after = pdf::page_fingerprints(cleaned)?;
            if before != after {
                warn!(pages_before = before.len(), pages_after = after.len(), "pdf pages differ after cleansing");
            }
            Ok(before == after)
        }
        DocumentKind::Docx => same_package(original, cleaned),
    }
}

fn same_pixels(
    kind: DocumentKind,
    format: ImageFormat,
    original: &[u8],
    cleaned: &[u8],
) -> Result<bool, CleanseError> {
    let before = image::load_from_memory_with_format(original, format)
        .map_err(|err| CleanseError::corrupt(kind, err))?;
    let after = image::load_from_memory_with_format(cleaned, format)
        .map_err(|err| CleanseError::internal(kind, err))?;
    Ok(before.to_rgba8() == after.to_rgba8())
}

fn same_package(original: &[u8], cleaned: &[u8]) -> Result<bool, CleanseError> {
    let before = docx::read_parts(original)?;
    let after = docx::read_parts(cleaned)?;

    let names_match = before.len() == after.len()
        && before.iter().zip(&after).all(|(a, b)| a.name == b.name);
    if !names_match {
        warn!("docx part list changed during cleansing");
        return Ok(false);
    }

    for (a, b) in before.iter().zip(&after) {
        if !docx::is_xml_part(&a.name) && a.data != b.data {
            warn!(part = %a.name, "binary docx part changed during cleansing");
            return Ok(false);
        }
    }

    match (docx::package_text(&before), docx::package_text(&after)) {
        (Ok(a), Ok(b)) => Ok(a == b),
        // No readable body on either side; nothing visible could have changed.
        (Err(_), Err(_)) => Ok(true),
        _ => Ok(false),
    }
}
