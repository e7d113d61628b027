//! Format detection and metadata stripping for the supported document kinds.
//!
//! Every transformation works on an in-memory byte buffer and is CPU-bound;
//! callers on the async runtime should run it via `spawn_blocking`.

pub mod compare;
pub mod docx;
pub mod jpeg;
pub mod pdf;
pub mod png;

use std::fmt;
use std::io::Cursor;
use thiserror::Error;
use tracing::debug;

const PDF_MAGIC: &[u8] = b"%PDF-";
const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF];
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// A document format this service knows how to cleanse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    Docx,
    Pdf,
    Png,
    Jpeg,
}

impl DocumentKind {
    /// Identify a document by its leading bytes.
    ///
    /// ZIP containers count as DOCX only when they hold `word/document.xml`.
    /// A ZIP that cannot be opened at all is still treated as DOCX when the
    /// key says so, so the damage is reported instead of silently skipped.
    pub fn detect(bytes: &[u8], key: &str) -> Option<Self> {
        if bytes.starts_with(PDF_MAGIC) {
            return Some(Self::Pdf);
        }
        if bytes.starts_with(PNG_MAGIC) {
            return Some(Self::Png);
        }
        if bytes.starts_with(JPEG_MAGIC) {
            return Some(Self::Jpeg);
        }

        let docx_suffix = key.to_ascii_lowercase().ends_with(".docx");
        if bytes.starts_with(ZIP_MAGIC) {
            return match zip::ZipArchive::new(Cursor::new(bytes)) {
                Ok(archive) if docx::is_word_package(&archive) => Some(Self::Docx),
                Ok(_) => None,
                Err(err) => {
                    debug!(key, error = %err, "zip header present but archive unreadable");
                    docx_suffix.then_some(Self::Docx)
                }
            };
        }

        None
    }

    /// The format's registered MIME type.
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            Self::Pdf => "application/pdf",
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
        }
    }

    /// Content type written back to the store.
    ///
    /// DOCX is stored as opaque bytes: with its real MIME type, browsers
    /// following a signed URL hand the file to an online viewer that cannot
    /// reach it, instead of downloading it.
    pub fn stored_content_type(self) -> &'static str {
        match self {
            Self::Docx => "binary/octet-stream",
            other => other.mime_type(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Docx => "DOCX",
            Self::Pdf => "PDF",
            Self::Png => "PNG",
            Self::Jpeg => "JPEG",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error)]
pub enum CleanseError {
    #[error("unsupported {kind} document: {reason}")]
    Unsupported { kind: DocumentKind, reason: String },

    #[error("corrupt {kind} document: {reason}")]
    Corrupt { kind: DocumentKind, reason: String },

    #[error("{kind} document does not look the same after cleansing")]
    VisuallyDifferent { kind: DocumentKind },

    #[error("failed to write cleansed {kind} document: {reason}")]
    Internal { kind: DocumentKind, reason: String },
}

impl CleanseError {
    pub(crate) fn corrupt(kind: DocumentKind, reason: impl fmt::Display) -> Self {
        Self::Corrupt {
            kind,
            reason: reason.to_string(),
        }
    }

    pub(crate) fn internal(kind: DocumentKind, reason: impl fmt::Display) -> Self {
        Self::Internal {
            kind,
            reason: reason.to_string(),
        }
    }

    /// Retrying the same bytes cannot change the outcome.
    pub fn is_permanent(&self) -> bool {
        !matches!(self, Self::Internal { .. })
    }
}

/// Strip identity metadata from `bytes`.
pub fn cleanse(kind: DocumentKind, bytes: &[u8]) -> Result<Vec<u8>, CleanseError> {
    match kind {
        DocumentKind::Docx => docx::strip(bytes),
        DocumentKind::Pdf => pdf::strip(bytes),
        DocumentKind::Png => png::strip(bytes),
        DocumentKind::Jpeg => jpeg::strip(bytes),
    }
}

/// Cleanse, then refuse the output unless it renders the same as the input.
pub fn cleanse_verified(kind: DocumentKind, bytes: &[u8]) -> Result<Vec<u8>, CleanseError> {
    let cleaned = cleanse(kind, bytes)?;
    if !compare::render_equivalent(kind, bytes, &cleaned)? {
        return Err(CleanseError::VisuallyDifferent { kind });
    }
    Ok(cleaned)
}

/// Up to the first five bytes, for log lines about unrecognised files.
pub fn leading_bytes(bytes: &[u8]) -> String {
    format!("{:?}", &bytes[..bytes.len().min(5)])
}
