//! DOCX (Office Open XML) author stripping.
//!
//! A DOCX is a ZIP package of XML parts. Author identity turns up in three
//! places: core/extended document properties, `w:author`/`w:initials` on
//! tracked changes and comments, and `w15:*` person records. Those values are
//! blanked in place; every other byte of the package is carried over.

use std::io::{Cursor, Read, Seek, Write};

use anyhow::Context;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::{Namespace, QName, ResolveResult};
use quick_xml::{NsReader, Writer};
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::{CleanseError, DocumentKind};

const MAIN_DOCUMENT: &str = "word/document.xml";

/// Ceiling on the summed uncompressed size of a package's entries. Sizes in
/// ZIP headers are attacker-controlled, so they are checked against this
/// before reading and every read is capped by it.
pub const MAX_UNCOMPRESSED_SIZE: u64 = 512 * 1024 * 1024;

const W_NS: &[u8] = b"http://schemas.openxmlformats.org/wordprocessingml/2006/main";
const W15_NS: &[u8] = b"http://schemas.microsoft.com/office/word/2012/wordml";
const CP_NS: &[u8] = b"http://schemas.openxmlformats.org/package/2006/metadata/core-properties";
const DC_NS: &[u8] = b"http://purl.org/dc/elements/1.1/";
const EP_NS: &[u8] =
    b"http://schemas.openxmlformats.org/officeDocument/2006/extended-properties";

/// One entry of a package, in archive order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub name: String,
    pub data: Vec<u8>,
}

pub fn is_word_package<R: Read + Seek>(archive: &ZipArchive<R>) -> bool {
    archive.file_names().any(|name| name == MAIN_DOCUMENT)
}

/// Parts whose content is XML and therefore eligible for rewriting.
pub fn is_xml_part(name: &str) -> bool {
    name.ends_with(".xml") || name.ends_with(".rels")
}

fn open(bytes: &[u8]) -> Result<ZipArchive<Cursor<&[u8]>>, CleanseError> {
    ZipArchive::new(Cursor::new(bytes))
        .map_err(|_| CleanseError::corrupt(DocumentKind::Docx, "not a valid DOCX (zip) file"))
}

/// Reads entries while tracking how much of the size ceiling is left.
struct Inflater {
    remaining: u64,
}

impl Inflater {
    fn new(limit: u64) -> Self {
        Self { remaining: limit }
    }

    fn read(&mut self, name: &str, declared: u64, entry: impl Read) -> Result<Vec<u8>, CleanseError> {
        let too_large = || {
            CleanseError::corrupt(
                DocumentKind::Docx,
                format!("{name}: package expands beyond the uncompressed size limit"),
            )
        };
        if declared > self.remaining {
            return Err(too_large());
        }

        let mut data = Vec::new();
        entry
            .take(self.remaining + 1)
            .read_to_end(&mut data)
            .map_err(|err| CleanseError::corrupt(DocumentKind::Docx, err))?;
        let read = data.len() as u64;
        if read > self.remaining {
            return Err(too_large());
        }
        self.remaining -= read;
        Ok(data)
    }
}

/// Read every file entry of the package.
pub fn read_parts(bytes: &[u8]) -> Result<Vec<Part>, CleanseError> {
    read_parts_within(bytes, MAX_UNCOMPRESSED_SIZE)
}

fn read_parts_within(bytes: &[u8], limit: u64) -> Result<Vec<Part>, CleanseError> {
    let mut archive = open(bytes)?;
    let mut parts = Vec::with_capacity(archive.len());
    let mut inflater = Inflater::new(limit);

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|err| CleanseError::corrupt(DocumentKind::Docx, err))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let data = inflater.read(&name, entry.size(), &mut entry)?;
        parts.push(Part { name, data });
    }

    Ok(parts)
}

pub fn strip(bytes: &[u8]) -> Result<Vec<u8>, CleanseError> {
    strip_within(bytes, MAX_UNCOMPRESSED_SIZE)
}

fn strip_within(bytes: &[u8], limit: u64) -> Result<Vec<u8>, CleanseError> {
    let mut archive = open(bytes)?;
    let mut writer = ZipWriter::new(Cursor::new(Vec::with_capacity(bytes.len())));
    let mut inflater = Inflater::new(limit);

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|err| CleanseError::corrupt(DocumentKind::Docx, err))?;
        let name = entry.name().to_string();

        let method = match entry.compression() {
            CompressionMethod::Stored => CompressionMethod::Stored,
            _ => CompressionMethod::Deflated,
        };
        let options = SimpleFileOptions::default().compression_method(method);

        if entry.is_dir() {
            writer
                .add_directory(name, options)
                .map_err(|err| CleanseError::internal(DocumentKind::Docx, err))?;
            continue;
        }

        let data = inflater.read(&name, entry.size(), &mut entry)?;

        let data = if is_xml_part(&name) {
            match strip_xml_part(&data) {
                Ok(Some(rewritten)) => {
                    debug!(part = %name, "redacted author metadata");
                    rewritten
                }
                Ok(None) => data,
                Err(err) => {
                    debug!(part = %name, error = %err, "part is not well-formed XML, copying unchanged");
                    data
                }
            }
        } else {
            data
        };

        writer
            .start_file(name, options)
            .map_err(|err| CleanseError::internal(DocumentKind::Docx, err))?;
        writer
            .write_all(&data)
            .map_err(|err| CleanseError::internal(DocumentKind::Docx, err))?;
    }

    let out = writer
        .finish()
        .map_err(|err| CleanseError::internal(DocumentKind::Docx, err))?;
    Ok(out.into_inner())
}

fn bound_to<'a>(resolved: &ResolveResult<'a>, ns: &[u8]) -> bool {
    matches!(resolved, ResolveResult::Bound(Namespace(bound)) if *bound == ns)
}

fn is_redacted_attribute(reader: &NsReader<&[u8]>, key: QName<'_>) -> bool {
    let (resolved, local) = reader.resolve_attribute(key);
    match local.as_ref() {
        b"author" => bound_to(&resolved, W_NS) || bound_to(&resolved, W15_NS),
        b"initials" => bound_to(&resolved, W_NS),
        b"userId" => bound_to(&resolved, W15_NS),
        _ => false,
    }
}

fn is_redacted_element(reader: &NsReader<&[u8]>, name: QName<'_>) -> bool {
    let (resolved, local) = reader.resolve_element(name);
    match local.as_ref() {
        b"lastModifiedBy" => bound_to(&resolved, CP_NS),
        b"creator" => bound_to(&resolved, DC_NS),
        b"Manager" | b"Company" => bound_to(&resolved, EP_NS),
        _ => false,
    }
}

/// Blank the identity attributes of one element. `None` when none were set.
fn redact_attributes(
    reader: &NsReader<&[u8]>,
    start: &BytesStart<'_>,
) -> anyhow::Result<Option<BytesStart<'static>>> {
    let mut redacted = false;
    let name = std::str::from_utf8(start.name().as_ref())
        .context("element name is not UTF-8")?
        .to_owned();
    let mut out = BytesStart::new(name);

    for attr in start.attributes() {
        let attr = attr.context("malformed attribute")?;
        if is_redacted_attribute(reader, attr.key) && !attr.value.is_empty() {
            out.push_attribute((attr.key.as_ref(), b"".as_slice()));
            redacted = true;
        } else {
            out.push_attribute(attr);
        }
    }

    Ok(redacted.then_some(out))
}

/// Rewrite one XML part. `Ok(None)` means nothing needed redacting and the
/// original bytes should be kept as they are.
pub fn strip_xml_part(xml: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
    let mut reader = NsReader::from_reader(xml);
    let mut writer = Writer::new(Vec::with_capacity(xml.len()));
    let mut changed = false;
    // Nesting depth inside an element whose text is being dropped.
    let mut blanking = 0usize;

    loop {
        let event = reader.read_event().context("malformed XML")?;
        match event {
            Event::Start(start) => {
                if blanking > 0 {
                    blanking += 1;
                } else if is_redacted_element(&reader, start.name()) {
                    blanking = 1;
                }
                match redact_attributes(&reader, &start)? {
                    Some(rewritten) => {
                        changed = true;
                        writer.write_event(Event::Start(rewritten))?;
                    }
                    None => writer.write_event(Event::Start(start))?,
                }
            }
            Event::Empty(start) => match redact_attributes(&reader, &start)? {
                Some(rewritten) => {
                    changed = true;
                    writer.write_event(Event::Empty(rewritten))?;
                }
                None => writer.write_event(Event::Empty(start))?,
            },
            Event::End(end) => {
                blanking = blanking.saturating_sub(1);
                writer.write_event(Event::End(end))?;
            }
            Event::Text(text) if blanking > 0 => {
                changed |= !text.is_empty();
            }
            Event::CData(data) if blanking > 0 => {
                changed |= !data.is_empty();
            }
            Event::Eof => break,
            other => writer.write_event(other)?,
        }
    }

    Ok(changed.then(|| writer.into_inner()))
}

/// The text a reader sees in the main document body, one line per paragraph.
pub fn visible_text(document_xml: &[u8]) -> anyhow::Result<String> {
    let mut reader = NsReader::from_reader(document_xml);
    let mut text = String::new();
    let mut in_run_text = false;

    loop {
        match reader.read_event().context("malformed document.xml")? {
            Event::Start(start) => {
                let (resolved, local) = reader.resolve_element(start.name());
                in_run_text = bound_to(&resolved, W_NS) && local.as_ref() == b"t";
            }
            Event::End(end) => {
                let (resolved, local) = reader.resolve_element(end.name());
                if bound_to(&resolved, W_NS) {
                    match local.as_ref() {
                        b"t" => in_run_text = false,
                        b"p" => text.push('\n'),
                        _ => {}
                    }
                }
            }
            Event::Text(run) if in_run_text => {
                text.push_str(&run.unescape().context("bad escape in w:t")?);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(text)
}

/// Visible text of the main document of a package.
pub fn package_text(parts: &[Part]) -> anyhow::Result<String> {
    let document = parts
        .iter()
        .find(|part| part.name == MAIN_DOCUMENT)
        .context("package has no word/document.xml")?;
    visible_text(&document.data)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CORE: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<cp:coreProperties xmlns:cp="http://schemas.openxmlformats.org/package/2006/metadata/core-properties" xmlns:dc="http://purl.org/dc/elements/1.1/"><dc:title>Budget</dc:title><dc:creator>Alice Author</dc:creator><cp:lastModifiedBy>Bob Editor</cp:lastModifiedBy></cp:coreProperties>"#;

    #[test]
    fn empties_creator_and_last_modified_by() {
        let out = strip_xml_part(CORE.as_bytes()).unwrap().unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("<dc:creator></dc:creator>"));
        assert!(out.contains("<cp:lastModifiedBy></cp:lastModifiedBy>"));
        assert!(out.contains("<dc:title>Budget</dc:title>"));
        assert!(!out.contains("Alice"));
        assert!(!out.contains("Bob"));
    }

    #[test]
    fn blanks_namespaced_author_attributes() {
        let xml = r#"<w:comments xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:comment w:id="0" w:author="Alice" w:initials="AA"><w:p/></w:comment></w:comments>"#;
        let out = String::from_utf8(strip_xml_part(xml.as_bytes()).unwrap().unwrap()).unwrap();
        assert!(out.contains(r#"w:author="""#));
        assert!(out.contains(r#"w:initials="""#));
        assert!(out.contains(r#"w:id="0""#));
    }

    #[test]
    fn prefix_is_resolved_through_namespace() {
        // Same local names under a foreign namespace stay untouched.
        let xml = r#"<x:root xmlns:x="urn:other"><x:item x:author="keep"/></x:root>"#;
        assert!(strip_xml_part(xml.as_bytes()).unwrap().is_none());

        // A non-standard prefix bound to the wordml namespace is still caught.
        let xml = r#"<doc xmlns:ww="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><ww:ins ww:author="Alice"/></doc>"#;
        let out = String::from_utf8(strip_xml_part(xml.as_bytes()).unwrap().unwrap()).unwrap();
        assert!(out.contains(r#"ww:author="""#));
    }

    #[test]
    fn extended_properties_manager_and_company() {
        let xml = r#"<Properties xmlns="http://schemas.openxmlformats.org/officeDocument/2006/extended-properties"><Manager>Carol</Manager><Company>Acme</Company><Pages>1</Pages></Properties>"#;
        let out = String::from_utf8(strip_xml_part(xml.as_bytes()).unwrap().unwrap()).unwrap();
        assert!(out.contains("<Manager></Manager>"));
        assert!(out.contains("<Company></Company>"));
        assert!(out.contains("<Pages>1</Pages>"));
    }

    #[test]
    fn malformed_xml_is_an_error() {
        assert!(strip_xml_part(b"<a><b></a>").is_err());
    }

    #[test]
    fn visible_text_joins_runs_per_paragraph() {
        let xml = r#"<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body><w:p><w:r><w:t>Hello </w:t></w:r><w:r><w:t>world</w:t></w:r></w:p><w:p><w:r><w:t>A &amp; B</w:t></w:r></w:p></w:body></w:document>"#;
        assert_eq!(visible_text(xml.as_bytes()).unwrap(), "Hello world\nA & B\n");
    }

    #[test]
    fn garbage_is_not_a_package() {
        assert!(matches!(
            strip(b"PK\x03\x04garbage"),
            Err(CleanseError::Corrupt { kind: DocumentKind::Docx, .. })
        ));
    }

    fn package(body: &[u8]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        writer.start_file(MAIN_DOCUMENT, stored).unwrap();
        writer.write_all(body).unwrap();
        writer.finish().unwrap().into_inner()
    }

    /// Rewrite the uncompressed size of every central directory record.
    fn claim_uncompressed_size(mut zip: Vec<u8>, size: u32) -> Vec<u8> {
        let mut at = 0;
        while let Some(found) = zip[at..].windows(4).position(|w| w == b"PK\x01\x02") {
            let record = at + found;
            zip[record + 24..record + 28].copy_from_slice(&size.to_le_bytes());
            at = record + 4;
        }
        zip
    }

    #[test]
    fn oversized_size_claim_is_corrupt_not_allocated() {
        let lying = claim_uncompressed_size(package(b"<w:document/>"), 0xFFFF_FFF0);
        for result in [strip(&lying).map(drop), read_parts(&lying).map(drop)] {
            match result {
                Err(CleanseError::Corrupt { kind: DocumentKind::Docx, reason }) => {
                    assert!(reason.contains("uncompressed size limit"), "{reason}");
                }
                other => panic!("expected a corrupt package, got {other:?}"),
            }
        }
    }

    #[test]
    fn reads_stop_at_the_limit_whatever_the_header_claims() {
        let body = vec![b'x'; 4096];
        let honest = package(&body);
        assert!(matches!(
            strip_within(&honest, 1024),
            Err(CleanseError::Corrupt { .. })
        ));
        assert_eq!(read_parts_within(&honest, 8192).unwrap()[0].data, body);

        let understated = claim_uncompressed_size(honest, 16);
        assert!(matches!(
            read_parts_within(&understated, 1024),
            Err(CleanseError::Corrupt { .. })
        ));
    }
}
