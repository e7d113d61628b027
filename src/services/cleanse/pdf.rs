//! PDF metadata stripping on top of `lopdf`.
//!
//! Removes the document information dictionary fields, XMP metadata streams,
//! application private data (`PieceInfo`) and markup-annotation authors, then
//! writes the result as one fresh revision so nothing from an earlier
//! incremental update survives in the file.

use lopdf::{Document, Object, ObjectId};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{CleanseError, DocumentKind};

const INFO_FIELDS: [&[u8]; 8] = [
    b"Title",
    b"Author",
    b"Subject",
    b"Keywords",
    b"Creator",
    b"Producer",
    b"CreationDate",
    b"ModDate",
];

const HIDDEN_KEYS: [&[u8]; 2] = [b"PieceInfo", b"LastModified"];

fn load(bytes: &[u8]) -> Result<Document, CleanseError> {
    let doc = Document::load_mem(bytes).map_err(|err| CleanseError::corrupt(DocumentKind::Pdf, err))?;
    if doc.is_encrypted() {
        return Err(CleanseError::Unsupported {
            kind: DocumentKind::Pdf,
            reason: "encrypted documents cannot be rewritten".into(),
        });
    }
    Ok(doc)
}

pub fn strip(bytes: &[u8]) -> Result<Vec<u8>, CleanseError> {
    let mut doc = load(bytes)?;

    let removed = clean_info_dict(&mut doc)
        + clean_xmp_metadata(&mut doc)
        + remove_hidden_data(&mut doc)
        + remove_annotation_authors(&mut doc);

    // A fresh save writes a single cross-reference section.
    doc.trailer.remove(b"Prev");
    doc.trailer.remove(b"XRefStm");
    let pruned = doc.prune_objects();
    debug!(removed, pruned = pruned.len(), "pdf metadata stripped");

    let mut out = Vec::with_capacity(bytes.len());
    doc.save_to(&mut out)
        .map_err(|err| CleanseError::internal(DocumentKind::Pdf, err))?;
    Ok(out)
}

fn catalog_id(doc: &Document) -> Option<ObjectId> {
    match doc.trailer.get(b"Root") {
        Ok(Object::Reference(id)) => Some(*id),
        _ => None,
    }
}

fn clean_info_dict(doc: &mut Document) -> usize {
    let mut removed = 0;

    let info_id = match doc.trailer.get_mut(b"Info") {
        Ok(Object::Reference(id)) => *id,
        Ok(Object::Dictionary(info)) => {
            for field in INFO_FIELDS {
                removed += usize::from(info.remove(field).is_some());
            }
            if info.is_empty() {
                doc.trailer.remove(b"Info");
            }
            return removed;
        }
        _ => return removed,
    };

    if let Ok(Object::Dictionary(info)) = doc.get_object_mut(info_id) {
        for field in INFO_FIELDS {
            removed += usize::from(info.remove(field).is_some());
        }
        if info.is_empty() {
            doc.trailer.remove(b"Info");
            doc.objects.remove(&info_id);
        }
    }

    removed
}

/// Drop `/Metadata` streams from the catalog and from every page.
fn clean_xmp_metadata(doc: &mut Document) -> usize {
    let mut owners: Vec<ObjectId> = doc.page_iter().collect();
    owners.extend(catalog_id(doc));

    let mut streams = Vec::new();
    for owner in owners {
        if let Ok(Object::Dictionary(dict)) = doc.get_object_mut(owner) {
            if let Some(Object::Reference(id)) = dict.remove(b"Metadata") {
                streams.push(id);
            }
        }
    }

    for id in &streams {
        doc.objects.remove(id);
    }
    streams.len()
}

fn remove_hidden_data(doc: &mut Document) -> usize {
    let mut owners: Vec<ObjectId> = doc.page_iter().collect();
    owners.extend(catalog_id(doc));

    let mut removed = 0;
    for owner in owners {
        if let Ok(Object::Dictionary(dict)) = doc.get_object_mut(owner) {
            for key in HIDDEN_KEYS {
                removed += usize::from(dict.remove(key).is_some());
            }
        }
    }
    removed
}

fn annotation_ids(doc: &Document, annots: &Object) -> Vec<ObjectId> {
    let array = match annots {
        Object::Reference(id) => match doc.get_object(*id) {
            Ok(Object::Array(array)) => array,
            _ => return Vec::new(),
        },
        Object::Array(array) => array,
        _ => return Vec::new(),
    };
    array
        .iter()
        .filter_map(|item| item.as_reference().ok())
        .collect()
}

/// Remove `/T` (the author, for markup annotations) everywhere except form
/// widgets, where `/T` is the field name.
fn remove_annotation_authors(doc: &mut Document) -> usize {
    let mut ids = Vec::new();
    for page_id in doc.page_iter() {
        if let Ok(page) = doc.get_dictionary(page_id) {
            if let Ok(annots) = page.get(b"Annots") {
                ids.extend(annotation_ids(doc, annots));
            }
        }
    }

    let mut removed = 0;
    for id in ids {
        if let Ok(Object::Dictionary(annot)) = doc.get_object_mut(id) {
            let subtype = annot.get(b"Subtype").and_then(Object::as_name);
            if matches!(subtype, Ok(b"Widget") | Ok(b"Link")) {
                continue;
            }
            removed += usize::from(annot.remove(b"T").is_some());
        }
    }
    removed
}

/// SHA-256 per page over the decoded content stream and media box, in page order.
pub fn page_fingerprints(bytes: &[u8]) -> Result<Vec<String>, CleanseError> {
    let doc = load(bytes)?;
    doc.get_pages()
        .into_values()
        .map(|page_id| {
            let content = doc
                .get_page_content(page_id)
                .map_err(|err| CleanseError::corrupt(DocumentKind::Pdf, err))?;
            let media_box = doc
                .get_dictionary(page_id)
                .and_then(|page| page.get(b"MediaBox"))
                .map(|mb| format!("{mb:?}"))
                .unwrap_or_default();

            let mut hasher = Sha256::new();
            hasher.update(&content);
            hasher.update(media_box.as_bytes());
            Ok(hex::encode(hasher.finalize()))
        })
        .collect()
}
