//! Dotted-path access into BSON documents.

use bson::{Bson, Document};

use crate::error::{MemoryResult, MemoryStoreError};

/// Value at `path`, descending through documents and array indexes.
pub(crate) fn get_path<'a>(document: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut segments = path.split('.');
    let mut current = document.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Bson::Document(inner) => inner.get(segment)?,
            Bson::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Sets the value at `path`, creating intermediate documents as needed.
pub(crate) fn set_path(document: &mut Document, path: &str, value: Bson) -> MemoryResult<()> {
    let (parents, leaf) = match path.rsplit_once('.') {
        Some((parents, leaf)) => (Some(parents), leaf),
        None => (None, path),
    };
    let Some(parents) = parents else {
        document.insert(leaf, value);
        return Ok(());
    };
    let mut current = document;
    for segment in parents.split('.') {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Bson::Document(Document::new()));
        current = match entry {
            Bson::Document(inner) => inner,
            other => {
                return Err(MemoryStoreError::operand(
                    path,
                    format!("cannot descend into a {:?} value", other.element_type()),
                ));
            }
        };
    }
    current.insert(leaf, value);
    Ok(())
}

/// Removes and returns the value at `path`.
pub(crate) fn remove_path(document: &mut Document, path: &str) -> Option<Bson> {
    match path.rsplit_once('.') {
        None => document.remove(path),
        Some((parents, leaf)) => {
            let mut current = document;
            for segment in parents.split('.') {
                current = match current.get_mut(segment)? {
                    Bson::Document(inner) => inner,
                    _ => return None,
                };
            }
            current.remove(leaf)
        }
    }
}

/// Every string reachable from `value`, depth first.
pub(crate) fn collect_strings<'a>(value: &'a Bson, out: &mut Vec<&'a str>) {
    match value {
        Bson::String(text) => out.push(text),
        Bson::Array(items) => items.iter().for_each(|item| collect_strings(item, out)),
        Bson::Document(document) => document.values().for_each(|item| collect_strings(item, out)),
        _ => {}
    }
}
