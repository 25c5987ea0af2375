//! Deterministic tar helpers.
//!
//! Every header is normalized (regular file, mode 0644, uid/gid 0, mtime 0)
//! and entries are written in name order, so the same entries always produce
//! the same bytes.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Component;

/// Entry name -> contents, ordered by name.
pub type Entries = BTreeMap<String, Vec<u8>>;

const BLOCK: u64 = 512;

/// Bytes an entry of `size` data bytes takes in an archive: one header
/// block plus the data padded to whole blocks.
#[must_use]
pub fn footprint(size: u64) -> u64 {
    BLOCK.saturating_add(size.div_ceil(BLOCK).saturating_mul(BLOCK))
}

/// Serialize `entries` into a tar archive.
///
/// # Errors
///
/// [`Error::Io`] if the tar writer fails.
pub fn write_entries(entries: &Entries) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in entries {
        let mut header = tar::Header::new_ustar();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);
        builder.append_data(&mut header, name, data.as_slice())?;
    }
    Ok(builder.into_inner()?)
}

/// Read every regular file of a tar archive.
///
/// Directory entries are skipped. The archive is rejected if an entry name
/// escapes the archive root, appears twice, or if the summed [`footprint`]
/// of the file entries exceeds `max_total` bytes.
///
/// # Errors
///
/// [`Error::MalformedBundle`] for rejected archives.
pub fn read_entries(bytes: &[u8], max_total: u64) -> Result<Entries> {
    let mut archive = tar::Archive::new(bytes);
    let mut entries = Entries::new();
    let mut total = 0u64;

    let iter = archive
        .entries()
        .map_err(|e| Error::MalformedBundle(format!("not a tar archive: {e}")))?;
    for entry in iter {
        let mut entry = entry.map_err(|e| Error::MalformedBundle(format!("tar entry: {e}")))?;
        let kind = entry.header().entry_type();
        if kind.is_dir() {
            continue;
        }
        if !kind.is_file() {
            return Err(Error::MalformedBundle(format!(
                "unsupported tar entry type {kind:?}"
            )));
        }

        let name = entry_name(&entry)?;
        let size = entry.size();
        total = total.saturating_add(footprint(size));
        if total > max_total {
            return Err(Error::MalformedBundle(format!(
                "archive contents exceed {max_total} bytes"
            )));
        }

        let mut data = Vec::with_capacity(usize::try_from(size).unwrap_or(0));
        entry
            .read_to_end(&mut data)
            .map_err(|e| Error::MalformedBundle(format!("{name}: {e}")))?;
        if entries.insert(name.clone(), data).is_some() {
            return Err(Error::MalformedBundle(format!("duplicate entry {name}")));
        }
    }
    Ok(entries)
}

fn entry_name(entry: &tar::Entry<'_, &[u8]>) -> Result<String> {
    let path = entry
        .path()
        .map_err(|e| Error::MalformedBundle(format!("entry name: {e}")))?;
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(
                part.to_str()
                    .ok_or_else(|| Error::MalformedBundle("non UTF-8 entry name".into()))?,
            ),
            Component::CurDir => {}
            _ => {
                return Err(Error::MalformedBundle(format!(
                    "entry {} escapes the archive",
                    path.display()
                )));
            }
        }
    }
    if parts.is_empty() {
        return Err(Error::MalformedBundle("empty entry name".into()));
    }
    Ok(parts.join("/"))
}

/// Take a required entry out of `entries`.
///
/// # Errors
///
/// [`Error::MalformedBundle`] if it is missing.
pub fn take(entries: &mut Entries, name: &str) -> Result<Vec<u8>> {
    entries
        .remove(name)
        .ok_or_else(|| Error::MalformedBundle(format!("missing {name}")))
}

/// Take a required UTF-8 entry, trimmed.
///
/// # Errors
///
/// [`Error::MalformedBundle`] if it is missing or not UTF-8.
pub fn take_text(entries: &mut Entries, name: &str) -> Result<String> {
    let bytes = take(entries, name)?;
    String::from_utf8(bytes)
        .map(|s| s.trim().to_owned())
        .map_err(|_| Error::MalformedBundle(format!("{name} is not UTF-8")))
}
