//! Synchronous host functions exposed to guests under the `apilib` namespace.
//!
//! `sleep` blocks while the caller holds its instance lock, so every other
//! call for the same identity waits behind it. Scripts use this as
//! per-identity backpressure; calls for other identities are unaffected.

use std::io::{Cursor, Read};
use std::time::Duration;

use flate2::read::GzDecoder;
use rhai::{Array, Blob, Dynamic, INT, Map, Module, Shared};
use serde::Serialize;
use thiserror::Error;

use crate::buffer::{bytes_from_guest_buffer, is_buffer};
use crate::error::{GuestResult, guest_error};

pub const NAMESPACE: &str = "apilib";

#[derive(Debug, Error)]
pub enum HostApiError {
    #[error("decode error: {0}")]
    Decode(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One file expanded from an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveEntry {
    pub name: String,
    pub data: Vec<u8>,
}

pub fn sleep_millis(millis: INT) {
    let millis = u64::try_from(millis).unwrap_or(0);
    std::thread::sleep(Duration::from_millis(millis));
}

/// Decompress one gzip stream.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, HostApiError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| HostApiError::Decode(format!("gzip: {e}")))?;
    Ok(out)
}

/// Expand a zip archive into its entries, in archive order.
///
/// Directory entries are kept with empty `data`.
pub fn extract_archive(data: &[u8]) -> Result<Vec<ArchiveEntry>, HostApiError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data))
        .map_err(|e| HostApiError::Decode(format!("zip: {e}")))?;

    let mut entries = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let mut file = archive
            .by_index(index)
            .map_err(|e| HostApiError::Decode(format!("zip entry {index}: {e}")))?;
        let name = file.name().to_string();
        let mut contents = Vec::new();
        if !file.is_dir() {
            file.read_to_end(&mut contents)?;
        }
        entries.push(ArchiveEntry {
            name,
            data: contents,
        });
    }
    Ok(entries)
}

/// Accept either a blob or a guest buffer object.
fn input_bytes(value: &Dynamic) -> GuestResult<Vec<u8>> {
    if let Some(bytes) = value.read_lock::<Blob>() {
        return Ok(bytes.clone());
    }
    if is_buffer(value) {
        return bytes_from_guest_buffer(value).map_err(guest_error);
    }
    Err(guest_error(format!(
        "TypeError: expected bytes or a buffer, got {}",
        value.type_name()
    )))
}

/// Build the `apilib` module. Built once and shared by every instance.
pub fn module() -> Shared<Module> {
    let mut module = Module::new();

    module.set_native_fn("sleep", |millis: INT| -> GuestResult<()> {
        sleep_millis(millis);
        Ok(())
    });

    module.set_native_fn("ungzip", |data: Dynamic| -> GuestResult<Blob> {
        let input = input_bytes(&data)?;
        decompress(&input).map_err(guest_error)
    });

    module.set_native_fn("unzip", |data: Dynamic| -> GuestResult<Array> {
        let input = input_bytes(&data)?;
        let entries = extract_archive(&input).map_err(guest_error)?;
        Ok(entries
            .into_iter()
            .map(|entry| {
                let mut item = Map::new();
                item.insert("name".into(), entry.name.into());
                item.insert("data".into(), Dynamic::from_blob(entry.data));
                Dynamic::from_map(item)
            })
            .collect())
    });

    module.build_index();
    module.into()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::GzEncoder;
    use zip::write::SimpleFileOptions;

    use super::*;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn zip_of(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in files {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn decompress_round_trips_gzip() {
        let payload = b"temperature=21.5;humidity=40".repeat(20);
        assert_eq!(decompress(&gzip(&payload)).unwrap(), payload);
    }

    #[test]
    fn decompress_rejects_garbage() {
        let err = decompress(b"definitely not gzip").unwrap_err();
        assert!(matches!(err, HostApiError::Decode(_)));
    }

    #[test]
    fn extract_keeps_archive_order() {
        let archive = zip_of(&[("b.txt", b"second"), ("a.txt", b"first"), ("empty", b"")]);
        let entries = extract_archive(&archive).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["b.txt", "a.txt", "empty"]);
        assert_eq!(entries[0].data, b"second");
        assert!(entries[2].data.is_empty());
    }

    #[test]
    fn extract_keeps_directory_entries() {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer.add_directory("dir/", SimpleFileOptions::default()).unwrap();
        writer.start_file("dir/a.txt", SimpleFileOptions::default()).unwrap();
        writer.write_all(b"alpha").unwrap();
        let archive = writer.finish().unwrap().into_inner();

        let entries = extract_archive(&archive).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["dir/", "dir/a.txt"]);
        assert!(entries[0].data.is_empty());
        assert_eq!(entries[1].data, b"alpha");
    }

    #[test]
    fn corrupt_entry_data_is_an_io_error() {
        let contents = b"checksummed contents";
        let stored = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer.start_file("a.txt", stored).unwrap();
        writer.write_all(contents).unwrap();
        let mut archive = writer.finish().unwrap().into_inner();

        let at = archive
            .windows(contents.len())
            .position(|w| w == contents)
            .unwrap();
        archive[at] ^= 0xff;
        assert!(matches!(extract_archive(&archive), Err(HostApiError::Io(_))));
    }

    #[test]
    fn extract_rejects_garbage() {
        assert!(matches!(
            extract_archive(b"PK but not really"),
            Err(HostApiError::Decode(_))
        ));
    }

    #[test]
    fn negative_sleep_returns_immediately() {
        let start = std::time::Instant::now();
        sleep_millis(-5_000);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
