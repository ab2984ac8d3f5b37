//! Single-file partition image
//!
//! File format:
//! ```text
//! [HEADER: 64 bytes]
//!   - magic: 8 bytes ("NVSBLOB\0")
//!   - version: 4 bytes (u32 LE)
//!   - flags: 4 bytes
//!   - entry_count: 8 bytes (u64 LE)
//!   - payload_len: 8 bytes (u64 LE)
//!   - checksum: 32 bytes (BLAKE3 of payload)
//!
//! [PAYLOAD: payload_len bytes]
//!   - zstd(bincode(Image))
//! ```
//!
//! A missing or empty file is an erased partition. Files and payloads larger
//! than the partition capacity allows are rejected before they are read or
//! decompressed in full.

use super::Flash;
use crate::nvs::Image;
use crate::{Error, Result, MAGIC, VERSION};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

const HEADER_SIZE: usize = 64;
const ZSTD_LEVEL: i32 = 3;
/// bincode framing of an image never exceeds its accounted size by more
const RAW_SLACK: usize = 64;

/// Largest decompressed image accepted for a partition of `capacity` bytes
fn raw_limit(capacity: usize) -> usize {
    capacity.saturating_add(RAW_SLACK)
}

/// Largest compressed payload accepted for a partition of `capacity` bytes
fn payload_limit(capacity: usize) -> usize {
    zstd::zstd_safe::compress_bound(raw_limit(capacity))
}

/// A partition backed by one file on disk
pub struct FileFlash {
    path: PathBuf,
    capacity: usize,
    /// Serializes access to the file
    lock: Mutex<()>,
}

impl FileFlash {
    pub fn new(path: impl AsRef<Path>, capacity: usize) -> Self {
        FileFlash {
            path: path.as_ref().to_path_buf(),
            capacity,
            lock: Mutex::new(()),
        }
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

fn encode(image: &Image) -> Result<Vec<u8>> {
    let raw = bincode::serialize(image)?;
    let payload = zstd::encode_all(raw.as_slice(), ZSTD_LEVEL)?;
    let checksum = blake3::hash(&payload);

    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&(image.entry_count() as u64).to_le_bytes());
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(checksum.as_bytes());
    debug_assert_eq!(out.len(), HEADER_SIZE);
    out.extend_from_slice(&payload);
    Ok(out)
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

fn decode(data: &[u8], capacity: usize) -> Result<Image> {
    if data.len() < HEADER_SIZE {
        return Err(Error::InvalidFile(format!(
            "Truncated header: {} bytes",
            data.len()
        )));
    }
    let (header, rest) = data.split_at(HEADER_SIZE);

    if &header[0..8] != MAGIC {
        return Err(Error::InvalidFile("Invalid magic bytes".into()));
    }

    let version = read_u32(&header[8..12]);
    if version > VERSION {
        return Err(Error::NewVersionFound {
            expected: VERSION,
            found: version,
        });
    }
    if version != VERSION {
        return Err(Error::VersionMismatch {
            expected: VERSION,
            found: version,
        });
    }

    let entry_count = read_u64(&header[16..24]);
    let payload_len = read_u64(&header[24..32]) as usize;
    if rest.len() < payload_len {
        return Err(Error::Corruption(format!(
            "Payload truncated: expected {} bytes, found {}",
            payload_len,
            rest.len()
        )));
    }
    let payload = &rest[..payload_len];

    let checksum = blake3::hash(payload);
    if checksum.as_bytes() != &header[32..64] {
        return Err(Error::Corruption(format!(
            "Checksum mismatch: header {}, payload {}",
            hex::encode(&header[32..64]),
            checksum.to_hex()
        )));
    }

    let limit = raw_limit(capacity);
    let mut raw = Vec::new();
    zstd::Decoder::new(payload)?
        .take(limit as u64 + 1)
        .read_to_end(&mut raw)?;
    if raw.len() > limit {
        warn!(limit, "partition image decompresses past capacity");
        return Err(Error::NoFreePages);
    }

    let image: Image = bincode::deserialize(&raw)?;
    if image.entry_count() as u64 != entry_count {
        return Err(Error::Corruption(format!(
            "Entry count mismatch: header {}, payload {}",
            entry_count,
            image.entry_count()
        )));
    }
    Ok(image)
}

impl Flash for FileFlash {
    fn load(&self) -> Result<Option<Image>> {
        let _guard = self.lock.lock();

        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata()?.len();
        if len == 0 {
            return Ok(None);
        }
        let limit = (HEADER_SIZE + payload_limit(self.capacity)) as u64;
        if len > limit {
            warn!(len, limit, "partition file larger than capacity allows");
            return Err(Error::NoFreePages);
        }

        let mut data = Vec::with_capacity(len as usize);
        file.take(limit + 1).read_to_end(&mut data)?;
        if data.len() as u64 > limit {
            return Err(Error::NoFreePages);
        }
        decode(&data, self.capacity).map(Some)
    }

    fn store(&self, image: &Image) -> Result<()> {
        let _guard = self.lock.lock();
        let data = encode(image)?;

        // Write beside the partition, then swap it in
        let tmp = self.temp_path();
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn erase(&self) -> Result<()> {
        let _guard = self.lock.lock();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvs::Value;
    use tempfile::tempdir;

    fn sample_image() -> Image {
        let mut image = Image::new();
        let keys = image.namespaces.entry("storage".into()).or_default();
        keys.insert("restart_counter".into(), Value::I32(3));
        keys.insert("storage_blob_1".into(), Value::Blob(vec![0xAB; 6000]));
        image
    }

    #[test]
    fn test_missing_file_is_erased() {
        let dir = tempdir().unwrap();
        let flash = FileFlash::new(dir.path().join("nvs.bin"), 1 << 20);
        assert!(flash.load().unwrap().is_none());
    }

    #[test]
    fn test_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nvs.bin");

        {
            let flash = FileFlash::new(&path, 1 << 20);
            flash.store(&sample_image()).unwrap();
        }

        {
            let flash = FileFlash::new(&path, 1 << 20);
            let loaded = flash.load().unwrap().unwrap();
            assert_eq!(loaded, sample_image());
        }
    }

    #[test]
    fn test_erase_removes_image() {
        let dir = tempdir().unwrap();
        let flash = FileFlash::new(dir.path().join("nvs.bin"), 1 << 20);
        flash.store(&sample_image()).unwrap();
        flash.erase().unwrap();
        assert!(flash.load().unwrap().is_none());
        // Erasing twice is fine
        flash.erase().unwrap();
    }

    #[test]
    fn test_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nvs.bin");
        fs::write(&path, vec![0u8; HEADER_SIZE]).unwrap();

        let flash = FileFlash::new(&path, 1 << 20);
        assert!(matches!(flash.load(), Err(Error::InvalidFile(_))));
    }

    #[test]
    fn test_newer_version_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nvs.bin");
        let flash = FileFlash::new(&path, 1 << 20);
        flash.store(&sample_image()).unwrap();

        let mut data = fs::read(&path).unwrap();
        data[8..12].copy_from_slice(&(VERSION + 1).to_le_bytes());
        fs::write(&path, data).unwrap();

        let err = flash.load().unwrap_err();
        assert!(err.is_recoverable_init());
    }

    #[test]
    fn test_older_version_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nvs.bin");
        let flash = FileFlash::new(&path, 1 << 20);
        flash.store(&sample_image()).unwrap();

        let mut data = fs::read(&path).unwrap();
        data[8..12].copy_from_slice(&0u32.to_le_bytes());
        fs::write(&path, data).unwrap();

        let err = flash.load().unwrap_err();
        assert!(matches!(
            err,
            Error::VersionMismatch {
                expected: VERSION,
                found: 0
            }
        ));
        assert!(err.is_recoverable_init());
    }

    #[test]
    fn test_truncated_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nvs.bin");
        fs::write(&path, &MAGIC[..]).unwrap();

        let flash = FileFlash::new(&path, 1 << 20);
        assert!(matches!(flash.load(), Err(Error::InvalidFile(_))));
    }

    #[test]
    fn test_truncated_payload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nvs.bin");
        let flash = FileFlash::new(&path, 1 << 20);
        flash.store(&sample_image()).unwrap();

        let mut data = fs::read(&path).unwrap();
        data.truncate(data.len() - 5);
        fs::write(&path, data).unwrap();

        assert!(matches!(flash.load(), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_entry_count_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nvs.bin");
        let flash = FileFlash::new(&path, 1 << 20);
        flash.store(&sample_image()).unwrap();

        // The checksum covers only the payload
        let mut data = fs::read(&path).unwrap();
        data[16..24].copy_from_slice(&99u64.to_le_bytes());
        fs::write(&path, data).unwrap();

        assert!(matches!(flash.load(), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_oversized_file_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nvs.bin");
        let capacity = 4096;
        let mut data = vec![0u8; HEADER_SIZE + payload_limit(capacity) + 1];
        data[0..8].copy_from_slice(MAGIC);
        fs::write(&path, data).unwrap();

        let flash = FileFlash::new(&path, capacity);
        let err = flash.load().unwrap_err();
        assert!(matches!(err, Error::NoFreePages));
        assert!(err.is_recoverable_init());
    }

    #[test]
    fn test_payload_expanding_past_capacity_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nvs.bin");

        // A megabyte of zeros compresses to a few hundred bytes
        let mut image = Image::new();
        image
            .namespaces
            .entry("storage".into())
            .or_default()
            .insert("blob".into(), Value::Blob(vec![0; 1 << 20]));
        let data = encode(&image).unwrap();
        assert!(data.len() < 4096);
        fs::write(&path, data).unwrap();

        let flash = FileFlash::new(&path, 4096);
        assert!(matches!(flash.load(), Err(Error::NoFreePages)));

        // The same file is fine on a partition big enough to hold it
        let roomy = FileFlash::new(&path, 2 << 20);
        assert_eq!(roomy.load().unwrap().unwrap(), image);
    }

    #[test]
    fn test_corrupted_payload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nvs.bin");
        let flash = FileFlash::new(&path, 1 << 20);
        flash.store(&sample_image()).unwrap();

        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        fs::write(&path, data).unwrap();

        assert!(matches!(flash.load(), Err(Error::Corruption(_))));
    }
}
