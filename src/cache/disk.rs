//! On-disk tier: one file per key under a 2-hex-character shard directory,
//! written with a temp-file-then-rename pattern for atomicity. A stored
//! embedding is a flat little-endian `f32` array with no header — the
//! index carries the declared dimension, and a length mismatch at read
//! time is treated as corruption (file is deleted, read is a miss).

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use uuid::Uuid;

use crate::error::{EmbedError, Result};

pub struct DiskTier {
    root: PathBuf,
}

impl DiskTier {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root).map_err(|source| EmbedError::CacheDirCreate {
            path: root.to_string_lossy().into_owned(),
            source,
        })?;
        Ok(DiskTier { root })
    }

    fn shard_dir(&self, key: &str) -> PathBuf {
        self.root.join(&key[..2.min(key.len())])
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.shard_dir(key).join(format!("{key}.bin"))
    }

    /// Reads the embedding stored for `key`. Treats a byte length that
    /// doesn't evenly divide into `expected_dims` floats, or that divides
    /// into a different number of floats than `expected_dims`, as
    /// corruption: the file is removed and `Ok(None)` is returned.
    pub fn read(&self, key: &str, expected_dims: usize) -> Result<Option<Vec<f32>>> {
        let path = self.file_path(key);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(EmbedError::Io(e)),
        };

        if bytes.len() % 4 != 0 || bytes.len() / 4 != expected_dims {
            let _ = fs::remove_file(&path);
            return Ok(None);
        }

        let mut out = Vec::with_capacity(expected_dims);
        for chunk in bytes.chunks_exact(4) {
            let arr: [u8; 4] = match chunk.try_into() {
                Ok(a) => a,
                Err(_) => {
                    let _ = fs::remove_file(&path);
                    return Ok(None);
                }
            };
            out.push(f32::from_le_bytes(arr));
        }
        Ok(Some(out))
    }

    /// Writes `embedding` for `key` atomically, returning the byte length
    /// written (used by the index for the capacity bound).
    pub fn write(&self, key: &str, embedding: &[f32]) -> Result<u64> {
        let shard = self.shard_dir(key);
        fs::create_dir_all(&shard).map_err(|source| EmbedError::CacheDirCreate {
            path: shard.to_string_lossy().into_owned(),
            source,
        })?;

        let mut bytes = Vec::with_capacity(embedding.len() * 4);
        for v in embedding {
            bytes.extend_from_slice(&v.to_le_bytes());
        }

        let tmp_path = shard.join(format!(".tmp-{}", Uuid::new_v4()));
        {
            let mut tmp = fs::File::create(&tmp_path)?;
            tmp.write_all(&bytes)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, self.file_path(key))?;
        Ok(bytes.len() as u64)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let path = self.file_path(key);
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EmbedError::Io(e)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().expect("tempdir");
        let tier = DiskTier::new(dir.path().to_path_buf()).expect("tier");
        tier.write("abcdef0123456789", &[1.0, 2.0, 3.0]).expect("write");
        let got = tier.read("abcdef0123456789", 3).expect("read");
        assert_eq!(got, Some(vec![1.0, 2.0, 3.0]));
    }

    #[test]
    fn dimension_mismatch_deletes_and_returns_none() {
        let dir = tempdir().expect("tempdir");
        let tier = DiskTier::new(dir.path().to_path_buf()).expect("tier");
        tier.write("abcdef0123456789", &[1.0, 2.0, 3.0]).expect("write");
        let got = tier.read("abcdef0123456789", 4).expect("read");
        assert_eq!(got, None);
        // corrupt/mismatched file must have been removed
        assert_eq!(tier.read("abcdef0123456789", 3).expect("read again"), None);
    }

    #[test]
    fn missing_key_is_a_clean_miss() {
        let dir = tempdir().expect("tempdir");
        let tier = DiskTier::new(dir.path().to_path_buf()).expect("tier");
        assert_eq!(tier.read("0000000000000000", 3).expect("read"), None);
    }
}
