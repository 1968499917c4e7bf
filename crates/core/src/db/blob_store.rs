use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use atp_lib::hash::{hash_bytes, hash_file, is_valid_hex_hash, Hash};
use tempfile::NamedTempFile;

use crate::error::StoreError;

/// Content-addressed file store: each blob lives at `<root>/<hex digest
/// of its contents>`.
///
/// Writes go through a temp file in the same directory and are renamed
/// into place, so a partial blob is never visible under its final name.
/// Clones share the same directory; blob files are immutable once
/// published, which makes concurrent readers and writers safe.
#[derive(Clone, Debug)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = path.as_ref();
        fs::create_dir_all(root)
            .with_context(|| format!("could not create blob directory: {}", root.display()))?;
        Ok(Self { root: root.to_path_buf() })
    }

    pub fn path_for(&self, hash: &Hash) -> PathBuf {
        self.root.join(hash.to_hex())
    }

    /// Store `bytes`, returning their digest. Storing bytes that are
    /// already present keeps the existing blob.
    pub fn put(&self, bytes: &[u8]) -> Result<Hash, StoreError> {
        let hash = hash_bytes(bytes);
        let target = self.path_for(&hash);
        if target.exists() {
            return Ok(hash);
        }

        let mut temp = NamedTempFile::new_in(&self.root)?;
        temp.write_all(bytes)?;
        // A concurrent put of the same bytes wrote identical contents,
        // so clobbering on rename is harmless.
        temp.persist(&target).map_err(|e| e.error)?;
        Ok(hash)
    }

    /// Copy the file at `source` into the store, returning its digest.
    pub fn put_file(&self, source: &Path) -> Result<Hash, StoreError> {
        let hash = hash_file(source)?;
        let target = self.path_for(&hash);
        if target.exists() {
            return Ok(hash);
        }

        let temp = NamedTempFile::new_in(&self.root)?;
        fs::copy(source, temp.path())?;
        temp.persist(&target).map_err(|e| e.error)?;
        Ok(hash)
    }

    pub fn open_blob(&self, hash: &Hash) -> Result<Option<File>, StoreError> {
        match File::open(self.path_for(hash)) {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn read(&self, hash: &Hash) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.path_for(hash)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn size(&self, hash: &Hash) -> Result<Option<u64>, StoreError> {
        match fs::metadata(self.path_for(hash)) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Best-effort removal; missing blobs are not an error.
    pub fn delete(&self, hash: &Hash) -> bool {
        match fs::remove_file(self.path_for(hash)) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                log::debug!("Attempt to delete blob {hash} failed: {e}");
                false
            }
        }
    }

    /// Every entry in the store directory whose name is a canonical hex
    /// digest. Anything else (in-flight temp files, strays) is skipped.
    pub fn hash_named_files(&self) -> Result<Vec<Hash>, StoreError> {
        let mut hashes = Vec::new();
        for entry in fs::read_dir(&self.root)
            .with_context(|| format!("unable to read blob directory: {}", self.root.display()))?
        {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if is_valid_hex_hash(name) {
                hashes.push(Hash::from_hex(name)?);
            }
        }
        Ok(hashes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atp_lib::error::ResultTest;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const TEST_DATA1: &[u8; 21] = b"this is a byte string";
    const TEST_DATA2: &[u8; 26] = b"this is also a byte string";

    fn setup() -> ResultTest<(BlobStore, TempDir)> {
        let tmp_dir = TempDir::with_prefix("blobstore_test")?;
        let store = BlobStore::open(tmp_dir.path())?;
        Ok((store, tmp_dir))
    }

    #[test]
    fn test_put_and_read() -> ResultTest<()> {
        let (store, _tmp_dir) = setup()?;

        let hash1 = store.put(TEST_DATA1)?;
        let hash2 = store.put(TEST_DATA2)?;

        assert_eq!(store.read(&hash1)?.unwrap(), TEST_DATA1.to_vec());
        assert_eq!(store.read(&hash2)?.unwrap(), TEST_DATA2.to_vec());
        assert_eq!(store.size(&hash1)?, Some(TEST_DATA1.len() as u64));
        Ok(())
    }

    #[test]
    fn test_put_is_idempotent() -> ResultTest<()> {
        let (store, tmp_dir) = setup()?;

        let hash1 = store.put(TEST_DATA1)?;
        let hash2 = store.put(TEST_DATA1)?;
        assert_eq!(hash1, hash2);

        let files: Vec<_> = fs::read_dir(tmp_dir.path())?.collect();
        assert_eq!(files.len(), 1);
        Ok(())
    }

    #[test]
    fn test_miss() -> ResultTest<()> {
        let (store, _tmp_dir) = setup()?;

        let hash = hash_bytes(TEST_DATA1);
        assert!(store.read(&hash)?.is_none());
        assert!(store.size(&hash)?.is_none());
        assert!(store.open_blob(&hash)?.is_none());
        Ok(())
    }

    #[test]
    fn test_delete() -> ResultTest<()> {
        let (store, _tmp_dir) = setup()?;

        let hash = store.put(TEST_DATA1)?;
        assert!(store.delete(&hash));
        assert!(!store.delete(&hash));
        assert!(store.read(&hash)?.is_none());
        Ok(())
    }

    #[test]
    fn test_hash_named_files_skips_strays() -> ResultTest<()> {
        let (store, tmp_dir) = setup()?;

        let hash = store.put(TEST_DATA1)?;
        fs::write(tmp_dir.path().join("not-a-hash"), b"junk")?;

        assert_eq!(store.hash_named_files()?, vec![hash]);
        Ok(())
    }

    #[test]
    fn test_put_file() -> ResultTest<()> {
        let (store, tmp_dir) = setup()?;

        let source = tmp_dir.path().join("source.bin");
        fs::write(&source, TEST_DATA2)?;

        let hash = store.put_file(&source)?;
        assert_eq!(hash, hash_bytes(TEST_DATA2));
        assert_eq!(store.read(&hash)?.unwrap(), TEST_DATA2.to_vec());
        Ok(())
    }
}
