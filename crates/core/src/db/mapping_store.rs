use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use atp_lib::hash::{is_valid_hex_hash, Hash};
use atp_lib::path::{is_valid_file_path, is_valid_path, path_is_folder};
use tempfile::NamedTempFile;

use crate::error::{MappingError, StoreError};

/// Name of the persisted mapping document inside the resources
/// directory.
pub const MAP_FILE_NAME: &str = "map.json";

/// Reserved prefix of the baked namespace. Mappings under
/// `/.baked/<source hash>/` describe bake outputs and are never
/// mutable from outside the server.
pub const HIDDEN_BAKED_FOLDER: &str = "/.baked/";

/// `/.baked/<hash>/<relative name>`
pub fn baked_mapping_path(hash: &Hash, relative_name: &str) -> String {
    format!("{HIDDEN_BAKED_FOLDER}{hash}/{relative_name}")
}

/// `/.baked/<hash>/`
pub fn baked_folder_path(hash: &Hash) -> String {
    format!("{HIDDEN_BAKED_FOLDER}{hash}/")
}

/// The path→hash namespace, held in memory and persisted as a single
/// JSON object after every mutation.
///
/// Mutations are transactional from the caller's point of view: if the
/// new document cannot be written, the in-memory map is rolled back to
/// its pre-call state and the operation reports failure. The document
/// itself is replaced atomically (temp file + rename), so the on-disk
/// state is always some consistent snapshot.
pub struct MappingStore {
    mappings: BTreeMap<String, Hash>,
    map_file: PathBuf,
}

impl MappingStore {
    /// Load `map.json` from `resources_dir`. A missing file yields an
    /// empty store; an unreadable or unparseable one is an error the
    /// caller should treat as fatal. Entries with a malformed path or
    /// hash are dropped with a warning.
    pub fn load(resources_dir: &Path) -> Result<Self, StoreError> {
        let map_file = resources_dir.join(MAP_FILE_NAME);
        let mut mappings = BTreeMap::new();

        match fs::read(&map_file) {
            Ok(bytes) => {
                let root: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(&bytes)?;
                for (path, value) in root {
                    let Some(hex) = value.as_str() else {
                        log::warn!("Skipping mapping for {path} because its value is not a string");
                        continue;
                    };
                    // hidden-prefix entries get the same validation
                    // bypass as `set`, so bake state survives a reload
                    if !path.starts_with(HIDDEN_BAKED_FOLDER) && !is_valid_file_path(&path) {
                        log::warn!("Will not keep mapping for {path} since it is not a valid path");
                        continue;
                    }
                    if !is_valid_hex_hash(hex) {
                        log::warn!("Will not keep mapping for {path} since it does not have a valid hash");
                        continue;
                    }
                    let hash = Hash::from_hex(hex)?;
                    mappings.insert(path, hash);
                }
                log::info!("Loaded {} mappings from {}", mappings.len(), map_file.display());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No existing mappings found at {}", map_file.display());
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Self { mappings, map_file })
    }

    pub fn get(&self, path: &str) -> Option<Hash> {
        self.mappings.get(path).copied()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.mappings.contains_key(path)
    }

    pub fn all(&self) -> impl Iterator<Item = (&str, Hash)> {
        self.mappings.iter().map(|(path, hash)| (path.as_str(), *hash))
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    pub fn is_hash_referenced(&self, hash: &Hash) -> bool {
        self.mappings.values().any(|mapped| mapped == hash)
    }

    /// Map `path` to `hash`, replacing any previous mapping. On
    /// persistence failure the previous value (or absence) is restored.
    ///
    /// Entries under [`HIDDEN_BAKED_FOLDER`] are structural, not
    /// client-visible paths, and bypass file-path validation; keeping
    /// external writers out of that namespace is the dispatcher's job.
    pub fn set(&mut self, path: &str, hash: Hash) -> Result<(), StoreError> {
        let path = path.trim();
        if !path.starts_with(HIDDEN_BAKED_FOLDER) && !is_valid_file_path(path) {
            log::warn!("Cannot set a mapping for invalid path: {path} => {hash}");
            return Err(MappingError::InvalidPath(path.to_owned()).into());
        }

        let prior = self.mappings.insert(path.to_owned(), hash);

        if let Err(e) = self.persist() {
            match prior {
                Some(prior) => self.mappings.insert(path.to_owned(), prior),
                None => self.mappings.remove(path),
            };
            log::warn!("Failed to persist mapping: {path} => {hash}");
            return Err(e.into());
        }

        log::debug!("Set mapping: {path} => {hash}");
        Ok(())
    }

    /// Delete each path in `paths`; folder paths (trailing `/`) delete
    /// every mapping under them. Returns the hashes that lost their
    /// last reference, for the caller to garbage-collect. On
    /// persistence failure the whole map is rolled back.
    pub fn delete_many<S: AsRef<str>>(&mut self, paths: &[S]) -> Result<Vec<Hash>, StoreError> {
        let old_mappings = self.mappings.clone();
        let mut candidates = BTreeSet::new();

        for raw_path in paths {
            let path = raw_path.as_ref().trim();

            if path_is_folder(path) {
                let size_before = self.mappings.len();
                self.mappings.retain(|mapped_path, hash| {
                    if mapped_path.starts_with(path) {
                        candidates.insert(*hash);
                        false
                    } else {
                        true
                    }
                });
                let deleted = size_before - self.mappings.len();
                if deleted > 0 {
                    log::debug!("Deleted {deleted} mappings in folder: {path}");
                } else {
                    log::debug!("Did not find any mappings to delete in folder: {path}");
                }
            } else if let Some(hash) = self.mappings.remove(path) {
                candidates.insert(hash);
                log::debug!("Deleted a mapping: {path} => {hash}");
            } else {
                log::debug!("Unable to delete a mapping that was not found: {path}");
            }
        }

        if let Err(e) = self.persist() {
            log::warn!("Failed to persist deleted mappings, rolling back");
            self.mappings = old_mappings;
            return Err(e.into());
        }

        // Only hashes no remaining mapping points at may be deleted.
        let unreferenced = candidates
            .into_iter()
            .filter(|hash| !self.is_hash_referenced(hash))
            .collect();
        Ok(unreferenced)
    }

    /// Rename a file mapping or a whole folder. Folder renames rewrite
    /// every key under the old prefix; file renames may overwrite an
    /// existing destination. Rolled back on persistence failure.
    pub fn rename(&mut self, old_path: &str, new_path: &str) -> Result<(), StoreError> {
        let old_path = old_path.trim();
        let new_path = new_path.trim();

        if !is_valid_path(old_path) || !is_valid_path(new_path) {
            log::warn!("Cannot perform rename with invalid paths: {old_path} => {new_path}");
            return Err(MappingError::InvalidPath(format!("{old_path} => {new_path}")).into());
        }

        match (path_is_folder(old_path), path_is_folder(new_path)) {
            (true, true) => self.rename_folder(old_path, new_path),
            (false, false) => self.rename_file(old_path, new_path),
            _ => {
                log::warn!("Cannot rename between a folder path and a file path: {old_path} => {new_path}");
                Err(MappingError::RenameKindMismatch {
                    old: old_path.to_owned(),
                    new: new_path.to_owned(),
                }
                .into())
            }
        }
    }

    fn rename_folder(&mut self, old_path: &str, new_path: &str) -> Result<(), StoreError> {
        let old_mappings = self.mappings.clone();

        for (key, hash) in &old_mappings {
            if let Some(rest) = key.strip_prefix(old_path) {
                let new_key = format!("{new_path}{rest}");
                self.mappings.remove(key);
                self.mappings.insert(new_key, *hash);
            }
        }

        if let Err(e) = self.persist() {
            self.mappings = old_mappings;
            log::warn!("Failed to persist renamed folder mapping: {old_path} => {new_path}");
            return Err(e.into());
        }

        log::debug!("Renamed folder mapping: {old_path} => {new_path}");
        Ok(())
    }

    fn rename_file(&mut self, old_path: &str, new_path: &str) -> Result<(), StoreError> {
        let Some(hash) = self.mappings.remove(old_path) else {
            return Err(MappingError::NotFound(old_path.to_owned()).into());
        };
        // keep any overwritten destination for rollback
        let displaced = self.mappings.insert(new_path.to_owned(), hash);

        if let Err(e) = self.persist() {
            self.mappings.insert(old_path.to_owned(), hash);
            match displaced {
                Some(displaced) => self.mappings.insert(new_path.to_owned(), displaced),
                None => self.mappings.remove(new_path),
            };
            log::warn!("Failed to persist renamed mapping: {old_path} => {new_path}");
            return Err(e.into());
        }

        log::debug!("Renamed mapping: {old_path} => {new_path}");
        Ok(())
    }

    fn persist(&self) -> Result<(), MappingError> {
        let root: serde_json::Map<String, serde_json::Value> = self
            .mappings
            .iter()
            .map(|(path, hash)| (path.clone(), serde_json::Value::String(hash.to_hex())))
            .collect();

        let write = || -> std::io::Result<()> {
            let json = serde_json::to_vec_pretty(&root).map_err(std::io::Error::other)?;
            let dir = self.map_file.parent().unwrap_or(Path::new("."));
            let mut temp = NamedTempFile::new_in(dir)?;
            temp.write_all(&json)?;
            temp.persist(&self.map_file).map_err(|e| e.error)?;
            Ok(())
        };

        write().map_err(|source| MappingError::Persist {
            path: self.map_file.clone(),
            source,
        })
    }
}
