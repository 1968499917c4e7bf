//! Per-source-hash bake metadata.
//!
//! The metadata itself is just another blob; a mapping at
//! `/.baked/<source hash>/meta.json` points at it, which both makes it
//! reachable and protects it from unmapped-blob cleanup.

use atp_lib::hash::Hash;
use serde::{Deserialize, Serialize};

use super::{baked_mapping_path, BlobStore, MappingStore};
use crate::error::StoreError;

pub const META_FILE_NAME: &str = "meta.json";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetMeta {
    pub bake_version: u32,
    pub failed_last_bake: bool,
    pub last_bake_errors: String,
}

pub fn meta_mapping_path(hash: &Hash) -> String {
    baked_mapping_path(hash, META_FILE_NAME)
}

/// Whether a meta mapping exists for `hash`. This is how textures opt
/// into baking, so presence matters independently of content.
pub fn has_meta(mappings: &MappingStore, hash: &Hash) -> bool {
    mappings.contains(&meta_mapping_path(hash))
}

/// Read the metadata for `hash`. Returns `(false, default)` when the
/// mapping is absent, the blob is unreadable, or the document is
/// missing any required field.
pub fn read_meta(mappings: &MappingStore, blobs: &BlobStore, hash: &Hash) -> (bool, AssetMeta) {
    let Some(meta_hash) = mappings.get(&meta_mapping_path(hash)) else {
        return (false, AssetMeta::default());
    };

    let bytes = match blobs.read(&meta_hash) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return (false, AssetMeta::default()),
        Err(e) => {
            log::warn!("Failed to read metafile blob {meta_hash} for {hash}: {e}");
            return (false, AssetMeta::default());
        }
    };

    // all three fields are required; a partial document counts as
    // not loaded
    match serde_json::from_slice(&bytes) {
        Ok(meta) => (true, meta),
        Err(_) => {
            log::warn!("Metafile for {hash} has either missing or malformed data");
            (false, AssetMeta::default())
        }
    }
}

/// Serialize `meta`, store it as a blob, and publish the meta mapping
/// for `hash`.
pub fn write_meta(
    mappings: &mut MappingStore,
    blobs: &BlobStore,
    hash: &Hash,
    meta: &AssetMeta,
) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(meta)?;
    let meta_hash = blobs.put(&json)?;
    mappings.set(&meta_mapping_path(hash), meta_hash)?;
    Ok(())
}
