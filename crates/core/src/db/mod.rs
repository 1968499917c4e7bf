pub mod blob_store;
pub mod mapping_store;
pub mod meta_store;

pub use blob_store::BlobStore;
pub use mapping_store::{baked_folder_path, baked_mapping_path, MappingStore, HIDDEN_BAKED_FOLDER};
pub use meta_store::AssetMeta;
