use hex::FromHexError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MappingError {
    #[error("`{0}` is not a valid asset path")]
    InvalidPath(String),
    #[error("no mapping found for `{0}`")]
    NotFound(String),
    #[error("cannot rename `{old}` to `{new}`: one is a folder and the other is a file")]
    RenameKindMismatch { old: String, new: String },
    #[error("failed to persist mappings to `{path}`: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Error, Debug)]
pub enum BakeError {
    #[error("failed to copy baked output `{0}` into the blob store")]
    StoreOutput(PathBuf),
    #[error("failed to publish baked mapping for `{0}`")]
    PublishMapping(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IOError: {0}")]
    Io(#[from] io::Error),
    #[error("JsonError: {0}")]
    Json(#[from] serde_json::Error),
    #[error("DecodeHexError: {0}")]
    DecodeHex(#[from] FromHexError),
    #[error("MappingError: {0}")]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
