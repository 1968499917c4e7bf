//! The interface bakers implement.
//!
//! The server never links the real baking algorithms; it hands a baker
//! a source file and a scratch directory and consumes whatever signal
//! comes back. Bakers run on the blocking pool and may take minutes.

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

/// How a bake attempt ended, when not successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BakeFailure {
    /// Cancelled cooperatively; no metadata is recorded for these.
    Aborted,
    /// The baker gave up; the message lands in the asset's metadata.
    Failed(String),
}

pub type BakeResult = Result<Vec<PathBuf>, BakeFailure>;

/// A transformer from one source file to a set of client-ready output
/// files.
pub trait Baker: Send + Sync {
    /// Bake `source` into files under `scratch_dir` and return their
    /// paths. Implementations should poll `cancel` at convenient
    /// points and bail out with [`BakeFailure::Aborted`] once it has
    /// fired.
    fn bake(&self, source: &Path, scratch_dir: &Path, cancel: &CancellationToken) -> BakeResult;
}

/// Process-wide texture compression toggles of the image library the
/// texture baker links. Global state: the server captures them on
/// construction and restores them on teardown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompressionSettings {
    pub color: bool,
    pub grayscale: bool,
    pub normal: bool,
    pub cube: bool,
}

impl CompressionSettings {
    pub fn all_enabled() -> Self {
        Self {
            color: true,
            grayscale: true,
            normal: true,
            cube: true,
        }
    }
}

pub trait TextureBaker: Baker {
    /// The file extensions (lowercase, no dot) this baker accepts.
    /// Queried once at server startup.
    fn supported_extensions(&self) -> Vec<String>;

    fn compression_settings(&self) -> CompressionSettings;

    fn set_compression_settings(&self, settings: CompressionSettings);
}
