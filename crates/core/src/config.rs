use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing_core::LevelFilter;

/// Settings for one asset server assignment.
///
/// The process host hands these over after it has ingested whatever
/// outer configuration it speaks (domain settings, CLI flags); the core
/// only sees the resolved values.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AssetServerConfig {
    /// Root of the persisted state: `map.json` and the `files/`
    /// subdirectory live here.
    pub assets_path: PathBuf,
    /// Concurrent transfer tasks. Transfer work is I/O bound, so the
    /// useful count is well above the machine's core count.
    pub transfer_pool_size: usize,
    /// Uploads larger than this are refused outright.
    pub max_upload_size: u64,
    /// Cadence of the per-connection stats reports, in seconds.
    pub stats_interval_secs: u64,
}

const DEFAULT_TRANSFER_POOL_SIZE: usize = 50;
const DEFAULT_MAX_UPLOAD_SIZE: u64 = 1024 * 1024 * 1024;

impl Default for AssetServerConfig {
    fn default() -> Self {
        Self {
            assets_path: PathBuf::from("assets"),
            transfer_pool_size: DEFAULT_TRANSFER_POOL_SIZE,
            max_upload_size: DEFAULT_MAX_UPLOAD_SIZE,
            stats_interval_secs: 10,
        }
    }
}

impl AssetServerConfig {
    pub fn with_assets_path(assets_path: impl Into<PathBuf>) -> Self {
        Self {
            assets_path: assets_path.into(),
            ..Self::default()
        }
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    #[serde(with = "level_filter_serde")]
    pub level: Option<LevelFilter>,
    pub directives: Vec<String>,
}

mod level_filter_serde {
    use super::*;
    use serde::Deserializer;

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<LevelFilter>, D::Error> {
        let level = Option::<String>::deserialize(de)?;
        level
            .map(|level| level.parse().map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// The on-disk `config.toml`, if the deployment carries one.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub asset_server: AssetServerConfig,
    pub logs: LogConfig,
}

impl ConfigFile {
    /// Read and parse `path`. A missing file is not an error; it just
    /// means defaults apply.
    pub fn read(path: impl AsRef<Path>) -> anyhow::Result<Option<Self>> {
        let path = path.as_ref();
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("could not read config file {}", path.display())),
        };
        let config = toml::from_str(&contents).with_context(|| format!("could not parse {}", path.display()))?;
        Ok(Some(config))
    }
}
