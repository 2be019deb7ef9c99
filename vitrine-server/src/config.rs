use std::path::{Path, PathBuf};

use serde::Deserialize;
use vitrine_core::config::PipelineConfig;

/// Daemon configuration, merged from an optional file and `VITRINE__*`
/// environment variables.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Postgres connection string; absent means in-memory backends.
    pub database_url: Option<String>,
    /// Redis connection string for the ordered index and firing leases.
    pub redis_url: Option<String>,
    pub pipeline: PipelineConfig,
    pub cache_folders: Vec<CacheFolderConfig>,
    pub libraries: Vec<LibraryConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheFolderConfig {
    pub name: String,
    pub root_path: PathBuf,
    pub max_bytes: u64,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LibraryConfig {
    pub display_name: String,
    pub root_path: PathBuf,
    #[serde(default = "default_true")]
    pub auto_scan: bool,
    #[serde(default = "default_scan_interval")]
    pub scan_interval_seconds: u64,
}

fn default_true() -> bool {
    true
}

fn default_scan_interval() -> u64 {
    24 * 60 * 60
}

impl ServerConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path.to_path_buf()).required(true),
            );
        } else {
            builder = builder.add_source(
                config::File::with_name("vitrine").required(false),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix("VITRINE").separator("__"),
        );
        Ok(builder.build()?.try_deserialize()?)
    }
}
