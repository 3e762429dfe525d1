use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use color_eyre::Result;
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use undelete_core::migrate::MigrationOptions;
use undelete_etcd::{
    etcd_store::{EtcdSettings, DEFAULT_HOST, DEFAULT_PAGE_SIZE, DEFAULT_PORT},
    tls::TlsPaths,
};

use crate::cli::PvcArgs;

/// File configuration loaded from `~/.config/pvc-undelete/config.toml` (platform-specific).
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct FileConfig {
    pub etcd: Option<EtcdFileConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct EtcdFileConfig {
    pub ca: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub tls_server_name: Option<String>,
    pub connect_timeout_secs: Option<u64>,
    pub page_size: Option<i64>,
}

/// Fully resolved inputs for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationConfig {
    pub settings: EtcdSettings,
    pub options: MigrationOptions,
    pub json: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing {what}: pass --{flag} or set etcd.{key} in the config file")]
    Missing {
        what: &'static str,
        flag: &'static str,
        key: &'static str,
    },
    #[error("page size must not be negative, got {0}")]
    NegativePageSize(i64),
    #[error("connect timeout must be at least one second")]
    ZeroTimeout,
}

/// Load config from the default path; if missing, return defaults.
pub fn load() -> Result<FileConfig> {
    let path = default_path()?;
    load_from_path(path)
}

/// Load config from a given path; if missing or empty, return defaults.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<FileConfig> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(FileConfig::default());
    }
    let cfg: FileConfig = toml::from_str(&contents)?;
    Ok(cfg)
}

/// Resolve the default config path (platform aware).
pub fn default_path() -> Result<PathBuf> {
    let base = config_dir().ok_or_else(|| color_eyre::eyre::eyre!("no config dir available"))?;
    Ok(base.join("pvc-undelete").join("config.toml"))
}

/// Write a starter config to `path` unless a file is already there.
pub fn write_default_if_missing(path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let starter = FileConfig {
        etcd: Some(EtcdFileConfig {
            host: Some(DEFAULT_HOST.to_string()),
            port: Some(DEFAULT_PORT),
            page_size: Some(DEFAULT_PAGE_SIZE),
            ..EtcdFileConfig::default()
        }),
    };
    let body = toml::to_string_pretty(&starter)?;
    fs::write(path, body)?;
    Ok(path.to_path_buf())
}

/// Merge flags over the file over built-in defaults.
pub fn resolve(file: &FileConfig, args: &PvcArgs) -> Result<MigrationConfig, ConfigError> {
    let etcd = file.etcd.clone().unwrap_or_default();

    let ca = args.etcd_ca.clone().or(etcd.ca).ok_or(ConfigError::Missing {
        what: "CA bundle",
        flag: "etcdca",
        key: "ca",
    })?;
    let cert = args.etcd_cert.clone().or(etcd.cert).ok_or(ConfigError::Missing {
        what: "client certificate",
        flag: "etcdcert",
        key: "cert",
    })?;
    let key = args.etcd_key.clone().or(etcd.key).ok_or(ConfigError::Missing {
        what: "client key",
        flag: "etcdkey",
        key: "key",
    })?;

    let mut settings = EtcdSettings::new(TlsPaths { ca, cert, key });
    if let Some(host) = args.etcd_host.clone().or(etcd.host) {
        settings.host = host;
    }
    if let Some(port) = args.etcd_port.or(etcd.port) {
        settings.port = port;
    }
    settings.tls_server_name = args.tls_server_name.clone().or(etcd.tls_server_name);
    if let Some(page_size) = args.page_size.or(etcd.page_size) {
        if page_size < 0 {
            return Err(ConfigError::NegativePageSize(page_size));
        }
        settings.page_size = page_size;
    }
    if let Some(secs) = args.connect_timeout_secs.or(etcd.connect_timeout_secs) {
        if secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        settings.connect_timeout = Duration::from_secs(secs);
    }

    Ok(MigrationConfig {
        settings,
        options: MigrationOptions {
            dry_run: args.dry_run,
        },
        json: args.json,
    })
}
