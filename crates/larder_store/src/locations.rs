//! Where implementation stores live and how they are configured.
//!
//! Every user has a private store in their cache directory. A system-wide store may exist in
//! addition, shared by all users and managed by a store service. Administrators can list further
//! store directories in `implementation-dirs` files and tune the behaviour of stores in
//! `config.toml`, both read from the system and the user configuration directory.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use fs_err as fs;
use serde::Deserialize;

use crate::{
    default_handle_inspector, CompositeStore, DirectoryStore, ImplementationStore, StoreError,
    StoreOptions,
};

/// Overrides the location of the user store.
pub const CACHE_DIR_ENV: &str = "LARDER_CACHE_DIR";

/// The name of the files listing additional store directories.
pub const IMPLEMENTATION_DIRS_FILE: &str = "implementation-dirs";

/// The name of the configuration file.
pub const CONFIG_FILE: &str = "config.toml";

/// An error that can occur while loading the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A file could not be read.
    #[error("failed to {0}")]
    IoError(String, #[source] std::io::Error),

    /// A configuration file is not valid.
    #[error("failed to parse '{}'", .0.display())]
    ParseError(PathBuf, #[source] toml::de::Error),

    /// No cache directory is known for this platform.
    #[error("could not determine the cache directory for the current platform")]
    NoCacheDir,
}

/// The directory of the current user's store.
pub fn user_cache_dir() -> Result<PathBuf, ConfigError> {
    std::env::var_os(CACHE_DIR_ENV)
        .map(PathBuf::from)
        .or_else(|| dirs::cache_dir().map(|dir| dir.join("larder").join("implementations")))
        .ok_or(ConfigError::NoCacheDir)
}

/// The directory of the system-wide store.
pub fn system_cache_dir() -> PathBuf {
    #[cfg(windows)]
    {
        std::env::var_os("ProgramData")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(r"C:\ProgramData"))
            .join("larder")
            .join("implementations")
    }
    #[cfg(not(windows))]
    {
        PathBuf::from("/var/cache/larder/implementations")
    }
}

/// The directories configuration is read from, lowest priority first.
pub fn config_dirs() -> Vec<PathBuf> {
    let mut result = Vec::new();
    #[cfg(unix)]
    result.push(PathBuf::from("/etc/larder"));
    if let Some(dir) = dirs::config_dir() {
        result.push(dir.join("larder"));
    }
    result
}

/// Parses the content of an `implementation-dirs` file.
///
/// Every non-empty line that does not start with `#` names a directory. Relative paths are
/// resolved against `base`, the directory containing the file.
pub fn parse_implementation_dirs(text: &str, base: &Path) -> Vec<PathBuf> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| base.join(line))
        .collect()
}

/// Settings for the stores of this machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StoreConfig {
    /// Make published implementations read-only. Enabled when unset.
    pub write_protection: Option<bool>,

    /// The socket of the service managing the system store.
    pub service_socket: Option<PathBuf>,

    /// How long to wait for processes to release an implementation that should be removed.
    pub handle_timeout_secs: Option<u64>,

    /// Additional store directories, read from `implementation-dirs` files.
    #[serde(skip)]
    pub extra_dirs: Vec<PathBuf>,
}

impl StoreConfig {
    /// Loads and merges configuration from `dirs`, later directories taking priority. Missing
    /// files are skipped.
    pub fn load_from_dirs<I, P>(dirs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut config = StoreConfig::default();
        for dir in dirs {
            let dir = dir.as_ref();

            let config_file = dir.join(CONFIG_FILE);
            if let Some(content) = read_optional(&config_file)? {
                let other: StoreConfig = toml::from_str(&content)
                    .map_err(|e| ConfigError::ParseError(config_file.clone(), e))?;
                config = config.merge(other);
            }

            if let Some(content) = read_optional(&dir.join(IMPLEMENTATION_DIRS_FILE))? {
                config
                    .extra_dirs
                    .extend(parse_implementation_dirs(&content, dir));
            }
        }
        Ok(config)
    }

    /// Loads the configuration from the default [`config_dirs`].
    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load_from_dirs(config_dirs())
    }

    /// Merges `other` into this configuration. Values set in `other` take priority.
    pub fn merge(self, other: StoreConfig) -> Self {
        let mut extra_dirs = self.extra_dirs;
        extra_dirs.extend(other.extra_dirs);
        Self {
            write_protection: other.write_protection.or(self.write_protection),
            service_socket: other.service_socket.or(self.service_socket),
            handle_timeout_secs: other.handle_timeout_secs.or(self.handle_timeout_secs),
            extra_dirs,
        }
    }

    /// The options for directory stores described by this configuration.
    pub fn store_options(&self) -> StoreOptions {
        let defaults = StoreOptions::default();
        StoreOptions {
            write_protection: self.write_protection.unwrap_or(defaults.write_protection),
            handle_timeout: self
                .handle_timeout_secs
                .map_or(defaults.handle_timeout, Duration::from_secs),
            handle_inspector: default_handle_inspector(),
        }
    }
}

fn read_optional(path: &Path) -> Result<Option<String>, ConfigError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ConfigError::IoError(
            format!("read '{}'", path.display()),
            e,
        )),
    }
}

/// Assembles the stores of this machine: the configured extra directories, the user store and,
/// if it exists, the system store.
///
/// The system store is accessed through its service when the socket exists and the directory
/// cannot be written directly.
pub fn default_store(config: &StoreConfig) -> Result<CompositeStore, StoreError> {
    let options = config.store_options();
    let mut children: Vec<Arc<dyn ImplementationStore>> = Vec::new();

    for dir in &config.extra_dirs {
        children.push(Arc::new(DirectoryStore::open_read_only(dir)));
    }

    let user_dir = user_cache_dir().map_err(|e| StoreError::NotSupported(e.to_string()))?;
    children.push(Arc::new(DirectoryStore::open_with_options(
        user_dir,
        options.clone(),
    )?));

    let system_dir = system_cache_dir();
    if system_dir.is_dir() {
        let system = DirectoryStore::open_with_options(&system_dir, options)?;
        match &config.service_socket {
            Some(socket) if system.is_read_only() && socket.exists() => {
                #[cfg(unix)]
                children.push(Arc::new(crate::service::ServiceStore::new(
                    socket,
                    &system_dir,
                )));
                #[cfg(not(unix))]
                children.push(Arc::new(system));
            }
            _ => children.push(Arc::new(system)),
        }
    }

    Ok(CompositeStore::new(children))
}
