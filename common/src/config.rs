//! This is the `ConfigFile` struct.
//!
//! This is for finding the right default location for the configuration file of a
//! `geoshare` tool and loading it.  It is neutral regarding the configuration struct itself,
//! storing only the base directory and with `load()` reading the proper file or the default
//! one.
//!
//! Every configuration struct carries a `version` field, checked against what the tool
//! supports through the `Versioned` trait.
//!

use std::fmt::Debug;
use std::fs;
use std::path::{Path, PathBuf};

use directories::BaseDirs;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, trace};

use crate::makepath;

/// Config filename
const CONFIG: &str = "config.hcl";

/// Main name for the directory base
const TAG: &str = "geoshare";

/// Configuration structs with a version number.
///
pub trait Versioned {
    /// Version supported by this code
    const VERSION: usize;

    /// Version found in the file
    fn version(&self) -> usize;
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("No home directory, can not find the configuration.")]
    NoHome,
    #[error("Unknown config file {0:?}")]
    Missing(PathBuf),
    #[error("Can not read {0:?}: {1}")]
    Read(PathBuf, String),
    #[error("Bad config file {0:?}: {1}")]
    Parse(PathBuf, String),
    #[error("Bad config version {found}, expected {expected}")]
    BadVersion { found: usize, expected: usize },
}

/// Location and content of a configuration file.
///
#[derive(Debug)]
pub struct ConfigFile<T: Debug + DeserializeOwned + Versioned> {
    /// Tag is the project name.
    tag: String,
    /// This is the base directory for all files.
    basedir: PathBuf,
    inner: Option<T>,
}

impl<T> ConfigFile<T>
where
    T: Debug + DeserializeOwned + Versioned,
{
    #[tracing::instrument]
    fn new(tag: &str) -> Result<Self, ConfigError> {
        let base = BaseDirs::new().ok_or(ConfigError::NoHome)?;

        #[cfg(unix)]
        let basedir = makepath!(base.home_dir(), ".config", tag);

        #[cfg(windows)]
        let basedir = makepath!(base.data_local_dir(), tag);

        debug!("base = {basedir:?}");
        Ok(ConfigFile {
            tag: String::from(tag),
            basedir,
            inner: None,
        })
    }

    /// Returns the path of the default config directory
    ///
    pub fn config_path(&self) -> PathBuf {
        self.basedir.clone()
    }

    /// Returns the path of the default config file
    ///
    pub fn default_file(&self) -> PathBuf {
        self.config_path().join(CONFIG)
    }

    /// Load the file and return a struct T in the right format.
    ///
    /// Use the following search path:
    /// - file specified on CLI, which must exist
    /// - default file in the base directory (based on $HOME or $LOCALAPPDATA), a missing
    ///   default file leaves the configuration empty.
    ///
    #[tracing::instrument]
    pub fn load(fname: Option<&Path>) -> Result<ConfigFile<T>, ConfigError> {
        let mut cfg = ConfigFile::<T>::new(TAG)?;

        let fname = match fname {
            Some(fname) => {
                if !fname.exists() {
                    return Err(ConfigError::Missing(fname.to_path_buf()));
                }
                fname.to_path_buf()
            }
            None => {
                let def = cfg.default_file();
                if !def.exists() {
                    debug!("no {def:?}, using defaults");
                    return Ok(cfg);
                }
                def
            }
        };

        trace!("Loading config file {fname:?} for {}", cfg.tag);
        cfg.inner = Some(read_config(&fname)?);
        Ok(cfg)
    }

    /// Return the inner configuration, if a file was loaded
    ///
    pub fn inner(&self) -> Option<&T> {
        self.inner.as_ref()
    }

    /// Return the inner configuration as mutable
    ///
    pub fn inner_mut(&mut self) -> Option<&mut T> {
        self.inner.as_mut()
    }

    /// Consume the file, giving the configuration or its default
    ///
    pub fn into_inner(self) -> T
    where
        T: Default,
    {
        self.inner.unwrap_or_default()
    }
}

/// Read and check one file.
///
fn read_config<T>(fname: &Path) -> Result<T, ConfigError>
where
    T: Debug + DeserializeOwned + Versioned,
{
    let data = fs::read_to_string(fname)
        .map_err(|e| ConfigError::Read(fname.to_path_buf(), e.to_string()))?;
    trace!("string data = {data}");

    let data: T =
        hcl::from_str(&data).map_err(|e| ConfigError::Parse(fname.to_path_buf(), e.to_string()))?;
    debug!("struct data = {data:?}");

    if data.version() != T::VERSION {
        return Err(ConfigError::BadVersion {
            found: data.version(),
            expected: T::VERSION,
        });
    }
    Ok(data)
}
