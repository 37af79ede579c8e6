use std::env;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Deserialize;

const CONFIG_ENV: &str = "IMAGE_GUARD_CONFIG";
const LIBRARY_ENV: &str = "ONNX_RUNTIME_LIB_PATH";
const DEFAULT_CONFIG_FILE: &str = "image-guard.json";
const DEFAULT_MODEL_PATH: &str = "mobilenet_v2.onnx";
pub const DEFAULT_LOG_PATH: &str = "service.log";
const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

#[cfg(target_os = "windows")]
const DEFAULT_LIBRARY_PATH: &str = "onnxruntime.dll";
#[cfg(target_os = "macos")]
const DEFAULT_LIBRARY_PATH: &str = "/usr/local/lib/libonnxruntime.dylib";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const DEFAULT_LIBRARY_PATH: &str = "/usr/local/lib/libonnxruntime.so";

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Parse { path: PathBuf, source: serde_json::Error },
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "Failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "Failed to parse config {}: {source}", path.display())
            }
            ConfigError::Invalid(reason) => write!(f, "Invalid config: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

/// Optional on-disk overrides. Every field may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    library_path: Option<PathBuf>,
    model_path: Option<PathBuf>,
    log_path: Option<PathBuf>,
    max_message_bytes: Option<usize>,
}

/// Settings the service starts with.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    /// ONNX Runtime shared library.
    pub library_path: PathBuf,
    /// Model file, relative paths resolve against the working directory.
    pub model_path: PathBuf,
    pub log_path: PathBuf,
    /// Largest inbound frame accepted before it is skipped.
    pub max_message_bytes: usize,
}

impl ServiceConfig {
    /// Resolve settings: environment → config file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        let file = read_config_file(&path)?;
        Self::resolve(file, env::var_os(LIBRARY_ENV))
    }

    fn resolve(file: FileConfig, library_env: Option<OsString>) -> Result<Self, ConfigError> {
        let library_path = library_env
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .or(file.library_path)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LIBRARY_PATH));

        let max_message_bytes = file.max_message_bytes.unwrap_or(DEFAULT_MAX_MESSAGE_BYTES);
        if max_message_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_message_bytes must be greater than zero".into(),
            ));
        }

        Ok(Self {
            library_path,
            model_path: file
                .model_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH)),
            log_path: file
                .log_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_PATH)),
            max_message_bytes,
        })
    }
}

fn read_config_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(FileConfig::default()),
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
