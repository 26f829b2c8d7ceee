//! User settings for the Sayo language client.
//!
//! Settings live in `~/.sayo/settings.toml` (or the file named by
//! `SAYO_SETTINGS`) and mirror the editor's dotted keys:
//!
//! ```toml
//! [sayo-asm]
//! languageServer.path = "/opt/sayo/bin/sayo-lsp"
//! trace.server = "messages"
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, fs};

use sayo_lsp_client::{Configuration, SERVER_PATH_SETTING, TRACE_SETTING, TraceLevel};
use serde::Deserialize;

/// Environment variable naming an alternative settings file.
pub const SETTINGS_ENV: &str = "SAYO_SETTINGS";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings at {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse settings at {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl SettingsError {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Read { path, .. } | Self::Parse { path, .. } => path,
        }
    }
}

/// Rejected setting values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidSetting {
    #[error("unknown trace level {0:?}, expected \"off\", \"messages\" or \"verbose\"")]
    TraceLevel(String),
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSettings {
    #[serde(rename = "sayo-asm", default)]
    sayo_asm: RawSayoAsm,
}

#[derive(Debug, Default, Deserialize)]
struct RawSayoAsm {
    #[serde(rename = "languageServer", default)]
    language_server: RawLanguageServer,
    #[serde(default)]
    trace: RawTrace,
}

#[derive(Debug, Default, Deserialize)]
struct RawLanguageServer {
    path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTrace {
    server: Option<String>,
}

/// Validated settings (normalized at deserialization via `#[serde(try_from)]`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawSettings")]
pub struct Settings {
    server_path: Option<String>,
    trace: TraceLevel,
}

impl TryFrom<RawSettings> for Settings {
    type Error = InvalidSetting;

    fn try_from(raw: RawSettings) -> Result<Self, Self::Error> {
        let RawSayoAsm {
            language_server,
            trace,
        } = raw.sayo_asm;

        // Kept verbatim; blank means unset.
        let server_path = language_server
            .path
            .filter(|path| !path.trim().is_empty());

        let trace = match trace.server.as_deref().map(str::trim) {
            None => TraceLevel::Off,
            Some(value) => match value {
                "off" => TraceLevel::Off,
                "messages" => TraceLevel::Messages,
                "verbose" => TraceLevel::Verbose,
                other => return Err(InvalidSetting::TraceLevel(other.to_string())),
            },
        };

        Ok(Self { server_path, trace })
    }
}

impl FromStr for Settings {
    type Err = toml::de::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s)
    }
}

impl Settings {
    /// Load the settings file. A missing file yields `Ok(None)`.
    pub fn load() -> Result<Option<Self>, SettingsError> {
        match settings_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(None),
        }
    }

    /// Load from an explicit path. A missing file yields `Ok(None)`.
    pub fn load_from(path: &Path) -> Result<Option<Self>, SettingsError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(source) => {
                tracing::warn!("Failed to read settings at {}: {source}", path.display());
                return Err(SettingsError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        match content.parse() {
            Ok(settings) => Ok(Some(settings)),
            Err(source) => {
                tracing::warn!("Failed to parse settings at {}: {source}", path.display());
                Err(SettingsError::Parse {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }

    /// Explicit server executable, if configured.
    #[must_use]
    pub fn server_path(&self) -> Option<&str> {
        self.server_path.as_deref()
    }

    #[must_use]
    pub fn trace(&self) -> TraceLevel {
        self.trace
    }

    /// Replace the configured server path.
    #[must_use]
    pub fn with_server_path(mut self, path: impl Into<String>) -> Self {
        self.server_path = Some(path.into());
        self
    }
}

impl Configuration for Settings {
    fn get(&self, key: &str) -> Option<String> {
        match key {
            SERVER_PATH_SETTING => self.server_path.clone(),
            TRACE_SETTING => Some(self.trace.as_str().to_string()),
            _ => None,
        }
    }
}

/// Settings file location: `SAYO_SETTINGS`, else `~/.sayo/settings.toml`.
#[must_use]
pub fn settings_path() -> Option<PathBuf> {
    resolve_settings_path(env::var_os(SETTINGS_ENV), dirs::home_dir())
}

fn resolve_settings_path(env_override: Option<OsString>, home: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = env_override.filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }
    home.map(|home| home.join(".sayo").join("settings.toml"))
}
