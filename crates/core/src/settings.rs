//! User-facing knobs of a memory profiling session, stored as JSON.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::views::SortKey;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings io: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid setting `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfilingMode {
    #[default]
    Allocations,
    Liveness,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SortSetting {
    pub key: SortKey,
    pub ascending: bool,
}

impl Default for SortSetting {
    fn default() -> Self {
        Self {
            key: SortKey::TotalSize,
            ascending: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySettings {
    pub mode: ProfilingMode,
    /// Drop liveness paths that hold no live object anywhere below them.
    pub dont_show_zero_live_obj_alloc_paths: bool,
    /// Initial capacity, and growth step, of class history buffers.
    pub history_buffer_size: usize,
    pub sort: SortSetting,
    pub csv_separator: String,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            mode: ProfilingMode::Allocations,
            dont_show_zero_live_obj_alloc_paths: false,
            history_buffer_size: 50,
            sort: SortSetting::default(),
            csv_separator: ",".to_owned(),
        }
    }
}

impl MemorySettings {
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, SettingsError> {
        let settings: MemorySettings = serde_json::from_slice(bytes)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let bytes = std::fs::read(path.as_ref())?;
        let settings = Self::from_json_slice(&bytes)?;
        tracing::debug!(path = %path.as_ref().display(), ?settings.mode, "settings loaded");
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.history_buffer_size == 0 {
            return Err(SettingsError::Invalid {
                field: "history_buffer_size",
                reason: "must be greater than zero",
            });
        }
        if self.csv_separator.is_empty() {
            return Err(SettingsError::Invalid {
                field: "csv_separator",
                reason: "must not be empty",
            });
        }
        Ok(())
    }
}
