//! Persisted device identity and bearer token.
//!
//! One JSON file per role so a host and a viewer on the same machine keep
//! distinct device ids and never supersede each other at the server.

use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tether_proto::{Role, generate_device_id};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("unable to determine a config directory; set TETHER_HOME")]
    NoHome,
    #[error("state file io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("state file is not valid json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// `home` wins over the platform config directory.
    pub fn new(home: Option<PathBuf>) -> Result<Self, StateError> {
        let dir = match home {
            Some(dir) => dir,
            None => BaseDirs::new()
                .ok_or(StateError::NoHome)?
                .config_dir()
                .join("tether"),
        };
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, role: Role) -> PathBuf {
        self.dir.join(format!("{}.json", role.as_str()))
    }

    /// Load the state for `role`, creating and saving a fresh device id on
    /// first use.
    pub fn load_or_create(&self, role: Role) -> Result<DeviceState, StateError> {
        let path = self.path(role);
        if path.exists() {
            let raw = fs::read_to_string(&path)?;
            match serde_json::from_str::<DeviceState>(&raw) {
                Ok(state) if !state.device_id.trim().is_empty() => return Ok(state),
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(target = "tether::identity", path = %path.display(), error = %err, "discarding unreadable state file");
                }
            }
        }
        let state = DeviceState {
            device_id: generate_device_id(),
            token: None,
        };
        self.save(role, &state)?;
        Ok(state)
    }

    pub fn save(&self, role: Role, state: &DeviceState) -> Result<(), StateError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path(role);
        let serialized = serde_json::to_string_pretty(state)?;
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&path)?;
        file.write_all(serialized.as_bytes())?;
        Ok(())
    }

    pub fn store_token(&self, role: Role, token: &str) -> Result<DeviceState, StateError> {
        let mut state = self.load_or_create(role)?;
        state.token = Some(token.to_string());
        self.save(role, &state)?;
        Ok(state)
    }

    pub fn clear_token(&self, role: Role) -> Result<DeviceState, StateError> {
        let mut state = self.load_or_create(role)?;
        state.token = None;
        self.save(role, &state)?;
        Ok(state)
    }
}
