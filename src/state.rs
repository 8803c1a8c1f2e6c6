//! Cross-process state shared between the `start` and `finish` invocations.
//!
//! The two orchestrator runs never share memory, so everything the second one
//! needs (daemon port and pid, tracer pid and output path, resolved job
//! identity) is written to a small JSON file in the state directory.

use crate::core::JobInfo;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

const STATE_FILE_NAME: &str = "state.json";

#[derive(Error, Debug)]
pub enum StateError {
    #[error("failed to access state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daemon_pid: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracer_pid: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracer_output: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    /// Epoch milliseconds of the `start` invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
}

impl PersistedState {
    /// Records a resolved job identity. A denied or unresolved lookup clears it.
    pub fn set_job(&mut self, job: &JobInfo) {
        self.job_id = job.id;
        self.job_name = job.name.clone();
    }

    pub fn job(&self) -> JobInfo {
        JobInfo {
            id: self.job_id,
            name: self.job_name.clone(),
            not_accessible: false,
        }
    }
}

/// The state file inside a state directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(STATE_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the state; a missing file is an empty state.
    pub fn load(&self) -> Result<PersistedState, StateError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PersistedState::default())
            }
            Err(source) => {
                return Err(StateError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        serde_json::from_str(&content).map_err(|source| StateError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    pub fn save(&self, state: &PersistedState) -> Result<(), StateError> {
        let io_err = |source| StateError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(io_err)?;
        }
        let content = serde_json::to_string_pretty(state).map_err(|source| StateError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        std::fs::write(&self.path, content).map_err(io_err)
    }

    /// Loads, applies `f` and saves.
    pub fn update<F>(&self, f: F) -> Result<PersistedState, StateError>
    where
        F: FnOnce(&mut PersistedState),
    {
        let mut state = self.load()?;
        f(&mut state);
        self.save(&state)?;
        Ok(state)
    }
}
