//! Errors returned by plugin hooks

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur inside a plugin hook or while constructing a plugin
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Invalid options for plugin {plugin}: {source}")]
    InvalidOptions {
        plugin: String,
        #[source]
        source: serde_json::Error,
    },

    /// Fatal configuration problem; the message says how to fix it
    #[error("{0}")]
    Config(String),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Build failed with exit code {exit_code}")]
    Build { exit_code: i32 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PluginError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Exit code of a failed build step, if this is one
    pub fn build_exit_code(&self) -> Option<i32> {
        match self {
            Self::Build { exit_code } => Some(*exit_code),
            _ => None,
        }
    }
}
