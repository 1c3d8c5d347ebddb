//! Declarative (on-disk) worker configuration model
//!
//! Mirrors the TOML layout read by the host. Every field is optional; plugin
//! option extractors decide which parts they care about.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Project type that implies a default build pipeline
pub const PROJECT_TYPE_RUST: &str = "rust";
pub const PROJECT_TYPE_WEBPACK: &str = "webpack";

/// Root of the declarative config file
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DeclarativeConfig {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub project_type: Option<String>,
    /// Entry script, relative to the config file
    pub main: Option<String>,
    pub compatibility_date: Option<String>,
    pub compatibility_flags: Option<Vec<String>>,
    /// Plain-text bindings
    pub vars: Option<Map<String, Value>>,
    pub build: Option<BuildConfig>,
    pub dev: Option<DevConfig>,
    /// Environment-specific overrides, folded in by the loader
    pub env: Option<BTreeMap<String, Value>>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub command: Option<String>,
    pub cwd: Option<String>,
    pub watch_dir: Option<OneOrMany>,
    pub upload: Option<UploadConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// `"modules"` or `"service-worker"`
    pub format: Option<String>,
    pub dir: Option<String>,
    pub main: Option<String>,
    pub rules: Option<Vec<Value>>,
}

/// Local development settings
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DevConfig {
    pub upstream: Option<String>,
    pub watch: Option<bool>,
    pub env_path: Option<String>,
    pub globals: Option<Map<String, Value>>,
    pub service_bindings: Option<Map<String, Value>>,
    pub log_unhandled_rejections: Option<bool>,
}

/// A string or a list of strings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::One(value) => vec![value.clone()],
            Self::Many(values) => values.clone(),
        }
    }
}

impl DeclarativeConfig {
    /// Fills in the build pipeline implied by `type`, unless one is declared
    pub fn with_project_defaults(mut self) -> Self {
        if self.build.is_some() {
            return self;
        }
        match self.project_type.as_deref() {
            Some(PROJECT_TYPE_RUST) => {
                self.build = Some(BuildConfig {
                    command: Some("worker-build --release".into()),
                    cwd: None,
                    watch_dir: Some(OneOrMany::One("src".into())),
                    upload: Some(UploadConfig {
                        format: Some("modules".into()),
                        dir: Some("build/worker".into()),
                        main: Some("shim.mjs".into()),
                        rules: None,
                    }),
                });
            }
            Some(PROJECT_TYPE_WEBPACK) => {
                self.build = Some(BuildConfig {
                    command: Some("webpack".into()),
                    cwd: None,
                    watch_dir: None,
                    upload: Some(UploadConfig {
                        format: Some("service-worker".into()),
                        dir: Some("worker".into()),
                        main: Some("script.js".into()),
                        rules: None,
                    }),
                });
            }
            _ => {}
        }
        self
    }

    pub fn upload(&self) -> Option<&UploadConfig> {
        self.build.as_ref().and_then(|build| build.upload.as_ref())
    }

    pub fn dev(&self) -> Option<&DevConfig> {
        self.dev.as_ref()
    }
}
