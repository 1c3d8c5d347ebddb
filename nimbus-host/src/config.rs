//! Configuration merging
//!
//! Splits the flat options bag into per-plugin bags and layers the
//! declarative config file underneath explicit overrides, key by key.

use nimbus_plugin_api::options::defined;
use nimbus_plugin_api::{DeclarativeConfig, Options, PerPluginOptions, PluginDescriptor, PluginOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Config file looked up under the root path when `config_path = true`
pub const DEFAULT_CONFIG_FILE: &str = "nimbus.toml";

/// Errors loading the declarative config file
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file {path} not found")]
    NotFound { path: PathBuf },

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Copies each plugin's declared keys out of a flat options bag.
///
/// Keys no plugin declares are ignored, so callers may pass a superset.
pub fn split_options(
    descriptors: &[Arc<dyn PluginDescriptor>],
    options: &Options,
) -> PerPluginOptions {
    descriptors
        .iter()
        .map(|descriptor| {
            let mut plugin_options = PluginOptions::new();
            for meta in descriptor.option_schema() {
                if let Some(value) = options.get(meta.key) {
                    plugin_options.insert(meta.key.to_string(), value.clone());
                }
            }
            (descriptor.name().to_string(), plugin_options)
        })
        .collect()
}

/// Layers declarative config values under explicit overrides.
///
/// Each key is the override if defined, else the value the option's
/// extractor finds in `config`, else absent. The result is always built from
/// scratch so keys removed from the file become unset on the next pass.
pub fn merge_declarative_config(
    descriptors: &[Arc<dyn PluginDescriptor>],
    overrides: &PerPluginOptions,
    config: &DeclarativeConfig,
    config_dir: &Path,
) -> PerPluginOptions {
    let empty = PluginOptions::new();
    descriptors
        .iter()
        .map(|descriptor| {
            let plugin_overrides = overrides.get(descriptor.name()).unwrap_or(&empty);
            let mut merged = PluginOptions::new();
            for meta in descriptor.option_schema() {
                let value = defined(plugin_overrides, meta.key)
                    .cloned()
                    .or_else(|| meta.extract(config, config_dir));
                if let Some(value) = value {
                    merged.insert(meta.key.to_string(), value);
                }
            }
            (descriptor.name().to_string(), merged)
        })
        .collect()
}

/// Applies `next` over `previous` key by key
pub fn merge_options(previous: &Options, next: Options) -> Options {
    let mut merged = previous.clone();
    merged.extend(next);
    merged
}

/// Reads and parses a declarative config file.
///
/// `env` folds the matching `[env.<name>]` table over the top-level keys.
/// Project-type build defaults are applied last.
pub async fn load_declarative_config(
    path: &Path,
    env: Option<&str>,
) -> Result<DeclarativeConfig, ConfigError> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
            })
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    parse_declarative_config(&text, env).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Parses declarative config text, folding in `env` if given
pub fn parse_declarative_config(
    text: &str,
    env: Option<&str>,
) -> Result<DeclarativeConfig, toml::de::Error> {
    let mut table: toml::Table = text.parse()?;

    if let Some(env) = env {
        let overlay = table
            .get("env")
            .and_then(|envs| envs.get(env))
            .and_then(toml::Value::as_table)
            .cloned();
        match overlay {
            Some(overlay) => table.extend(overlay),
            None => tracing::warn!(env = %env, "Config environment not found, using top-level config"),
        }
    }

    let config: DeclarativeConfig = toml::Value::Table(table).try_into()?;
    Ok(config.with_project_defaults())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_plugin_api::{
        ConfigurablePlugin, OptionSchema, Plugin, PluginContext, PluginError, PluginOptions as
        DerivePluginOptions,
    };
    use serde::Deserialize;
    use serde_json::{json, Value};

    fn extract_upstream(config: &DeclarativeConfig, _dir: &Path) -> Option<Value> {
        config.dev()?.upstream.clone().map(Value::String)
    }

    fn extract_main(config: &DeclarativeConfig, dir: &Path) -> Option<Value> {
        let main = config.main.as_ref()?;
        Some(json!(dir.join(main).to_string_lossy()))
    }

    #[allow(dead_code)]
    #[derive(Deserialize, DerivePluginOptions)]
    struct TestOptions {
        #[option(kind = String, from_config = extract_upstream)]
        upstream: Option<String>,
        #[option(kind = Path, from_config = extract_main)]
        script_path: Option<String>,
        #[option(kind = Boolean)]
        debug: Option<bool>,
    }

    struct TestPlugin;

    impl Plugin for TestPlugin {}

    impl ConfigurablePlugin for TestPlugin {
        const NAME: &'static str = "test";
        type Options = TestOptions;

        fn new(_ctx: &PluginContext, _options: TestOptions) -> Result<Self, PluginError> {
            Ok(Self)
        }
    }

    #[allow(dead_code)]
    #[derive(Deserialize, DerivePluginOptions)]
    struct OtherOptions {
        #[option(kind = Boolean)]
        debug: Option<bool>,
        #[option(kind = String)]
        name: Option<String>,
    }

    struct OtherPlugin;

    impl Plugin for OtherPlugin {}

    impl ConfigurablePlugin for OtherPlugin {
        const NAME: &'static str = "other";
        type Options = OtherOptions;

        fn new(_ctx: &PluginContext, _options: OtherOptions) -> Result<Self, PluginError> {
            Ok(Self)
        }
    }

    fn descriptors() -> Vec<Arc<dyn PluginDescriptor>> {
        vec![
            nimbus_plugin_api::descriptor::<TestPlugin>(),
            nimbus_plugin_api::descriptor::<OtherPlugin>(),
        ]
    }

    fn file_config() -> DeclarativeConfig {
        parse_declarative_config(
            r#"
            main = "worker.js"

            [dev]
            upstream = "https://file.example"
            "#,
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_split_options_ignores_unknown_and_shares_keys() {
        let options = json!({ "debug": true, "name": "w", "unknown": 1 });
        let split = split_options(&descriptors(), options.as_object().unwrap());

        assert_eq!(split["test"], *json!({ "debug": true }).as_object().unwrap());
        assert_eq!(
            split["other"],
            *json!({ "debug": true, "name": "w" }).as_object().unwrap()
        );
        assert_eq!(TestOptions::option_schema().len(), 3);
    }

    #[test]
    fn test_merge_override_beats_file() {
        let overrides = split_options(
            &descriptors(),
            json!({ "upstream": "https://override.example" })
                .as_object()
                .unwrap(),
        );
        let merged = merge_declarative_config(
            &descriptors(),
            &overrides,
            &file_config(),
            Path::new("/project"),
        );

        assert_eq!(merged["test"]["upstream"], json!("https://override.example"));
        assert_eq!(
            merged["test"]["script_path"],
            json!(Path::new("/project").join("worker.js").to_string_lossy())
        );
        assert!(merged["other"].is_empty());
    }

    #[test]
    fn test_merge_falsy_override_wins_and_null_does_not() {
        let overrides = split_options(
            &descriptors(),
            json!({ "upstream": "", "script_path": null })
                .as_object()
                .unwrap(),
        );
        let merged = merge_declarative_config(
            &descriptors(),
            &overrides,
            &file_config(),
            Path::new("/project"),
        );

        assert_eq!(merged["test"]["upstream"], json!(""));
        assert!(merged["test"]["script_path"].is_string());
    }

    #[test]
    fn test_merge_removed_file_key_is_unset() {
        let overrides = PerPluginOptions::new();
        let first = merge_declarative_config(
            &descriptors(),
            &overrides,
            &file_config(),
            Path::new("/"),
        );
        let second = merge_declarative_config(
            &descriptors(),
            &overrides,
            &DeclarativeConfig::default(),
            Path::new("/"),
        );

        assert!(first["test"].contains_key("upstream"));
        assert!(!second["test"].contains_key("upstream"));
        assert!(overrides.is_empty());
    }

    #[test]
    fn test_merge_options_is_key_by_key() {
        let previous = json!({ "a": 1, "b": 2 }).as_object().unwrap().clone();
        let next = json!({ "b": 3, "c": 4 }).as_object().unwrap().clone();

        assert_eq!(
            Value::Object(merge_options(&previous, next)),
            json!({ "a": 1, "b": 3, "c": 4 })
        );
    }

    #[test]
    fn test_parse_folds_environment() {
        let text = r#"
            name = "worker"
            main = "top.js"

            [env.staging]
            main = "staging.js"
        "#;

        let top = parse_declarative_config(text, None).unwrap();
        assert_eq!(top.main.as_deref(), Some("top.js"));

        let staging = parse_declarative_config(text, Some("staging")).unwrap();
        assert_eq!(staging.main.as_deref(), Some("staging.js"));
        assert_eq!(staging.name.as_deref(), Some("worker"));

        let missing = parse_declarative_config(text, Some("production")).unwrap();
        assert_eq!(missing.main.as_deref(), Some("top.js"));
    }

    #[test]
    fn test_parse_applies_project_defaults() {
        let config = parse_declarative_config(r#"type = "rust""#, None).unwrap();
        let upload = config.upload().unwrap();
        assert_eq!(upload.format.as_deref(), Some("modules"));
        assert_eq!(
            config.build.as_ref().unwrap().command.as_deref(),
            Some("worker-build --release")
        );
    }

    #[tokio::test]
    async fn test_load_distinguishes_missing_and_invalid() {
        let dir = tempfile::tempdir().unwrap();

        let missing = load_declarative_config(&dir.path().join("nope.toml"), None).await;
        assert!(missing.unwrap_err().is_not_found());

        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, "main = ").unwrap();
        let invalid = load_declarative_config(&path, None).await;
        assert!(matches!(invalid, Err(ConfigError::Parse { .. })));
    }
}
