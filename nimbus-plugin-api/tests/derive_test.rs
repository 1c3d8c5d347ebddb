//! Tests for #[derive(PluginOptions)]

use nimbus_plugin_api::{DeclarativeConfig, OptionKind, OptionSchema, PluginOptions};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

fn extract_main(config: &DeclarativeConfig, dir: &Path) -> Option<Value> {
    config
        .main
        .as_ref()
        .map(|main| json!(dir.join(main).to_string_lossy()))
}

#[allow(dead_code)]
#[derive(Deserialize, PluginOptions)]
struct ExampleOptions {
    /// Path to the worker script
    #[option(kind = Path, from_config = extract_main)]
    script_path: Option<PathBuf>,

    /// Rebuild on change.
    /// Also watches the config file.
    #[option(kind = Boolean)]
    watch: Option<bool>,

    #[option(rename = "envPath")]
    env_path: Option<Value>,

    #[option(skip)]
    #[serde(skip)]
    internal: Option<String>,
}

#[test]
fn test_schema_lists_fields_in_order() {
    let keys: Vec<_> = ExampleOptions::option_schema()
        .iter()
        .map(|meta| meta.key)
        .collect();
    assert_eq!(keys, vec!["script_path", "watch", "envPath"]);
}

#[test]
fn test_schema_kinds_and_descriptions() {
    let schema = ExampleOptions::option_schema();

    assert_eq!(schema[0].kind, OptionKind::Path);
    assert_eq!(schema[0].description, "Path to the worker script");
    assert_eq!(schema[1].kind, OptionKind::Boolean);
    assert_eq!(
        schema[1].description,
        "Rebuild on change. Also watches the config file."
    );
    assert_eq!(schema[2].kind, OptionKind::Any);
    assert_eq!(schema[2].description, "");
}

#[test]
fn test_schema_extractor_is_wired() {
    let schema = ExampleOptions::option_schema();
    let config = DeclarativeConfig {
        main: Some("worker.js".into()),
        ..Default::default()
    };
    let dir = Path::new("/project");

    assert_eq!(
        schema[0].extract(&config, dir),
        Some(json!(dir.join("worker.js").to_string_lossy()))
    );
    assert!(schema[1].from_config.is_none());
    assert_eq!(schema[1].extract(&config, dir), None);
}
