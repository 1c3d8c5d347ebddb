//! Option bags and static option schemas
//!
//! Options travel as JSON maps. A missing key and an explicit `null` both
//! mean "not set", so a plugin's own defaults apply.

use crate::config::DeclarativeConfig;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

/// Flat options bag as supplied through the API
pub type Options = Map<String, Value>;

/// Options for a single plugin
pub type PluginOptions = Map<String, Value>;

/// Options for every plugin, keyed by plugin name
pub type PerPluginOptions = BTreeMap<String, PluginOptions>;

/// Extracts an option's value from the declarative config file.
///
/// The second argument is the directory containing the config file, used to
/// resolve relative paths.
pub type ConfigExtractor = fn(&DeclarativeConfig, &Path) -> Option<Value>;

/// Value type of an option, used for documentation and logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    Boolean,
    Number,
    String,
    Path,
    Array,
    Object,
    Any,
}

/// Metadata for one recognised option key
#[derive(Debug, Clone, Copy)]
pub struct OptionMeta {
    /// Key in the flat options bag
    pub key: &'static str,
    pub kind: OptionKind,
    pub description: &'static str,
    /// Declarative-config extractor, if the option can come from the file
    pub from_config: Option<ConfigExtractor>,
}

impl OptionMeta {
    /// Run this option's extractor, if it has one
    pub fn extract(&self, config: &DeclarativeConfig, config_dir: &Path) -> Option<Value> {
        self.from_config
            .and_then(|extract| extract(config, config_dir))
            .filter(|value| !value.is_null())
    }
}

/// Static option schema of a typed options struct.
///
/// Usually derived with `#[derive(PluginOptions)]`.
pub trait OptionSchema {
    /// Recognised options, in declaration order
    fn option_schema() -> Vec<OptionMeta>;
}

/// Returns the value for `key` unless it is missing or `null`
pub fn defined<'a>(options: &'a PluginOptions, key: &str) -> Option<&'a Value> {
    options.get(key).filter(|value| !value.is_null())
}

/// Resolves `path` against `base` unless it is already absolute
pub fn resolve_path(base: &Path, path: impl AsRef<Path>) -> std::path::PathBuf {
    let path = path.as_ref();
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
