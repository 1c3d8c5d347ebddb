//! The core plugin: worker script, module mode, compatibility and upstream
//!
//! Always present and always first. The orchestrator reads several of its
//! resolved options (module mode, module rules, upstream, watch) directly.

use crate::runner::{process_module_rules, ModuleRule, ProcessedModuleRule};
use async_trait::async_trait;
use nimbus_plugin_api::options::resolve_path;
use nimbus_plugin_api::{
    Compatibility, ConfigurablePlugin, Context, DeclarativeConfig, Fetcher, Plugin,
    PluginContext, PluginError, PluginOptions, PluginRole, PluginStorageFactory, ScopeValue,
    ScriptBlueprint, SetupResult,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use url::Url;

/// Blueprint path used for inline scripts
pub const STRING_SCRIPT_PATH: &str = "<script>";

/// `true` for the default config file, or an explicit path
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ConfigPath {
    Default(bool),
    Path(PathBuf),
}

#[derive(Debug, Clone, Default, Deserialize, PluginOptions)]
#[serde(default)]
pub struct CoreOptions {
    /// Inline worker script
    #[option(kind = String)]
    pub script: Option<String>,

    /// Path to the worker script
    #[option(kind = Path, from_config = extract_script_path)]
    pub script_path: Option<PathBuf>,

    /// Directory relative paths are resolved against
    #[option(kind = Path)]
    pub root_path: Option<PathBuf>,

    /// Declarative config file, `true` for the default
    #[option(kind = Any)]
    pub config_path: Option<ConfigPath>,

    /// Environment table folded over the top-level config
    #[option(kind = String)]
    pub config_env: Option<String>,

    /// Treat the script as a module worker
    #[option(kind = Boolean, from_config = extract_modules)]
    pub modules: Option<bool>,

    #[option(kind = Array, from_config = extract_modules_rules)]
    pub modules_rules: Option<Vec<ModuleRule>>,

    #[option(kind = String, from_config = extract_compatibility_date)]
    pub compatibility_date: Option<String>,

    #[option(kind = Array, from_config = extract_compatibility_flags)]
    pub compatibility_flags: Option<Vec<String>>,

    /// Origin unanswered requests are proxied to
    #[option(kind = String, from_config = extract_upstream)]
    pub upstream: Option<String>,

    /// Rebuild and reload when watched files change
    #[option(kind = Boolean, from_config = extract_watch)]
    pub watch: Option<bool>,

    #[option(kind = Boolean)]
    pub debug: Option<bool>,

    #[option(kind = Boolean)]
    pub verbose: Option<bool>,

    #[option(kind = Boolean, from_config = extract_log_unhandled_rejections)]
    pub log_unhandled_rejections: Option<bool>,
}

fn extract_script_path(config: &DeclarativeConfig, config_dir: &Path) -> Option<Value> {
    let path = match config.upload() {
        Some(upload) if upload.main.is_some() => {
            let dir = upload.dir.as_deref().unwrap_or("dist");
            config_dir.join(dir).join(upload.main.as_deref()?)
        }
        _ => config_dir.join(config.main.as_deref()?),
    };
    Some(Value::String(path.to_string_lossy().into_owned()))
}

fn extract_modules(config: &DeclarativeConfig, _: &Path) -> Option<Value> {
    let format = config.upload()?.format.as_deref()?;
    Some(json!(format == "modules"))
}

fn extract_modules_rules(config: &DeclarativeConfig, _: &Path) -> Option<Value> {
    config.upload()?.rules.clone().map(Value::Array)
}

fn extract_compatibility_date(config: &DeclarativeConfig, _: &Path) -> Option<Value> {
    config.compatibility_date.clone().map(Value::String)
}

fn extract_compatibility_flags(config: &DeclarativeConfig, _: &Path) -> Option<Value> {
    config.compatibility_flags.as_ref().map(|flags| json!(flags))
}

fn extract_upstream(config: &DeclarativeConfig, _: &Path) -> Option<Value> {
    config.dev()?.upstream.clone().map(Value::String)
}

fn extract_watch(config: &DeclarativeConfig, _: &Path) -> Option<Value> {
    config.dev()?.watch.map(Value::Bool)
}

fn extract_log_unhandled_rejections(config: &DeclarativeConfig, _: &Path) -> Option<Value> {
    config.dev()?.log_unhandled_rejections.map(Value::Bool)
}

impl CoreOptions {
    /// Root path from an options bag, before any plugin is built
    pub fn root_path_from(options: &PluginOptions, cwd: &Path) -> PathBuf {
        match options.get("root_path").and_then(Value::as_str) {
            Some(root) => resolve_path(cwd, root),
            None => cwd.to_path_buf(),
        }
    }

    /// Config file location from an options bag, and whether it was implicit
    pub fn config_path_from(options: &PluginOptions, root_path: &Path) -> Option<(PathBuf, bool)> {
        match options.get("config_path")? {
            Value::Bool(true) => Some((root_path.join(crate::config::DEFAULT_CONFIG_FILE), true)),
            Value::String(path) => Some((resolve_path(root_path, path), false)),
            _ => None,
        }
    }
}

pub struct CorePlugin {
    options: CoreOptions,
    root_path: PathBuf,
    compat: Compatibility,
    fetcher: Arc<dyn Fetcher>,
    upstream: Option<Url>,
    processed_module_rules: Vec<ProcessedModuleRule>,
}

impl CorePlugin {
    pub fn is_modules(&self) -> bool {
        self.options.modules.unwrap_or(false)
    }

    pub fn processed_module_rules(&self) -> &[ProcessedModuleRule] {
        &self.processed_module_rules
    }

    pub fn upstream_url(&self) -> Option<&Url> {
        self.upstream.as_ref()
    }

    pub fn script_path(&self) -> Option<PathBuf> {
        self.options
            .script_path
            .as_ref()
            .map(|path| resolve_path(&self.root_path, path))
    }

    pub fn is_watching(&self) -> bool {
        self.options.watch.unwrap_or(false)
    }

    pub fn log_unhandled_rejections(&self) -> bool {
        self.options.log_unhandled_rejections.unwrap_or(false)
    }

    pub fn is_debug(&self) -> bool {
        self.options.debug.unwrap_or(false)
    }

    pub fn is_verbose(&self) -> bool {
        self.options.verbose.unwrap_or(false)
    }

    pub fn options(&self) -> &CoreOptions {
        &self.options
    }
}

impl ConfigurablePlugin for CorePlugin {
    const NAME: &'static str = "core";
    const ROLE: PluginRole = PluginRole::Core;
    type Options = CoreOptions;

    fn new(ctx: &PluginContext, options: CoreOptions) -> Result<Self, PluginError> {
        let processed_module_rules =
            process_module_rules(options.modules_rules.as_deref().unwrap_or_default()).map_err(
                |e| PluginError::config(format!("Invalid glob in modules_rules: {e}")),
            )?;
        let upstream = options
            .upstream
            .as_deref()
            .map(|upstream| {
                Url::parse(upstream).map_err(|e| {
                    PluginError::config(format!(
                        "Invalid upstream URL \"{upstream}\": {e}. Upstream must be an absolute URL such as https://example.com"
                    ))
                })
            })
            .transpose()?;
        Ok(Self {
            options,
            root_path: ctx.root_path.clone(),
            compat: ctx.compat.clone(),
            fetcher: ctx.fetcher.clone(),
            upstream,
            processed_module_rules,
        })
    }
}

#[async_trait]
impl Plugin for CorePlugin {
    fn has_setup(&self) -> bool {
        true
    }

    async fn setup(&mut self, _storage: &PluginStorageFactory) -> Result<SetupResult, PluginError> {
        let mut globals = Context::new();
        globals.insert("fetch".into(), ScopeValue::object(self.fetcher.clone()));
        globals.insert("NIMBUS".into(), ScopeValue::from(json!(true)));
        if self.compat.is_enabled("global_navigator") {
            globals.insert(
                "navigator".into(),
                ScopeValue::from(json!({ "userAgent": "nimbus" })),
            );
        }

        if let Some(code) = &self.options.script {
            return Ok(SetupResult {
                globals: Some(globals),
                script: Some(ScriptBlueprint::new(STRING_SCRIPT_PATH, code.clone())),
                ..Default::default()
            });
        }

        if let Some(path) = self.script_path() {
            let code = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| PluginError::io(&path, e))?;
            return Ok(SetupResult {
                globals: Some(globals),
                script: Some(ScriptBlueprint::new(&path, code)),
                watch: Some(vec![path]),
                ..Default::default()
            });
        }

        Ok(SetupResult {
            globals: Some(globals),
            ..Default::default()
        })
    }
}
