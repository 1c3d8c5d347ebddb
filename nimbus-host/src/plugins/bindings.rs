//! The bindings plugin: user-declared bindings, `.env` files and service bindings
//!
//! Ordered last so anything declared here overrides bindings from earlier
//! plugins. Service bindings are handed to the script before their target
//! exists; the target is resolved in `reload`, once every sibling host has
//! been mounted on the service registry.

use async_trait::async_trait;
use nimbus_plugin_api::options::resolve_path;
use nimbus_plugin_api::{
    ConfigurablePlugin, Context, DeclarativeConfig, Fetcher, ModuleExports, Plugin,
    PluginContext, PluginError, PluginOptions, PluginRole, PluginStorageFactory, Request,
    Response, ScopeValue, ServiceRegistry, SetupResult,
};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default env file, relative to the root path
pub const DEFAULT_ENV_FILE: &str = ".env";

/// `true` for the default env file, or an explicit path
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum EnvPath {
    Default(bool),
    Path(PathBuf),
}

#[derive(Debug, Clone, Default, Deserialize, PluginOptions)]
#[serde(default)]
pub struct BindingsOptions {
    /// Env file loaded into bindings, `true` for `.env`
    #[option(kind = Any, from_config = extract_env_path)]
    pub env_path: Option<EnvPath>,

    /// Plain bindings, overriding values from the env file
    #[option(kind = Object, from_config = extract_bindings)]
    pub bindings: Option<Map<String, Value>>,

    /// Extra globals
    #[option(kind = Object, from_config = extract_globals)]
    pub globals: Option<Map<String, Value>>,

    /// Binding name to the name of a registered service
    #[option(kind = Object, from_config = extract_service_bindings)]
    pub service_bindings: Option<BTreeMap<String, String>>,
}

fn extract_env_path(config: &DeclarativeConfig, config_dir: &Path) -> Option<Value> {
    let env_path = config.dev()?.env_path.as_deref()?;
    Some(Value::String(
        resolve_path(config_dir, env_path)
            .to_string_lossy()
            .into_owned(),
    ))
}

fn extract_bindings(config: &DeclarativeConfig, _: &Path) -> Option<Value> {
    config.vars.clone().map(Value::Object)
}

fn extract_globals(config: &DeclarativeConfig, _: &Path) -> Option<Value> {
    config.dev()?.globals.clone().map(Value::Object)
}

fn extract_service_bindings(config: &DeclarativeConfig, _: &Path) -> Option<Value> {
    config.dev()?.service_bindings.clone().map(Value::Object)
}

/// A binding that forwards requests to another worker host.
///
/// Exposed to scripts as an `Arc<dyn Fetcher>` host object.
pub struct ServiceBinding {
    binding: String,
    service: String,
    target: RwLock<Option<Arc<dyn Fetcher>>>,
}

impl ServiceBinding {
    fn new(binding: &str, service: &str) -> Self {
        Self {
            binding: binding.to_string(),
            service: service.to_string(),
            target: RwLock::new(None),
        }
    }

    pub fn binding(&self) -> &str {
        &self.binding
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn is_resolved(&self) -> bool {
        self.target.read().is_some()
    }
}

#[async_trait]
impl Fetcher for ServiceBinding {
    async fn fetch(&self, request: Request) -> anyhow::Result<Response> {
        let target = self.target.read().clone();
        match target {
            Some(target) => target.fetch(request).await,
            None => anyhow::bail!(
                "Service binding \"{}\" used before service \"{}\" was resolved",
                self.binding,
                self.service
            ),
        }
    }
}

impl fmt::Debug for ServiceBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceBinding")
            .field("binding", &self.binding)
            .field("service", &self.service)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

pub struct BindingsPlugin {
    options: BindingsOptions,
    /// Resolved env file and whether it was implicit
    env_path: Option<(PathBuf, bool)>,
    services: ServiceRegistry,
    service_bindings: Vec<Arc<ServiceBinding>>,
}

impl BindingsPlugin {
    pub fn env_path(&self) -> Option<&Path> {
        self.env_path.as_ref().map(|(path, _)| path.as_path())
    }

    pub fn service_bindings(&self) -> &[Arc<ServiceBinding>] {
        &self.service_bindings
    }

    async fn load_env(&self) -> Result<Vec<(String, String)>, PluginError> {
        let Some((path, implicit)) = &self.env_path else {
            return Ok(Vec::new());
        };
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Ok(parse_env(&text)),
            Err(e) if *implicit && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::trace!(path = %path.display(), "No env file");
                Ok(Vec::new())
            }
            Err(e) => Err(PluginError::io(path, e)),
        }
    }
}

impl ConfigurablePlugin for BindingsPlugin {
    const NAME: &'static str = "bindings";
    const ROLE: PluginRole = PluginRole::Bindings;
    type Options = BindingsOptions;

    fn new(ctx: &PluginContext, options: BindingsOptions) -> Result<Self, PluginError> {
        let env_path = match &options.env_path {
            Some(EnvPath::Default(true)) => Some((ctx.root_path.join(DEFAULT_ENV_FILE), true)),
            Some(EnvPath::Path(path)) => Some((resolve_path(&ctx.root_path, path), false)),
            Some(EnvPath::Default(false)) | None => None,
        };
        Ok(Self {
            options,
            env_path,
            services: ctx.services.clone(),
            service_bindings: Vec::new(),
        })
    }
}

#[async_trait]
impl Plugin for BindingsPlugin {
    fn has_setup(&self) -> bool {
        true
    }

    async fn setup(&mut self, _storage: &PluginStorageFactory) -> Result<SetupResult, PluginError> {
        let mut bindings = Context::new();
        for (key, value) in self.load_env().await? {
            bindings.insert(key, ScopeValue::from(value));
        }
        for (key, value) in self.options.bindings.iter().flatten() {
            bindings.insert(key.clone(), ScopeValue::from(value.clone()));
        }

        self.service_bindings.clear();
        for (binding, service) in self.options.service_bindings.iter().flatten() {
            let service_binding = Arc::new(ServiceBinding::new(binding, service));
            let fetcher: Arc<dyn Fetcher> = service_binding.clone();
            bindings.insert(binding.clone(), ScopeValue::object(fetcher));
            self.service_bindings.push(service_binding);
        }

        let globals: Context = self
            .options
            .globals
            .iter()
            .flatten()
            .map(|(key, value)| (key.clone(), ScopeValue::from(value.clone())))
            .collect();

        Ok(SetupResult {
            globals: Some(globals),
            bindings: Some(bindings),
            script: None,
            watch: self.env_path.as_ref().map(|(path, _)| vec![path.clone()]),
        })
    }

    async fn before_reload(&mut self) -> Result<(), PluginError> {
        for service_binding in &self.service_bindings {
            *service_binding.target.write() = None;
        }
        Ok(())
    }

    async fn reload(
        &mut self,
        _bindings: &Context,
        _exports: &ModuleExports,
    ) -> Result<(), PluginError> {
        for service_binding in &self.service_bindings {
            let target = self.services.get(&service_binding.service).ok_or_else(|| {
                PluginError::config(format!(
                    "Service \"{}\" for binding \"{}\" not found. Make sure \"{}\" is mounted, available services: [{}]",
                    service_binding.service,
                    service_binding.binding,
                    service_binding.service,
                    self.services.names().join(", ")
                ))
            })?;
            *service_binding.target.write() = Some(target);
        }
        Ok(())
    }

    async fn dispose(&mut self) -> Result<(), PluginError> {
        self.before_reload().await
    }
}

/// Parses a `.env` file into ordered key/value pairs. Lines that do not
/// parse are skipped with a warning.
pub fn parse_env(text: &str) -> Vec<(String, String)> {
    dotenvy::from_read_iter(text.as_bytes())
        .filter_map(|entry| match entry {
            Ok(pair) => Some(pair),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping invalid .env line");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_declarative_config;
    use nimbus_plugin_api::{Compatibility, MemoryStorageFactory, OptionSchema};
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    struct Echo(&'static str);

    #[async_trait]
    impl Fetcher for Echo {
        async fn fetch(&self, request: Request) -> anyhow::Result<Response> {
            Ok(Response::new(format!("{}:{}", self.0, request.url().path())))
        }
    }

    fn plugin(root: &Path, services: &ServiceRegistry, options: Value) -> BindingsPlugin {
        let ctx = PluginContext {
            compat: Compatibility::default(),
            root_path: root.to_path_buf(),
            fetcher: Arc::new(Echo("upstream")),
            services: services.clone(),
        };
        let options: BindingsOptions = serde_json::from_value(options).unwrap();
        BindingsPlugin::new(&ctx, options).unwrap()
    }

    fn storage() -> PluginStorageFactory {
        PluginStorageFactory::new(Arc::new(MemoryStorageFactory::new()), BindingsPlugin::NAME)
    }

    #[test]
    fn test_parse_env() {
        let entries = parse_env(
            "# comment\n\
             KEY=value\n\
             export EXPORTED = spaced \n\
             DOUBLE=\"line1\\nline2\"\n\
             SINGLE='raw\\n'\n\
             INLINE=value # trailing\n\
             ESCAPED=\"say \\\"hi\\\"\"\n\
             not a pair\n\
             AFTER=kept\n",
        );
        assert_eq!(
            entries,
            vec![
                ("KEY".to_string(), "value".to_string()),
                ("EXPORTED".to_string(), "spaced".to_string()),
                ("DOUBLE".to_string(), "line1\nline2".to_string()),
                ("SINGLE".to_string(), "raw\\n".to_string()),
                ("INLINE".to_string(), "value".to_string()),
                ("ESCAPED".to_string(), "say \"hi\"".to_string()),
                ("AFTER".to_string(), "kept".to_string()),
            ]
        );
    }

    #[test]
    fn test_extractors() {
        let config = parse_declarative_config(
            r#"
            [vars]
            KEY = "value"
            [dev]
            env_path = ".env.local"
            service_bindings = { AUTH = "auth" }
            "#,
            None,
        )
        .unwrap();
        let values: BTreeMap<_, _> = BindingsOptions::option_schema()
            .iter()
            .map(|meta| (meta.key, meta.extract(&config, Path::new("/project"))))
            .collect();

        assert_eq!(
            values["env_path"],
            Some(json!(Path::new("/project").join(".env.local")))
        );
        assert_eq!(values["bindings"], Some(json!({ "KEY": "value" })));
        assert_eq!(values["globals"], None);
        assert_eq!(values["service_bindings"], Some(json!({ "AUTH": "auth" })));
    }

    #[tokio::test]
    async fn test_bindings_override_env_file() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(".env"), "A=env\nB=env\n").unwrap();
        let mut bindings = plugin(
            temp.path(),
            &ServiceRegistry::new(),
            json!({ "env_path": true, "bindings": { "B": "option" }, "globals": { "G": 1 } }),
        );

        let result = bindings.setup(&storage()).await.unwrap();
        let values = result.bindings.unwrap();
        assert_eq!(values["A"].as_str(), Some("env"));
        assert_eq!(values["B"].as_str(), Some("option"));
        assert_eq!(result.globals.unwrap()["G"].as_json(), Some(&json!(1)));
        assert_eq!(result.watch, Some(vec![temp.path().join(".env")]));
    }

    #[tokio::test]
    async fn test_missing_env_file() {
        let temp = TempDir::new().unwrap();
        let services = ServiceRegistry::new();

        let mut implicit = plugin(temp.path(), &services, json!({ "env_path": true }));
        assert!(implicit.setup(&storage()).await.unwrap().bindings.unwrap().is_empty());

        let mut explicit = plugin(temp.path(), &services, json!({ "env_path": "missing.env" }));
        assert!(matches!(
            explicit.setup(&storage()).await,
            Err(PluginError::Io { .. })
        ));
    }

    #[tokio::test]
    async fn test_service_binding_resolves_on_reload() {
        let temp = TempDir::new().unwrap();
        let services = ServiceRegistry::new();
        let mut bindings = plugin(
            temp.path(),
            &services,
            json!({ "service_bindings": { "AUTH": "auth" } }),
        );

        let result = bindings.setup(&storage()).await.unwrap();
        let fetcher = result.bindings.unwrap()["AUTH"]
            .downcast::<Arc<dyn Fetcher>>()
            .unwrap();
        let request = || Request::get("http://localhost/login").unwrap();
        assert!(fetcher.fetch(request()).await.is_err());

        let err = bindings
            .reload(&Context::new(), &ModuleExports::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Service \"auth\" for binding \"AUTH\" not found"));

        services.register("auth", Arc::new(Echo("auth")));
        bindings
            .reload(&Context::new(), &ModuleExports::default())
            .await
            .unwrap();
        assert_eq!(fetcher.fetch(request()).await.unwrap().text(), "auth:/login");

        bindings.before_reload().await.unwrap();
        assert!(!bindings.service_bindings()[0].is_resolved());
    }
}
