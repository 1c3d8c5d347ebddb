//! Recording test doubles shared by the host integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use nimbus_host::{
    GlobalScope, HostContext, NativeRunner, ScriptRunner, WatchCallback, Watcher, WatcherError,
    WatcherFactory,
};
use nimbus_plugin_api::{
    BeforeSetupResult, Context, DeclarativeConfig, FetchEvent, Fetcher, ModuleExports,
    OptionKind, OptionMeta, Plugin, PluginContext, PluginDescriptor, PluginError,
    PluginOptions, PluginRole, PluginStorageFactory, Request, Response, ScopeValue,
    ScriptBlueprint, SetupResult,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Ordered log of hook invocations, e.g. `setup(a)`
#[derive(Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<String>>>);

impl Recorder {
    pub fn record(&self, event: impl Into<String>) {
        self.0.lock().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.0.lock().iter().filter(|e| *e == event).count()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

fn extract_greeting(config: &DeclarativeConfig, _: &Path) -> Option<Value> {
    config.vars.as_ref()?.get("greeting").cloned()
}

fn extract_farewell(config: &DeclarativeConfig, _: &Path) -> Option<Value> {
    config.vars.as_ref()?.get("farewell").cloned()
}

fn extract_flag(config: &DeclarativeConfig, _: &Path) -> Option<Value> {
    config.vars.as_ref()?.get("flag").cloned()
}

/// Descriptor for a plugin that records every hook call.
///
/// Recognises `greeting`, `farewell` and `flag` (all from `[vars]`) and
/// `paths`, which become the plugin's setup watch paths, plus any key added
/// with [`option_key`](Self::option_key). Every option is also exposed as a
/// binding.
pub struct RecordingDescriptor {
    name: &'static str,
    role: PluginRole,
    recorder: Recorder,
    script: Option<ScriptBlueprint>,
    before_setup_watch: Option<Vec<PathBuf>>,
    setup_delay: Option<Duration>,
    extra_key: Option<&'static str>,
}

impl RecordingDescriptor {
    pub fn new(name: &'static str, recorder: &Recorder) -> Self {
        Self {
            name,
            role: PluginRole::Regular,
            recorder: recorder.clone(),
            script: None,
            before_setup_watch: None,
            setup_delay: None,
            extra_key: None,
        }
    }

    /// A string option only this plugin recognises
    pub fn option_key(mut self, key: &'static str) -> Self {
        self.extra_key = Some(key);
        self
    }

    pub fn role(mut self, role: PluginRole) -> Self {
        self.role = role;
        self
    }

    pub fn script(mut self, code: &str) -> Self {
        self.script = Some(ScriptBlueprint::new(format!("{}.js", self.name), code));
        self
    }

    pub fn before_setup_watch(mut self, paths: Vec<PathBuf>) -> Self {
        self.before_setup_watch = Some(paths);
        self
    }

    pub fn setup_delay(mut self, delay: Duration) -> Self {
        self.setup_delay = Some(delay);
        self
    }

    pub fn build(self) -> Arc<dyn PluginDescriptor> {
        Arc::new(self)
    }
}

impl PluginDescriptor for RecordingDescriptor {
    fn name(&self) -> &str {
        self.name
    }

    fn role(&self) -> PluginRole {
        self.role
    }

    fn option_schema(&self) -> Vec<OptionMeta> {
        let extra = self.extra_key.map(|key| OptionMeta {
            key,
            kind: OptionKind::String,
            description: "",
            from_config: None,
        });
        let mut schema = vec![
            OptionMeta {
                key: "greeting",
                kind: OptionKind::String,
                description: "",
                from_config: Some(extract_greeting),
            },
            OptionMeta {
                key: "farewell",
                kind: OptionKind::String,
                description: "",
                from_config: Some(extract_farewell),
            },
            OptionMeta {
                key: "flag",
                kind: OptionKind::Boolean,
                description: "",
                from_config: Some(extract_flag),
            },
            OptionMeta {
                key: "paths",
                kind: OptionKind::Array,
                description: "",
                from_config: None,
            },
        ];
        schema.extend(extra);
        schema
    }

    fn instantiate(
        &self,
        _ctx: &PluginContext,
        options: &PluginOptions,
    ) -> Result<Box<dyn Plugin>, PluginError> {
        self.recorder.record(format!("new({})", self.name));
        Ok(Box::new(RecordingPlugin {
            name: self.name,
            options: options.clone(),
            recorder: self.recorder.clone(),
            script: self.script.clone(),
            before_setup_watch: self.before_setup_watch.clone(),
            setup_delay: self.setup_delay,
        }))
    }
}

pub struct RecordingPlugin {
    pub name: &'static str,
    pub options: PluginOptions,
    recorder: Recorder,
    script: Option<ScriptBlueprint>,
    before_setup_watch: Option<Vec<PathBuf>>,
    setup_delay: Option<Duration>,
}

#[async_trait]
impl Plugin for RecordingPlugin {
    fn has_before_setup(&self) -> bool {
        self.before_setup_watch.is_some()
    }

    async fn before_setup(&mut self) -> Result<BeforeSetupResult, PluginError> {
        self.recorder.record(format!("beforeSetup({})", self.name));
        Ok(BeforeSetupResult {
            watch: self.before_setup_watch.clone(),
        })
    }

    fn has_setup(&self) -> bool {
        true
    }

    async fn setup(&mut self, storage: &PluginStorageFactory) -> Result<SetupResult, PluginError> {
        if let Some(delay) = self.setup_delay {
            tokio::time::sleep(delay).await;
        }
        self.recorder.record(format!("setup({})", self.name));

        let state = storage.storage("state");
        let setups = state
            .get("setups")
            .map_err(|e| PluginError::Other(e.into()))?
            .map(|bytes| String::from_utf8_lossy(&bytes).parse::<u64>().unwrap_or(0))
            .unwrap_or(0)
            + 1;
        state
            .put("setups", setups.to_string().into_bytes())
            .map_err(|e| PluginError::Other(e.into()))?;

        let mut bindings: Context = self
            .options
            .iter()
            .map(|(key, value)| (key.clone(), ScopeValue::from(value.clone())))
            .collect();
        bindings.insert(format!("{}_setups", self.name), ScopeValue::from(json!(setups)));

        let watch = self.options.get("paths").map(|paths| {
            paths
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
                .map(PathBuf::from)
                .collect()
        });

        Ok(SetupResult {
            globals: None,
            bindings: Some(bindings),
            script: self.script.clone(),
            watch,
        })
    }

    async fn before_reload(&mut self) -> Result<(), PluginError> {
        self.recorder.record(format!("beforeReload({})", self.name));
        Ok(())
    }

    async fn reload(
        &mut self,
        _bindings: &Context,
        _exports: &ModuleExports,
    ) -> Result<(), PluginError> {
        self.recorder.record(format!("reload({})", self.name));
        Ok(())
    }

    async fn dispose(&mut self) -> Result<(), PluginError> {
        self.recorder.record(format!("dispose({})", self.name));
        Ok(())
    }
}

/// Runner that counts runs and, in classic mode, registers a fetch listener
/// responding with the script's source
pub fn counting_runner(runs: &Arc<AtomicUsize>) -> Arc<dyn ScriptRunner> {
    let runs = runs.clone();
    Arc::new(NativeRunner::new(
        move |scope: &Arc<GlobalScope>, blueprint: &ScriptBlueprint| {
            runs.fetch_add(1, Ordering::SeqCst);
            if !scope.is_modules() {
                let body = blueprint.code.clone();
                scope.add_fetch_listener(Arc::new(
                    move |event: &FetchEvent| -> anyhow::Result<()> {
                        event.respond(Response::new(body.clone()))?;
                        Ok(())
                    },
                ))?;
            }
            Ok(None)
        },
    ))
}

/// Upstream that answers every request with `upstream` and keeps them
#[derive(Default)]
pub struct RecordingUpstream {
    pub requests: Mutex<Vec<Request>>,
}

#[async_trait]
impl Fetcher for RecordingUpstream {
    async fn fetch(&self, request: Request) -> anyhow::Result<Response> {
        self.requests.lock().push(request);
        Ok(Response::new("upstream"))
    }
}

/// What a [`RecordingWatcher`] was asked to do
#[derive(Default)]
pub struct WatchLog {
    pub created: usize,
    pub watched: Vec<HashSet<PathBuf>>,
    pub unwatched: Vec<HashSet<PathBuf>>,
    pub disposed: bool,
    pub callback: Option<WatchCallback>,
}

pub struct RecordingWatcher {
    log: Arc<Mutex<WatchLog>>,
}

#[async_trait]
impl Watcher for RecordingWatcher {
    async fn watch(&mut self, paths: &HashSet<PathBuf>) -> Result<(), WatcherError> {
        self.log.lock().watched.push(paths.clone());
        Ok(())
    }

    fn unwatch(&mut self, paths: &HashSet<PathBuf>) {
        self.log.lock().unwatched.push(paths.clone());
    }

    fn dispose(&mut self) {
        self.log.lock().disposed = true;
    }
}

pub fn recording_watcher(log: &Arc<Mutex<WatchLog>>) -> WatcherFactory {
    let log = log.clone();
    Arc::new(
        move |callback: WatchCallback| -> Result<Box<dyn Watcher>, WatcherError> {
            let mut entry = log.lock();
            entry.created += 1;
            entry.callback = Some(callback);
            drop(entry);
            Ok(Box::new(RecordingWatcher { log: log.clone() }))
        },
    )
}

/// Context with a runner, an in-memory store and no network
pub fn context(runs: &Arc<AtomicUsize>) -> HostContext {
    HostContext::default()
        .with_script_runner(counting_runner(runs))
        .with_fetcher(Arc::new(RecordingUpstream::default()))
}

pub fn options(value: Value) -> serde_json::Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("options must be an object"),
    }
}

pub fn paths(paths: &[&Path]) -> HashSet<PathBuf> {
    paths.iter().map(|path| path.to_path_buf()).collect()
}
