//! Plugin orchestration and the reload engine
//!
//! [`Orchestrator`] owns the plugin instances and everything derived from
//! them: merged option snapshots, cached setup results, watch paths and the
//! current global scope. It is not synchronised itself; [`WorkerHost`]
//! keeps it behind a mutex and is the only caller.
//!
//! [`WorkerHost`]: crate::WorkerHost

use crate::config::{
    load_declarative_config, merge_declarative_config, merge_options, split_options,
};
use crate::error::HostError;
use crate::fetcher::HttpFetcher;
use crate::plugins::{CoreOptions, CorePlugin};
use crate::rejection::RejectionRegistry;
use crate::runner::ScriptRunner;
use crate::scope::{GlobalScope, ScopeDispatch};
use crate::watch::{diff_watch_paths, WatchCallback, Watcher, WatcherFactory};
use nimbus_plugin_api::{
    descriptor, Compatibility, ConfigurablePlugin, Context, DeclarativeConfig, Fetcher,
    MemoryStorageFactory, ModuleExports, Options, PerPluginOptions, Plugin, PluginContext,
    PluginDescriptor, PluginOptions, PluginRole, PluginStorageFactory, ScriptBlueprint,
    ServiceRegistry, SetupResult, StorageFactory,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Bundles above this size get a warning after reload
pub const BUNDLE_SIZE_WARNING: u64 = 1_048_576;

/// Collaborators shared by every reload of a host
#[derive(Clone)]
pub struct HostContext {
    /// Backing store for plugin storage
    pub storage: Arc<dyn StorageFactory>,
    /// Runs the worker script; without one, scripts are collected but never run
    pub script_runner: Option<Arc<dyn ScriptRunner>>,
    /// Fail initialisation when no plugin provides a script
    pub script_required: bool,
    /// Builds the watcher the first time watch mode needs one
    pub watcher_factory: Option<WatcherFactory>,
    /// Outbound fetcher for subrequests and upstream proxying
    pub fetcher: Arc<dyn Fetcher>,
    pub services: ServiceRegistry,
    pub rejections: RejectionRegistry,
    /// Directory `root_path` is resolved against
    pub cwd: PathBuf,
}

impl HostContext {
    pub fn with_script_runner(mut self, runner: Arc<dyn ScriptRunner>) -> Self {
        self.script_runner = Some(runner);
        self
    }

    pub fn with_script_required(mut self, required: bool) -> Self {
        self.script_required = required;
        self
    }

    pub fn with_watcher_factory(mut self, factory: WatcherFactory) -> Self {
        self.watcher_factory = Some(factory);
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn StorageFactory>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_services(mut self, services: ServiceRegistry) -> Self {
        self.services = services;
        self
    }

    pub fn with_rejections(mut self, rejections: RejectionRegistry) -> Self {
        self.rejections = rejections;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }
}

impl Default for HostContext {
    fn default() -> Self {
        Self {
            storage: Arc::new(MemoryStorageFactory::new()),
            script_runner: None,
            script_required: false,
            watcher_factory: None,
            fetcher: Arc::new(HttpFetcher::new()),
            services: ServiceRegistry::new(),
            rejections: RejectionRegistry::new(),
            cwd: std::env::current_dir().unwrap_or_default(),
        }
    }
}

impl fmt::Debug for HostContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostContext")
            .field("script_runner", &self.script_runner.is_some())
            .field("script_required", &self.script_required)
            .field("watcher_factory", &self.watcher_factory.is_some())
            .field("cwd", &self.cwd)
            .finish_non_exhaustive()
    }
}

/// Sent to subscribers after every successful reload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadEvent {
    /// True for the reload that completed initialisation
    pub initial: bool,
    /// Plugin names in execution order
    pub plugins: Vec<String>,
}

/// Plugin instances keyed by name, iterated in execution order
#[derive(Default)]
pub struct PluginInstances {
    order: Vec<String>,
    instances: HashMap<String, Box<dyn Plugin>>,
}

impl PluginInstances {
    fn new(order: Vec<String>) -> Self {
        Self {
            order,
            instances: HashMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&(dyn Plugin + 'static)> {
        self.instances.get(name).map(Box::as_ref)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut (dyn Plugin + 'static)> {
        self.instances.get_mut(name).map(Box::as_mut)
    }

    /// Instance of a built-in or typed plugin
    pub fn get_as<P: ConfigurablePlugin>(&self) -> Option<&P> {
        self.get(P::NAME)?.downcast_ref::<P>()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.instances.contains_key(name)
    }

    /// Plugin names in execution order
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &(dyn Plugin + 'static))> + '_ {
        self.order
            .iter()
            .filter_map(|name| Some((name.as_str(), self.get(name)?)))
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    fn insert(&mut self, name: &str, instance: Box<dyn Plugin>) {
        self.instances.insert(name.to_string(), instance);
    }

    fn remove(&mut self, name: &str) -> Option<Box<dyn Plugin>> {
        self.instances.remove(name)
    }
}

impl fmt::Debug for PluginInstances {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.order.iter().filter(|name| self.contains(name)))
            .finish()
    }
}

/// Puts descriptors in execution order: core first, bindings last.
///
/// The built-in core plugin is added when no core descriptor is given, and
/// only the first core descriptor is kept. Order within each role is
/// preserved.
pub fn order_descriptors(
    descriptors: Vec<Arc<dyn PluginDescriptor>>,
) -> Vec<Arc<dyn PluginDescriptor>> {
    let mut core = None;
    let mut regular = Vec::new();
    let mut bindings = Vec::new();
    for descriptor in descriptors {
        match descriptor.role() {
            PluginRole::Core if core.is_none() => core = Some(descriptor),
            PluginRole::Core => {
                tracing::warn!(plugin = %descriptor.name(), "Ignoring duplicate core plugin")
            }
            PluginRole::Regular => regular.push(descriptor),
            PluginRole::Bindings => bindings.push(descriptor),
        }
    }

    let mut ordered = Vec::with_capacity(regular.len() + bindings.len() + 1);
    ordered.push(core.unwrap_or_else(descriptor::<CorePlugin>));
    ordered.extend(regular);
    ordered.extend(bindings);
    ordered
}

pub(crate) struct Orchestrator {
    descriptors: Vec<Arc<dyn PluginDescriptor>>,
    ctx: HostContext,
    /// Flat options as last set through the API
    options: Options,
    /// `options` split per plugin
    overrides: PerPluginOptions,
    /// Merged options of the last completed pass
    previous_options: Option<PerPluginOptions>,
    plugins: PluginInstances,
    compat: Compatibility,
    root_path: Option<PathBuf>,
    config_path: Option<PathBuf>,
    /// Latched on the first pass
    watching: Option<bool>,
    before_setup_watch: HashMap<String, HashSet<PathBuf>>,
    setup_watch: HashMap<String, HashSet<PathBuf>>,
    setup_results: HashMap<String, SetupResult>,
    storages: HashMap<String, PluginStorageFactory>,
    scope: Option<Arc<GlobalScope>>,
    watcher: Option<Box<dyn Watcher>>,
    watch_callback: Option<WatchCallback>,
    previous_watch_paths: HashSet<PathBuf>,
    reload_tx: broadcast::Sender<ReloadEvent>,
    reloaded: bool,
    disposed: bool,
}

impl Orchestrator {
    pub(crate) fn new(
        descriptors: Vec<Arc<dyn PluginDescriptor>>,
        ctx: HostContext,
        options: Options,
        watch_callback: Option<WatchCallback>,
        reload_tx: broadcast::Sender<ReloadEvent>,
    ) -> Self {
        let descriptors = order_descriptors(descriptors);
        let overrides = split_options(&descriptors, &options);
        let order = descriptors.iter().map(|d| d.name().to_string()).collect();
        Self {
            descriptors,
            ctx,
            options,
            overrides,
            previous_options: None,
            plugins: PluginInstances::new(order),
            compat: Compatibility::default(),
            root_path: None,
            config_path: None,
            watching: None,
            before_setup_watch: HashMap::new(),
            setup_watch: HashMap::new(),
            setup_results: HashMap::new(),
            storages: HashMap::new(),
            scope: None,
            watcher: None,
            watch_callback,
            previous_watch_paths: HashSet::new(),
            reload_tx,
            reloaded: false,
            disposed: false,
        }
    }

    pub(crate) fn plugins(&self) -> &PluginInstances {
        &self.plugins
    }

    pub(crate) fn plugins_mut(&mut self) -> &mut PluginInstances {
        &mut self.plugins
    }

    pub(crate) fn global_scope(&self) -> Option<Arc<GlobalScope>> {
        self.scope.clone()
    }

    pub(crate) fn compat(&self) -> &Compatibility {
        &self.compat
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub(crate) fn is_watching(&self) -> bool {
        self.watching.unwrap_or(false)
    }

    /// Paths currently registered with the watcher
    pub(crate) fn watch_paths(&self) -> &HashSet<PathBuf> {
        &self.previous_watch_paths
    }

    /// Merges `options` over the previously set options
    pub(crate) fn set_options(&mut self, options: Options) {
        self.options = merge_options(&self.options, options);
        self.overrides = split_options(&self.descriptors, &self.options);
    }

    fn core_name(&self) -> String {
        self.descriptors
            .first()
            .map(|d| d.name().to_string())
            .unwrap_or_else(|| CorePlugin::NAME.to_string())
    }

    fn core(&self) -> Option<&CorePlugin> {
        let name = self.descriptors.first()?.name();
        self.plugins.get(name)?.downcast_ref::<CorePlugin>()
    }

    fn names(&self) -> Vec<String> {
        self.plugins.names().to_vec()
    }

    fn plugin_storage(&mut self, name: &str) -> PluginStorageFactory {
        self.storages
            .entry(name.to_string())
            .or_insert_with(|| PluginStorageFactory::new(self.ctx.storage.clone(), name))
            .clone()
    }

    fn plugin_context(&self, root_path: &Path) -> PluginContext {
        PluginContext {
            compat: self.compat.clone(),
            root_path: root_path.to_path_buf(),
            fetcher: self.ctx.fetcher.clone(),
            services: self.ctx.services.clone(),
        }
    }

    /// Resolves options, recreates changed plugins and reruns their hooks.
    ///
    /// Always recomputes from scratch; plugins whose merged options are
    /// unchanged are left alone unless compatibility or the root path moved.
    pub(crate) async fn init(&mut self) -> Result<(), HostError> {
        if self.disposed {
            return Err(HostError::Disposed);
        }
        let initial = self.previous_options.is_none();
        if initial {
            tracing::debug!("Initialising worker...");
        } else {
            tracing::debug!("Reloading worker...");
        }

        let core_name = self.core_name();
        let empty = PluginOptions::new();
        let core_overrides = self.overrides.get(&core_name).unwrap_or(&empty);
        let root_path = CoreOptions::root_path_from(core_overrides, &self.ctx.cwd);
        let config_location = CoreOptions::config_path_from(core_overrides, &root_path);
        let config_env = core_overrides
            .get("config_env")
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut config = DeclarativeConfig::default();
        let mut config_dir = root_path.clone();
        self.config_path = None;
        if let Some((path, implicit)) = config_location {
            match load_declarative_config(&path, config_env.as_deref()).await {
                Ok(loaded) => config = loaded,
                Err(e) if implicit && e.is_not_found() => {
                    tracing::trace!(path = %path.display(), "No config file");
                }
                Err(e) => return Err(e.into()),
            }
            if let Some(dir) = path.parent() {
                config_dir = dir.to_path_buf();
            }
            self.config_path = Some(path);
        }
        let options =
            merge_declarative_config(&self.descriptors, &self.overrides, &config, &config_dir);
        let core_options = options.get(&core_name).unwrap_or(&empty);

        if self.watching.is_none() {
            let watching = core_options
                .get("watch")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            self.watching = Some(watching);
        }
        let watching = self.is_watching();

        let date = core_options
            .get("compatibility_date")
            .and_then(Value::as_str)
            .map(str::to_string);
        let flags: Option<Vec<String>> = core_options
            .get("compatibility_flags")
            .and_then(|flags| serde_json::from_value(flags.clone()).ok());
        let compat_changed = self.compat.update(date.as_deref(), flags.as_deref())?;
        tracing::debug!(
            date = %self.compat.date(),
            flags = ?self.compat.enabled().collect::<Vec<_>>(),
            "Enabled compatibility flags"
        );
        let root_changed = self.root_path.as_ref().is_some_and(|prev| *prev != root_path);
        let ctx_changed = compat_changed || root_changed;
        self.root_path = Some(root_path.clone());
        let plugin_ctx = self.plugin_context(&root_path);

        // Recreate changed plugins and run their before_setup hooks
        let mut changed = HashSet::new();
        let mut ran_before_setup = false;
        for descriptor in self.descriptors.clone() {
            let name = descriptor.name().to_string();
            let plugin_options = options.get(&name).cloned().unwrap_or_default();
            let unchanged = !ctx_changed
                && self.plugins.contains(&name)
                && self
                    .previous_options
                    .as_ref()
                    .and_then(|previous| previous.get(&name))
                    == Some(&plugin_options);
            if unchanged {
                continue;
            }
            changed.insert(name.clone());

            // A failed rebuild must not look unchanged on the next pass
            if let Some(previous) = self.previous_options.as_mut() {
                previous.remove(&name);
            }
            if let Some(mut old) = self.plugins.remove(&name) {
                tracing::trace!("- dispose({})", name);
                old.dispose()
                    .await
                    .map_err(|e| HostError::plugin(&name, "dispose", e))?;
            }
            self.before_setup_watch.remove(&name);
            self.setup_watch.remove(&name);
            self.setup_results.remove(&name);

            let instance = descriptor
                .instantiate(&plugin_ctx, &plugin_options)
                .map_err(|e| HostError::plugin(&name, "new", e))?;
            self.plugins.insert(&name, instance);
            if self.run_before_setup(&name, watching).await? {
                ran_before_setup = true;
            }
        }

        // Then setup, once every before_setup has finished
        for name in self.names() {
            let had_script = self
                .setup_results
                .get(&name)
                .is_some_and(|result| result.script.is_some());
            if !changed.contains(&name) && !(ran_before_setup && had_script) {
                continue;
            }
            self.run_setup(&name, watching).await?;
        }

        self.previous_options = Some(options);

        if self.ctx.script_required
            && !self
                .setup_results
                .values()
                .any(|result| result.script.is_some())
        {
            return Err(HostError::NoScript);
        }
        Ok(())
    }

    /// Returns whether the hook ran
    async fn run_before_setup(&mut self, name: &str, watching: bool) -> Result<bool, HostError> {
        let Some(instance) = self.plugins.get_mut(name) else {
            return Ok(false);
        };
        if !instance.has_before_setup() {
            return Ok(false);
        }
        tracing::trace!("- beforeSetup({})", name);
        let result = instance
            .before_setup()
            .await
            .map_err(|e| HostError::plugin(name, "beforeSetup", e))?;
        match result.watch {
            Some(paths) if watching => {
                self.before_setup_watch
                    .insert(name.to_string(), paths.into_iter().collect());
            }
            _ => {
                self.before_setup_watch.remove(name);
            }
        }
        Ok(true)
    }

    async fn run_setup(&mut self, name: &str, watching: bool) -> Result<(), HostError> {
        let storage = self.plugin_storage(name);
        let Some(instance) = self.plugins.get_mut(name) else {
            return Ok(());
        };
        if !instance.has_setup() {
            self.setup_results.remove(name);
            self.setup_watch.remove(name);
            return Ok(());
        }
        tracing::trace!("- setup({})", name);
        let result = instance
            .setup(&storage)
            .await
            .map_err(|e| HostError::plugin(name, "setup", e))?;
        match &result.watch {
            Some(paths) if watching => {
                self.setup_watch
                    .insert(name.to_string(), paths.iter().cloned().collect());
            }
            _ => {
                self.setup_watch.remove(name);
            }
        }
        self.setup_results.insert(name.to_string(), result);
        Ok(())
    }

    /// Builds a fresh global scope from the cached setup results and runs
    /// the worker script in it.
    ///
    /// `before_reload` hooks run only once the script has run, so a failed
    /// reload leaves the previous scope and its plugin state untouched.
    pub(crate) async fn reload(&mut self) -> Result<(), HostError> {
        if self.disposed {
            return Err(HostError::Disposed);
        }
        let names = self.names();
        let mut globals = Context::new();
        let mut bindings = Context::new();
        let mut watch: HashSet<PathBuf> = self.config_path.iter().cloned().collect();
        let mut script: Option<(String, ScriptBlueprint)> = None;

        for name in &names {
            if let Some(result) = self.setup_results.get(name) {
                globals.extend(result.globals.iter().flatten().map(|(k, v)| (k.clone(), v.clone())));
                bindings.extend(result.bindings.iter().flatten().map(|(k, v)| (k.clone(), v.clone())));
                if let Some(blueprint) = &result.script {
                    if let Some((first, _)) = &script {
                        return Err(HostError::MultipleScripts {
                            first: first.clone(),
                            second: name.clone(),
                        });
                    }
                    script = Some((name.clone(), blueprint.clone()));
                }
            }
            watch.extend(self.before_setup_watch.get(name).into_iter().flatten().cloned());
            watch.extend(self.setup_watch.get(name).into_iter().flatten().cloned());
        }

        let (modules, upstream, module_rules, log_rejections) = match self.core() {
            Some(core) => (
                core.is_modules(),
                core.upstream_url().cloned(),
                core.processed_module_rules().to_vec(),
                core.log_unhandled_rejections(),
            ),
            None => (false, None, Vec::new(), false),
        };
        let scope = Arc::new(
            GlobalScope::new(
                globals,
                Arc::new(bindings),
                modules,
                self.ctx.fetcher.clone(),
                self.ctx.rejections.clone(),
            )
            .with_upstream(upstream),
        );
        if log_rejections {
            scope.add_unhandled_rejection_listener(Arc::new(|error: &anyhow::Error| {
                tracing::error!(error = %format!("{error:#}"), "Unhandled rejection");
            }));
        }

        let mut exports = ModuleExports::default();
        let mut bundle_size = None;
        if let (Some((_, blueprint)), Some(runner)) = (&script, &self.ctx.script_runner) {
            let rules = modules.then_some(module_rules.as_slice());
            match runner.run(&scope, blueprint, rules).await {
                Ok(result) => {
                    if self.is_watching() {
                        watch.extend(result.watch);
                    }
                    bundle_size = result.bundle_size;
                    if let Some(result_exports) = result.exports {
                        exports = result_exports;
                    }
                }
                Err(e) => {
                    scope.dispose();
                    return Err(HostError::Runner(e));
                }
            }
        }
        // The new scope is ready; only now may plugins drop state the
        // previous scope still relies on
        for name in &names {
            if let Some(instance) = self.plugins.get_mut(name) {
                tracing::trace!("- beforeReload({})", name);
                if let Err(e) = instance.before_reload().await {
                    scope.dispose();
                    return Err(HostError::plugin(name, "beforeReload", e));
                }
            }
        }

        if modules {
            if let Some(handler) = &exports.default {
                if let Some(fetch) = handler.fetch.clone() {
                    scope.add_module_fetch_listener(fetch);
                }
                if let Some(scheduled) = handler.scheduled.clone() {
                    scope.add_module_scheduled_listener(scheduled);
                }
            }
        }

        // In-flight dispatches may still hold the previous scope
        if let Some(previous) = self.scope.replace(scope.clone()) {
            previous.release();
        }

        for name in &names {
            if let Some(instance) = self.plugins.get_mut(name) {
                tracing::trace!("- reload({})", name);
                instance
                    .reload(scope.bindings(), &exports)
                    .await
                    .map_err(|e| HostError::plugin(name, "reload", e))?;
            }
        }

        let initial = !self.reloaded;
        self.reloaded = true;
        // No subscribers is fine
        let _ = self.reload_tx.send(ReloadEvent {
            initial,
            plugins: names,
        });

        match bundle_size {
            Some(size) => {
                tracing::info!(size = %format_size(size), "Worker reloaded!");
                if size > BUNDLE_SIZE_WARNING {
                    tracing::warn!(
                        size = %format_size(size),
                        "Worker's uncompressed size exceeds the 1MiB limit! Note that your worker will be compressed during upload so you may still be able to deploy it."
                    );
                }
            }
            None => tracing::info!("Worker reloaded!"),
        }

        if self.is_watching() {
            self.update_watch(watch).await?;
        }
        Ok(())
    }

    async fn update_watch(&mut self, next: HashSet<PathBuf>) -> Result<(), HostError> {
        if self.watcher.is_none() {
            let (Some(factory), Some(callback)) = (&self.ctx.watcher_factory, &self.watch_callback)
            else {
                return Ok(());
            };
            self.watcher = Some(factory(callback.clone())?);
        }
        let Some(watcher) = self.watcher.as_mut() else {
            return Ok(());
        };

        let delta = diff_watch_paths(&self.previous_watch_paths, &next);
        if !delta.removed.is_empty() {
            tracing::debug!(paths = ?delta.removed, "Unwatching");
            watcher.unwatch(&delta.removed);
        }
        if !delta.added.is_empty() {
            tracing::debug!(paths = ?delta.added, "Watching");
            watcher.watch(&delta.added).await?;
        }
        self.previous_watch_paths = next;
        Ok(())
    }

    /// Reruns the hooks that declared `path`, without reloading.
    ///
    /// A change to the config file reinitialises everything first. Whenever
    /// a `before_setup` reruns, plugins whose last setup produced the script
    /// rerun `setup` too, since the script may have been rebuilt.
    pub(crate) async fn rerun_for_path(&mut self, path: &Path) -> Result<(), HostError> {
        if self.disposed {
            return Err(HostError::Disposed);
        }
        tracing::debug!(path = %path.display(), "File changed");
        if self.config_path.as_deref() == Some(path) {
            self.init().await?;
        }

        let watching = self.is_watching();
        let names = self.names();
        let mut ran_before_setup = false;
        for name in &names {
            if self
                .before_setup_watch
                .get(name)
                .is_some_and(|paths| paths.contains(path))
                && self.run_before_setup(name, watching).await?
            {
                ran_before_setup = true;
            }
            if self
                .setup_watch
                .get(name)
                .is_some_and(|paths| paths.contains(path))
            {
                self.run_setup(name, watching).await?;
            }
        }

        if ran_before_setup {
            for name in &names {
                let has_script = self
                    .setup_results
                    .get(name)
                    .is_some_and(|result| result.script.is_some());
                if has_script {
                    self.run_setup(name, watching).await?;
                }
            }
        }
        Ok(())
    }

    /// Disposes every plugin, the watcher and the scope.
    ///
    /// Every plugin gets its `dispose` call even if an earlier one fails; the
    /// first failure is returned.
    pub(crate) async fn dispose(&mut self) -> Result<(), HostError> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;

        let mut first_error = None;
        for name in self.names() {
            if let Some(mut instance) = self.plugins.remove(&name) {
                tracing::trace!("- dispose({})", name);
                if let Err(e) = instance.dispose().await {
                    let error = HostError::plugin(&name, "dispose", e);
                    tracing::warn!(error = %error, "Plugin dispose failed");
                    first_error.get_or_insert(error);
                }
            }
        }
        if let Some(mut watcher) = self.watcher.take() {
            watcher.dispose();
        }
        if let Some(scope) = self.scope.take() {
            scope.dispose();
        }
        self.previous_watch_paths.clear();
        self.setup_results.clear();

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Human-readable byte count, e.g. `1.50KiB`
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes}B");
    }
    let mut size = bytes as f64 / 1024.0;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{size:.2}{}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::{BindingsPlugin, BuildPlugin};

    struct Named(&'static str, PluginRole);

    impl PluginDescriptor for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn role(&self) -> PluginRole {
            self.1
        }

        fn option_schema(&self) -> Vec<nimbus_plugin_api::OptionMeta> {
            Vec::new()
        }

        fn instantiate(
            &self,
            _ctx: &PluginContext,
            _options: &PluginOptions,
        ) -> Result<Box<dyn Plugin>, nimbus_plugin_api::PluginError> {
            Err(nimbus_plugin_api::PluginError::config("not instantiable"))
        }
    }

    fn names(descriptors: &[Arc<dyn PluginDescriptor>]) -> Vec<&str> {
        descriptors.iter().map(|d| d.name()).collect()
    }

    #[test]
    fn test_order_descriptors() {
        let ordered = order_descriptors(vec![
            Arc::new(Named("b", PluginRole::Regular)),
            descriptor::<BindingsPlugin>(),
            Arc::new(Named("a", PluginRole::Regular)),
            descriptor::<CorePlugin>(),
        ]);
        assert_eq!(names(&ordered), vec!["core", "b", "a", "bindings"]);
    }

    #[test]
    fn test_order_descriptors_injects_and_dedupes_core() {
        let ordered = order_descriptors(vec![descriptor::<BuildPlugin>()]);
        assert_eq!(names(&ordered), vec!["core", "build"]);

        let ordered = order_descriptors(vec![
            descriptor::<CorePlugin>(),
            Arc::new(Named("other-core", PluginRole::Core)),
        ]);
        assert_eq!(names(&ordered), vec!["core"]);
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512B");
        assert_eq!(format_size(1536), "1.50KiB");
        assert_eq!(format_size(BUNDLE_SIZE_WARNING), "1.00MiB");
    }
}
