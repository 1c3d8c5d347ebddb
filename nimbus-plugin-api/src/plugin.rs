//! The plugin contract
//!
//! A plugin is described once by a [`PluginDescriptor`] (name, option schema,
//! constructor) and instantiated again whenever its resolved options change.
//! Instances take part in a two-phase lifecycle: every `before_setup` runs
//! before any `setup`, then `before_reload`/`reload` run around each rebuild
//! of the worker's global scope.

use crate::compat::Compatibility;
use crate::error::PluginError;
use crate::events::ModuleExports;
use crate::http::{Fetcher, ServiceRegistry};
use crate::options::{OptionMeta, OptionSchema, PluginOptions};
use crate::storage::PluginStorageFactory;
use crate::values::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;

/// Upcast helper so plugin instances can be downcast to their concrete type
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// One loadable unit of user script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptBlueprint {
    pub path: PathBuf,
    pub code: String,
}

impl ScriptBlueprint {
    pub fn new(path: impl Into<PathBuf>, code: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            code: code.into(),
        }
    }
}

/// Output of `before_setup`
#[derive(Debug, Clone, Default)]
pub struct BeforeSetupResult {
    /// Files that, when changed, should rerun `before_setup`
    pub watch: Option<Vec<PathBuf>>,
}

/// Output of `setup`
#[derive(Debug, Clone, Default)]
pub struct SetupResult {
    pub globals: Option<Context>,
    pub bindings: Option<Context>,
    pub script: Option<ScriptBlueprint>,
    /// Files that, when changed, should rerun `setup`
    pub watch: Option<Vec<PathBuf>>,
}

/// Where a plugin sits in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PluginRole {
    /// Always ordered first
    Core,
    #[default]
    Regular,
    /// Always ordered last, so user bindings override everything before
    Bindings,
}

/// Shared state every plugin is constructed with
#[derive(Clone)]
pub struct PluginContext {
    pub compat: Compatibility,
    /// Directory relative paths are resolved against
    pub root_path: PathBuf,
    /// Outbound fetcher for subrequests
    pub fetcher: Arc<dyn Fetcher>,
    pub services: ServiceRegistry,
}

/// A stateful plugin instance.
///
/// Every hook is optional. `before_setup` and `setup` only run when the
/// matching `has_*` method returns true; the host uses this to decide whether
/// a plugin actually rebuilt anything.
#[async_trait]
pub trait Plugin: AsAny + Send + Sync {
    fn has_before_setup(&self) -> bool {
        false
    }

    /// Side-effecting build step, e.g. running a build command
    async fn before_setup(&mut self) -> Result<BeforeSetupResult, PluginError> {
        Ok(BeforeSetupResult::default())
    }

    fn has_setup(&self) -> bool {
        false
    }

    /// Produces globals, bindings, a script and watch paths
    async fn setup(&mut self, _storage: &PluginStorageFactory) -> Result<SetupResult, PluginError> {
        Ok(SetupResult::default())
    }

    /// Runs before a new global scope is built
    async fn before_reload(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    /// Runs after the script has run, with the final bindings and exports
    async fn reload(
        &mut self,
        _bindings: &Context,
        _exports: &ModuleExports,
    ) -> Result<(), PluginError> {
        Ok(())
    }

    /// Teardown. Must be safe even if no other hook ran.
    async fn dispose(&mut self) -> Result<(), PluginError> {
        Ok(())
    }
}

impl dyn Plugin {
    pub fn downcast_ref<P: Plugin>(&self) -> Option<&P> {
        self.as_any().downcast_ref::<P>()
    }
}

/// Describes a plugin type: identity, option schema and constructor
pub trait PluginDescriptor: Send + Sync {
    fn name(&self) -> &str;

    fn role(&self) -> PluginRole {
        PluginRole::Regular
    }

    fn option_schema(&self) -> Vec<OptionMeta>;

    fn instantiate(
        &self,
        ctx: &PluginContext,
        options: &PluginOptions,
    ) -> Result<Box<dyn Plugin>, PluginError>;
}

/// A plugin constructed from a typed, schema-carrying options struct
pub trait ConfigurablePlugin: Plugin + Sized {
    const NAME: &'static str;
    const ROLE: PluginRole = PluginRole::Regular;

    type Options: OptionSchema + DeserializeOwned;

    fn new(ctx: &PluginContext, options: Self::Options) -> Result<Self, PluginError>;
}

/// [`PluginDescriptor`] for any [`ConfigurablePlugin`]
pub struct PluginType<P>(PhantomData<fn() -> P>);

impl<P> PluginType<P> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<P> Default for PluginType<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: ConfigurablePlugin> PluginDescriptor for PluginType<P> {
    fn name(&self) -> &str {
        P::NAME
    }

    fn role(&self) -> PluginRole {
        P::ROLE
    }

    fn option_schema(&self) -> Vec<OptionMeta> {
        <P::Options as OptionSchema>::option_schema()
    }

    fn instantiate(
        &self,
        ctx: &PluginContext,
        options: &PluginOptions,
    ) -> Result<Box<dyn Plugin>, PluginError> {
        let options: P::Options = serde_json::from_value(serde_json::Value::Object(options.clone()))
            .map_err(|source| PluginError::InvalidOptions {
                plugin: P::NAME.to_string(),
                source,
            })?;
        Ok(Box::new(P::new(ctx, options)?))
    }
}

/// Shorthand for `Arc::new(PluginType::<P>::new())`
pub fn descriptor<P: ConfigurablePlugin>() -> Arc<dyn PluginDescriptor> {
    Arc::new(PluginType::<P>::new())
}
