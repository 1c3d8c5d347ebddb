//! Built-in plugins

pub mod bindings;
pub mod build;
pub mod core;

pub use self::bindings::{BindingsOptions, BindingsPlugin, ServiceBinding};
pub use self::build::{BuildOptions, BuildPlugin};
pub use self::core::{CoreOptions, CorePlugin};

use nimbus_plugin_api::{descriptor, PluginDescriptor};
use std::sync::Arc;

/// Descriptors for every built-in plugin, in execution order
pub fn builtin_descriptors() -> Vec<Arc<dyn PluginDescriptor>> {
    vec![
        descriptor::<CorePlugin>(),
        descriptor::<BuildPlugin>(),
        descriptor::<BindingsPlugin>(),
    ]
}
