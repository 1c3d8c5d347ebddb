//! Values injected into a worker's global scope

use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Named values: globals, bindings or named module exports
pub type Context = BTreeMap<String, ScopeValue>;

/// A value exposed to the worker script.
///
/// Plain data is JSON; anything else (a KV namespace handle, a fetcher, a
/// service binding) is an opaque host object.
#[derive(Clone)]
pub enum ScopeValue {
    Json(Value),
    Object(Arc<dyn Any + Send + Sync>),
}

impl ScopeValue {
    pub fn object<T: Any + Send + Sync>(value: T) -> Self {
        Self::Object(Arc::new(value))
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Object(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_json().and_then(Value::as_str)
    }

    /// Downcasts a host object
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self {
            Self::Object(object) => object.clone().downcast::<T>().ok(),
            Self::Json(_) => None,
        }
    }
}

impl fmt::Debug for ScopeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(value) => write!(f, "{}", value),
            Self::Object(_) => f.write_str("[object]"),
        }
    }
}

impl From<Value> for ScopeValue {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<&str> for ScopeValue {
    fn from(value: &str) -> Self {
        Self::Json(Value::String(value.to_string()))
    }
}

impl From<String> for ScopeValue {
    fn from(value: String) -> Self {
        Self::Json(Value::String(value))
    }
}
