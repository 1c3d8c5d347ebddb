//! Script runner contract and module resolution rules
//!
//! The host never executes user code itself. A [`ScriptRunner`] receives the
//! freshly built global scope and the worker's blueprint, and reports back
//! the module exports plus any files it pulled in.

use crate::scope::GlobalScope;
use async_trait::async_trait;
use nimbus_plugin_api::{ModuleExports, ScriptBlueprint};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// How a matched module is loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum ModuleRuleType {
    ESModule,
    CommonJS,
    Text,
    Data,
    CompiledWasm,
}

/// A user-supplied module rule
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModuleRule {
    #[serde(rename = "type")]
    pub rule_type: ModuleRuleType,
    #[serde(alias = "globs")]
    pub include: Vec<String>,
    /// Lets later rules of the same type still apply
    #[serde(default)]
    pub fallthrough: bool,
}

impl ModuleRule {
    pub fn new(rule_type: ModuleRuleType, include: &[&str]) -> Self {
        Self {
            rule_type,
            include: include.iter().map(|glob| glob.to_string()).collect(),
            fallthrough: false,
        }
    }
}

/// Rules always appended after the user's own
pub fn default_module_rules() -> Vec<ModuleRule> {
    vec![
        ModuleRule::new(ModuleRuleType::ESModule, &["**/*.mjs"]),
        ModuleRule::new(ModuleRuleType::CommonJS, &["**/*.js", "**/*.cjs"]),
    ]
}

/// A module rule with its globs compiled
#[derive(Debug, Clone)]
pub struct ProcessedModuleRule {
    pub rule_type: ModuleRuleType,
    pub include: GlobSet,
}

impl ProcessedModuleRule {
    pub fn matches(&self, path: &Path) -> bool {
        let path = path.to_string_lossy().replace('\\', "/");
        self.include.is_match(path.as_str())
    }
}

/// Compiles user rules followed by the defaults.
///
/// The first rule of a type without `fallthrough` finalises that type; later
/// rules of the same type are dropped.
pub fn process_module_rules(
    rules: &[ModuleRule],
) -> Result<Vec<ProcessedModuleRule>, globset::Error> {
    let mut finalised = Vec::new();
    let mut processed = Vec::new();
    for rule in rules.iter().cloned().chain(default_module_rules()) {
        if finalised.contains(&rule.rule_type) {
            continue;
        }
        processed.push(ProcessedModuleRule {
            rule_type: rule.rule_type,
            include: compile_globs(&rule.include)?,
        });
        if !rule.fallthrough {
            finalised.push(rule.rule_type);
        }
    }
    Ok(processed)
}

/// First rule matching `path`
pub fn match_module_rule<'a>(
    rules: &'a [ProcessedModuleRule],
    path: &Path,
) -> Option<&'a ProcessedModuleRule> {
    rules.iter().find(|rule| rule.matches(path))
}

/// Compiles globs into one set. `**/` matches any number of directories,
/// `*` and `?` never cross `/`, and `{a,b}` alternates.
pub fn compile_globs(globs: &[String]) -> Result<GlobSet, globset::Error> {
    let mut set = GlobSetBuilder::new();
    for glob in globs {
        set.add(GlobBuilder::new(glob).literal_separator(true).build()?);
    }
    set.build()
}

/// Output of a script run
#[derive(Debug, Default)]
pub struct ScriptRunnerResult {
    /// Module exports, in modules mode
    pub exports: Option<ModuleExports>,
    /// Files the script pulled in, watched alongside plugin paths
    pub watch: Vec<PathBuf>,
    /// Uncompressed bundle size in bytes
    pub bundle_size: Option<u64>,
}

/// Executes a worker script inside a global scope
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn run(
        &self,
        scope: &Arc<GlobalScope>,
        blueprint: &ScriptBlueprint,
        module_rules: Option<&[ProcessedModuleRule]>,
    ) -> anyhow::Result<ScriptRunnerResult>;
}

/// Entry point of a worker written in Rust
pub type NativeEntry = Arc<
    dyn Fn(&Arc<GlobalScope>, &ScriptBlueprint) -> anyhow::Result<Option<ModuleExports>>
        + Send
        + Sync,
>;

/// Runs a Rust function as the worker script.
///
/// The entry point is called on every reload with the new scope, where it
/// registers listeners (classic) or returns exports (modules).
#[derive(Clone)]
pub struct NativeRunner {
    entry: NativeEntry,
}

impl NativeRunner {
    pub fn new<F>(entry: F) -> Self
    where
        F: Fn(&Arc<GlobalScope>, &ScriptBlueprint) -> anyhow::Result<Option<ModuleExports>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            entry: Arc::new(entry),
        }
    }
}

impl fmt::Debug for NativeRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeRunner").finish_non_exhaustive()
    }
}

#[async_trait]
impl ScriptRunner for NativeRunner {
    async fn run(
        &self,
        scope: &Arc<GlobalScope>,
        blueprint: &ScriptBlueprint,
        _module_rules: Option<&[ProcessedModuleRule]>,
    ) -> anyhow::Result<ScriptRunnerResult> {
        let exports = (self.entry)(scope, blueprint)?;
        Ok(ScriptRunnerResult {
            exports,
            watch: Vec::new(),
            bundle_size: Some(blueprint.code.len() as u64),
        })
    }
}
