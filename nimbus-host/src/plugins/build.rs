//! The build plugin: runs a custom build command before setup

use async_trait::async_trait;
use nimbus_plugin_api::options::resolve_path;
use nimbus_plugin_api::{
    BeforeSetupResult, ConfigurablePlugin, DeclarativeConfig, Plugin, PluginContext, PluginError,
    PluginOptions,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;

#[derive(Debug, Clone, Default, Deserialize, PluginOptions)]
#[serde(default)]
pub struct BuildOptions {
    /// Shell command run before every setup
    #[option(kind = String, from_config = extract_build_command)]
    pub build_command: Option<String>,

    /// Working directory for the build command
    #[option(kind = Path, from_config = extract_build_base_path)]
    pub build_base_path: Option<PathBuf>,

    /// Paths that trigger a rebuild, `<base>/src` by default
    #[option(kind = Array, from_config = extract_build_watch_paths)]
    pub build_watch_paths: Option<Vec<PathBuf>>,
}

fn extract_build_command(config: &DeclarativeConfig, _: &Path) -> Option<Value> {
    config.build.as_ref()?.command.clone().map(Value::String)
}

fn extract_build_base_path(config: &DeclarativeConfig, config_dir: &Path) -> Option<Value> {
    let cwd = config.build.as_ref()?.cwd.as_deref()?;
    Some(Value::String(
        resolve_path(config_dir, cwd).to_string_lossy().into_owned(),
    ))
}

fn extract_build_watch_paths(config: &DeclarativeConfig, config_dir: &Path) -> Option<Value> {
    let watch_dir = config.build.as_ref()?.watch_dir.as_ref()?;
    let paths: Vec<String> = watch_dir
        .to_vec()
        .iter()
        .map(|dir| resolve_path(config_dir, dir).to_string_lossy().into_owned())
        .collect();
    Some(json!(paths))
}

pub struct BuildPlugin {
    command: Option<String>,
    base_path: PathBuf,
    watch_paths: Vec<PathBuf>,
}

impl BuildPlugin {
    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

impl ConfigurablePlugin for BuildPlugin {
    const NAME: &'static str = "build";
    type Options = BuildOptions;

    fn new(ctx: &PluginContext, options: BuildOptions) -> Result<Self, PluginError> {
        let base_path = options
            .build_base_path
            .map(|base| resolve_path(&ctx.root_path, base))
            .unwrap_or_else(|| ctx.root_path.clone());
        let watch_paths = match options.build_watch_paths {
            Some(paths) => paths
                .into_iter()
                .map(|path| resolve_path(&base_path, path))
                .collect(),
            None => vec![base_path.join("src")],
        };
        Ok(Self {
            command: options.build_command,
            base_path,
            watch_paths,
        })
    }
}

#[async_trait]
impl Plugin for BuildPlugin {
    fn has_before_setup(&self) -> bool {
        self.command.is_some()
    }

    async fn before_setup(&mut self) -> Result<BeforeSetupResult, PluginError> {
        let Some(command) = &self.command else {
            return Ok(BeforeSetupResult::default());
        };

        tracing::info!(command = %command, cwd = %self.base_path.display(), "Running build");
        let status = shell(command)
            .current_dir(&self.base_path)
            .env("NIMBUS", "1")
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| {
                PluginError::Other(anyhow::Error::new(e).context(format!(
                    "Failed to spawn build command \"{command}\""
                )))
            })?;

        if !status.success() {
            // Killed by a signal when there is no code
            return Err(PluginError::Build {
                exit_code: status.code().unwrap_or(-1),
            });
        }

        tracing::info!("Build succeeded");
        Ok(BeforeSetupResult {
            watch: Some(self.watch_paths.clone()),
        })
    }
}

fn shell(command: &str) -> tokio::process::Command {
    if cfg!(windows) {
        let mut shell = tokio::process::Command::new("cmd");
        shell.arg("/C").arg(command);
        shell
    } else {
        let mut shell = tokio::process::Command::new("sh");
        shell.arg("-c").arg(command);
        shell
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_declarative_config;
    use nimbus_plugin_api::{Compatibility, Fetcher, OptionSchema, Request, Response, ServiceRegistry};
    use std::sync::Arc;

    struct NoFetch;

    #[async_trait]
    impl Fetcher for NoFetch {
        async fn fetch(&self, _request: Request) -> anyhow::Result<Response> {
            anyhow::bail!("offline")
        }
    }

    fn plugin(root: &Path, options: BuildOptions) -> BuildPlugin {
        let ctx = PluginContext {
            compat: Compatibility::default(),
            root_path: root.to_path_buf(),
            fetcher: Arc::new(NoFetch),
            services: ServiceRegistry::new(),
        };
        BuildPlugin::new(&ctx, options).unwrap()
    }

    #[test]
    fn test_extractors_resolve_against_config_dir() {
        let config = parse_declarative_config(
            r#"
            [build]
            command = "make"
            cwd = "app"
            watch_dir = ["lib", "/abs"]
            "#,
            None,
        )
        .unwrap();
        let dir = Path::new("/project");
        let values: Vec<_> = BuildOptions::option_schema()
            .iter()
            .map(|meta| meta.extract(&config, dir))
            .collect();

        assert_eq!(values[0], Some(json!("make")));
        assert_eq!(values[1], Some(json!(dir.join("app"))));
        assert_eq!(values[2], Some(json!([dir.join("lib"), "/abs"])));
    }

    #[test]
    fn test_default_watch_path_is_src() {
        let build = plugin(
            Path::new("/project"),
            BuildOptions {
                build_command: Some("true".into()),
                ..Default::default()
            },
        );
        assert_eq!(build.watch_paths, vec![PathBuf::from("/project/src")]);
        assert!(build.has_before_setup());

        let idle = plugin(Path::new("/project"), BuildOptions::default());
        assert!(!idle.has_before_setup());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_build_runs_in_base_path_with_env() {
        let dir = tempfile::tempdir().unwrap();
        let mut build = plugin(
            dir.path(),
            BuildOptions {
                build_command: Some("echo $NIMBUS > built.txt".into()),
                build_watch_paths: Some(vec!["lib".into()]),
                ..Default::default()
            },
        );

        let result = build.before_setup().await.unwrap();
        assert_eq!(result.watch, Some(vec![dir.path().join("lib")]));
        let built = std::fs::read_to_string(dir.path().join("built.txt")).unwrap();
        assert_eq!(built.trim(), "1");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_build_failure_carries_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let mut build = plugin(
            dir.path(),
            BuildOptions {
                build_command: Some("exit 3".into()),
                ..Default::default()
            },
        );

        let error = build.before_setup().await.unwrap_err();
        assert_eq!(error.build_exit_code(), Some(3));
    }
}
