//! End-to-end tests through the facade builder

use nimbus::{FetchEvent, GlobalScope, NativeRunner, NimbusBuilder, Request, Response, ScriptBlueprint};
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

/// Responds with the named bindings, space separated
fn echo_bindings(keys: &'static [&'static str]) -> Arc<NativeRunner> {
    Arc::new(NativeRunner::new(
        move |scope: &Arc<GlobalScope>, _blueprint: &ScriptBlueprint| {
            let mut values = Vec::new();
            for key in keys {
                let value = scope
                    .get(key)?
                    .and_then(|value| value.as_str().map(str::to_string))
                    .unwrap_or_default();
                values.push(value);
            }
            let body = values.join(" ");
            scope.add_fetch_listener(Arc::new(move |event: &FetchEvent| -> anyhow::Result<()> {
                event.respond(Response::new(body.clone()))?;
                Ok(())
            }))?;
            Ok(None)
        },
    ))
}

#[tokio::test]
async fn test_builder_loads_vars_and_env_file() {
    let temp = TempDir::new().unwrap();
    fs::write(
        temp.path().join("nimbus.toml"),
        "name = \"demo\"\n\n[vars]\nKEY = \"from-config\"\n",
    )
    .unwrap();
    fs::write(temp.path().join(".env"), "# secrets\nSECRET=\"shh\"\n").unwrap();

    let host = NimbusBuilder::new()
        .option("script", "")
        .option("root_path", temp.path().to_string_lossy().to_string())
        .option("config_path", true)
        .option("env_path", true)
        .with_script_runner(echo_bindings(&["KEY", "SECRET"]))
        .build()
        .await
        .expect("Failed to build host");

    let response = host
        .dispatch_fetch(Request::get("http://localhost/").unwrap())
        .await
        .expect("Dispatch failed");
    assert_eq!(response.text(), "from-config shh");
    assert_eq!(
        host.plugin_names().await,
        vec!["core", "build", "bindings"]
    );
}

#[tokio::test]
async fn test_builder_without_builtins_has_no_bindings() {
    let host = NimbusBuilder::new()
        .without_builtins()
        .option("script", "")
        .option("bindings", serde_json::json!({ "KEY": "value" }))
        .with_script_runner(echo_bindings(&["KEY"]))
        .build()
        .await
        .expect("Failed to build host");

    assert_eq!(host.plugin_names().await, vec!["core"]);
    let response = host
        .dispatch_fetch(Request::get("http://localhost/").unwrap())
        .await
        .unwrap();
    assert_eq!(response.text(), "");
}

#[cfg(unix)]
#[tokio::test]
async fn test_builder_surfaces_build_failures() {
    let temp = TempDir::new().unwrap();
    let result = NimbusBuilder::new()
        .option("script", "")
        .option("root_path", temp.path().to_string_lossy().to_string())
        .option("build_command", "exit 4")
        .build()
        .await;

    let err = result.expect_err("Expected build failure");
    assert_eq!(err.build_exit_code(), Some(4));
}
