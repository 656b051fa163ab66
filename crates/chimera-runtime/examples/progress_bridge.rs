//! Drive a headless engine through a bridge module
//!
//! Run with: cargo run -p chimera-runtime --example progress_bridge
//! Pass a TOML config path as the first argument to override the built-in one.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chimera_runtime::types::{MethodCall, MethodResponse, Value};
use chimera_runtime::{BridgeClient, BridgeConfig, BridgeModule, HandlerSet, HeadlessEngineFactory};
use serde_json::json;

const CONFIG: &str = r#"
    [module]
    name = "ProgressBridge"
    package = "com.example"

    [[futures]]
    name = "add"
    returns = "int"
    parameters = [{ name = "a", type = "int" }, { name = "b", type = "int" }]

    [[futures]]
    name = "download"
    parameters = [{ name = "chunks", type = "int" }]

    [[futures]]
    name = "fail"

    [[futures]]
    name = "unimplemented"

    [[streams]]
    name = "progress"
    payload = "float"
"#;

fn handlers() -> HandlerSet {
    HandlerSet::new()
        .on("add", |_ctx, call: MethodCall| async move {
            let a = call.arg("a").and_then(Value::as_i64).unwrap_or_default();
            let b = call.arg("b").and_then(Value::as_i64).unwrap_or_default();
            MethodResponse::success(a + b)
        })
        .on("download", |ctx, call: MethodCall| async move {
            let chunks = call.arg("chunks").and_then(Value::as_i64).unwrap_or(1).max(1);
            for chunk in 1..=chunks {
                tokio::time::sleep(Duration::from_millis(50)).await;
                if let Err(e) = ctx.emit("progress", chunk as f64 / chunks as f64).await {
                    return MethodResponse::error("EMIT_FAILED", e.to_string());
                }
            }
            MethodResponse::success(format!("downloaded {chunks} chunk(s)"))
        })
        .on("fail", |_ctx, _call| async move {
            MethodResponse::error("DISK_FULL", "No space left for the download")
        })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("chimera_runtime=info")),
        )
        .init();

    println!("=== Chimera Bridge Demo ===\n");

    let config = match std::env::args().nth(1) {
        Some(path) => BridgeConfig::load(&path).with_context(|| format!("loading {path}"))?,
        None => BridgeConfig::from_toml_str(CONFIG)?,
    };

    let factory = HeadlessEngineFactory::new(handlers()).with_entrypoint(|ctx| async move {
        // Nobody is listening yet; the host acknowledges and drops this.
        let _ = ctx.emit("progress", 0.0).await;
    });

    let module = Arc::new(BridgeModule::new(config, factory)?);
    let client = BridgeClient::new(Arc::clone(&module));
    println!("Module {} on channel {}", module.name(), module.channel_name());

    match client.call("add", vec![json!(1), json!(2)]).await {
        Ok(value) => println!("add before ready: {value}"),
        Err(e) => println!("add before ready: {} ({})", e.code(), e.message()),
    }

    module.ready().await?;
    println!("State: {}\n", module.state());

    let sum: i64 = client.call_as("add", vec![json!(20), json!(22)]).await?;
    println!("add(20, 22) = {sum}");

    let listener = client.on("progress", |payload| {
        println!("  progress: {payload}");
    })?;
    let result = client.call("download", vec![json!(4)]).await?;
    println!("download: {result}");
    listener.remove();

    for method in ["fail", "unimplemented"] {
        if let Err(e) = client.call(method, vec![]).await {
            println!("{method}: {} ({})", e.code(), e.message());
        }
    }

    let stats = module.stats().await?;
    println!(
        "\nCalls sent: {}, replies matched: {}, inbound calls: {}",
        stats.calls_sent, stats.replies_matched, stats.inbound_calls
    );

    module.destroy();
    module.closed().await;
    println!("State: {}", module.state());

    match client.call("add", vec![json!(1), json!(1)]).await {
        Ok(value) => println!("add after destroy: {value}"),
        Err(e) => println!("add after destroy: {}", e.code()),
    }

    Ok(())
}
