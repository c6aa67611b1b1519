/// Built-in demo hubs so plans can be exercised without wiring a real
/// action backend.
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use maestro_core::{Action, Hub, Registry, DEPS_PARAM_KEY};

/// Registry with the `text` and `util` demo hubs registered.
pub fn demo_registry() -> Arc<Registry> {
    let registry = Arc::new(Registry::new("demo", "built-in demo actions"));
    registry.register(text_hub());
    registry.register(util_hub());
    registry
}

fn text_hub() -> Hub {
    Hub::new("text", "text transforms")
        .with_action(Action::from_fn(
            "echo",
            "Return the call's parameters unchanged",
            |params| async { Ok(params) },
        ))
        .with_action(Action::from_fn(
            "uppercase",
            "Uppercase the `text` parameter, or the text of the first dependency",
            |params| async move {
                let text = params
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
                    .or_else(|| first_dep_text(&params))
                    .ok_or_else(|| anyhow::anyhow!("no `text` parameter or dependency text"))?;
                Ok(json!({ "text": text.to_uppercase() }))
            },
        ))
        .with_action(Action::from_fn(
            "concat",
            "Join the `text` of every dependency with the `separator` parameter",
            |params| async move {
                let sep = params
                    .get("separator")
                    .and_then(Value::as_str)
                    .unwrap_or(" ");
                let mut parts: Vec<String> = Vec::new();
                if let Some(deps) = params.get(DEPS_PARAM_KEY).and_then(Value::as_object) {
                    for value in deps.values() {
                        if let Some(text) = value.get("text").and_then(Value::as_str) {
                            parts.push(text.to_string());
                        }
                    }
                }
                Ok(json!({ "text": parts.join(sep) }))
            },
        ))
}

fn util_hub() -> Hub {
    // Per-process counter shared by every `flaky` invocation.
    let flaky_calls = Arc::new(AtomicU32::new(0));
    Hub::new("util", "timing and failure-injection helpers")
        .with_action(Action::from_fn(
            "sleep",
            "Sleep for `ms` milliseconds (default 100)",
            |params| async move {
                let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(100);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!({ "slept_ms": ms }))
            },
        ))
        .with_action(Action::from_fn(
            "fail",
            "Always fail with the `message` parameter",
            |params| async move {
                let message = params
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("induced failure");
                anyhow::bail!("{message}")
            },
        ))
        .with_action(Action::from_fn(
            "flaky",
            "Fail the first `fail_times` invocations (default 1), then succeed",
            move |params| {
                let calls = flaky_calls.clone();
                async move {
                    let fail_times =
                        params.get("fail_times").and_then(Value::as_u64).unwrap_or(1) as u32;
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < fail_times {
                        anyhow::bail!("flaky failure {n}")
                    }
                    Ok(json!({ "succeeded_on_call": n + 1 }))
                }
            },
        ))
}

fn first_dep_text(params: &Value) -> Option<String> {
    params
        .get(DEPS_PARAM_KEY)?
        .as_object()?
        .values()
        .find_map(|v| v.get("text").and_then(Value::as_str))
        .map(str::to_owned)
}
