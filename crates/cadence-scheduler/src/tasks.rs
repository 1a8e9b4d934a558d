//! Tasks shipped with the `cadence` binary.

use std::process::Command;
use std::time::Duration;

use anyhow::{bail, Context};
use serde_json::{json, Map, Value};

use crate::worker::{TaskContext, TaskRegistry};

/// Maximum characters of shell output kept in a job's return value.
pub const MAX_OUTPUT_CHARS: usize = 16_000;

/// Registry used by `cadence worker`.
pub fn builtin_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register("echo", echo);
    registry.register("sleep", sleep);
    registry.register("fail", fail);
    registry.register("exit", exit);
    registry.register("shell", shell);
    registry
}

/// Returns its own invocation.
fn echo(ctx: &TaskContext) -> anyhow::Result<Value> {
    let kwargs: Map<String, Value> = ctx.kwargs.iter().cloned().collect();
    Ok(json!({
        "job_id": ctx.job_id,
        "instance_id": ctx.instance_id,
        "args": ctx.args,
        "kwargs": kwargs,
    }))
}

/// `secs` (float, default 1).
fn sleep(ctx: &TaskContext) -> anyhow::Result<Value> {
    let secs = match ctx.kwarg("secs") {
        Some(v) => v.as_f64().context("'secs' must be a number")?,
        None => 1.0,
    };
    if !secs.is_finite() || secs < 0.0 {
        bail!("'secs' must be a non-negative number, got {secs}");
    }
    std::thread::sleep(Duration::from_secs_f64(secs));
    Ok(json!(secs))
}

/// Always fails with `message`.
fn fail(ctx: &TaskContext) -> anyhow::Result<Value> {
    let message = ctx
        .kwarg("message")
        .and_then(Value::as_str)
        .unwrap_or("task failed");
    bail!("{message}")
}

/// Exits the worker process with `code` (default 3) without reporting back.
fn exit(ctx: &TaskContext) -> anyhow::Result<Value> {
    let code = ctx.kwarg("code").and_then(Value::as_i64).unwrap_or(3);
    std::process::exit(i32::try_from(code).unwrap_or(1))
}

/// Runs `command` with `sh -c`. A non-zero exit is an error.
fn shell(ctx: &TaskContext) -> anyhow::Result<Value> {
    let command = ctx
        .kwarg("command")
        .and_then(Value::as_str)
        .context("missing 'command' kwarg")?;

    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .with_context(|| format!("failed to run '{command}'"))?;

    let stdout = truncate_output(&String::from_utf8_lossy(&output.stdout), MAX_OUTPUT_CHARS);
    let stderr = truncate_output(&String::from_utf8_lossy(&output.stderr), MAX_OUTPUT_CHARS);

    if !output.status.success() {
        bail!("'{command}' failed ({}): {}", output.status, stderr.trim_end());
    }
    Ok(json!({
        "exit_code": output.status.code(),
        "stdout": stdout,
        "stderr": stderr,
    }))
}

/// Keep the head and tail of `output` when it exceeds `max_chars` characters.
pub fn truncate_output(output: &str, max_chars: usize) -> String {
    let total = output.chars().count();
    if total <= max_chars {
        return output.to_owned();
    }

    let keep = max_chars / 2;
    let byte_at = |n: usize| output.char_indices().nth(n).map_or(output.len(), |(i, _)| i);
    let head_end = byte_at(keep);
    let tail_start = byte_at(total - keep);

    format!(
        "{}\n... [{} chars omitted] ...\n{}",
        &output[..head_end],
        total - 2 * keep,
        &output[tail_start..]
    )
}
