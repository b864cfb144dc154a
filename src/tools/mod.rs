//! Built-in tools the `serve` command can expose.
//!
//! | Tool     | Arguments                          | Returns                   |
//! |----------|------------------------------------|---------------------------|
//! | `echo`   | `text: string`                     | the text                  |
//! | `divide` | `dividend: number, divisor: number`| `{"quotient": number}`    |
//! | `sleep`  | `millis: number` (default 100)     | confirmation text         |

use std::time::Duration;

use serde_json::{json, Value};

use crate::mcp::error::{RegistryError, ToolError};
use crate::mcp::registry::{Arguments, ParamSpec, ParamType, Payload, ToolDescriptor, ToolRegistry};

/// Names of every built-in tool, in the order they are registered.
pub const BUILTIN_TOOLS: &[&str] = &["echo", "divide", "sleep"];

/// Longest sleep the `sleep` tool accepts.
const MAX_SLEEP_MS: u64 = 60_000;

/// Whether `name` is a built-in tool.
#[must_use]
pub fn is_builtin(name: &str) -> bool {
    BUILTIN_TOOLS.contains(&name)
}

/// Builds a registry holding the named built-ins, or all of them when
/// `names` is empty.
///
/// # Errors
///
/// Returns [`RegistryError::UnknownBuiltin`] for a name that is not a
/// built-in, or [`RegistryError::DuplicateName`] if a name is listed twice.
pub fn builtin_registry<S: AsRef<str>>(names: &[S]) -> Result<ToolRegistry, RegistryError> {
    let selected: Vec<&str> = if names.is_empty() {
        BUILTIN_TOOLS.to_vec()
    } else {
        names.iter().map(AsRef::as_ref).collect()
    };

    let mut registry = ToolRegistry::new();
    for name in selected {
        match name {
            "echo" => registry.register(echo_descriptor(), echo)?,
            "divide" => registry.register(divide_descriptor(), divide)?,
            "sleep" => registry.register(sleep_descriptor(), sleep)?,
            other => return Err(RegistryError::UnknownBuiltin(other.to_string())),
        }
    }
    Ok(registry)
}

fn echo_descriptor() -> ToolDescriptor {
    ToolDescriptor::new("echo", "Return the given text unchanged").param(
        ParamSpec::required("text", ParamType::String).describe("Text to echo back"),
    )
}

fn echo(args: &Arguments) -> Result<Payload, ToolError> {
    let text = args
        .get("text")
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidInput("'text' must be a string".to_string()))?;
    Ok(Payload::from(text))
}

fn divide_descriptor() -> ToolDescriptor {
    ToolDescriptor::new("divide", "Divide one number by another")
        .param(ParamSpec::required("dividend", ParamType::Number))
        .param(ParamSpec::required("divisor", ParamType::Number))
}

#[allow(clippy::float_cmp)]
fn divide(args: &Arguments) -> Result<Payload, ToolError> {
    let number = |key: &str| {
        args.get(key)
            .and_then(Value::as_f64)
            .ok_or_else(|| ToolError::InvalidInput(format!("'{key}' must be a number")))
    };
    let dividend = number("dividend")?;
    let divisor = number("divisor")?;

    if divisor == 0.0 {
        return Err(ToolError::Failed("division by zero".to_string()));
    }
    Ok(Payload::Structured(json!({ "quotient": dividend / divisor })))
}

fn sleep_descriptor() -> ToolDescriptor {
    ToolDescriptor::new("sleep", "Wait before answering").param(
        ParamSpec::optional("millis", ParamType::Number)
            .with_default(json!(100))
            .describe("How long to wait, in milliseconds"),
    )
}

fn sleep(args: &Arguments) -> Result<Payload, ToolError> {
    let millis = args
        .get("millis")
        .and_then(Value::as_u64)
        .ok_or_else(|| {
            ToolError::InvalidInput("'millis' must be a non-negative integer".to_string())
        })?;
    if millis > MAX_SLEEP_MS {
        return Err(ToolError::InvalidInput(format!(
            "'millis' must be at most {MAX_SLEEP_MS}"
        )));
    }

    std::thread::sleep(Duration::from_millis(millis));
    Ok(Payload::Text(format!("slept {millis} ms")))
}
