//! Resolves tool calls against a [`ToolRegistry`] and runs them.

use std::sync::Arc;

use crate::mcp::error::{ErrorKind, ToolError};
use crate::mcp::registry::{Arguments, Outcome, ToolFailure, ToolRegistry};

/// Runs tool calls for a server session.
///
/// Cloning is cheap; every clone shares the same registry.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
}

impl Dispatcher {
    /// Creates a dispatcher over a finished registry.
    #[must_use]
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    /// The registry calls are resolved against.
    #[must_use]
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Validates `arguments` and runs the named tool.
    ///
    /// The handler runs on the blocking pool. Nothing escapes this call:
    /// unknown tools, schema mismatches, handler errors and handler panics
    /// all come back as [`Outcome::Failure`].
    pub async fn dispatch(&self, name: &str, arguments: Arguments) -> Outcome {
        let Some(tool) = self.registry.get(name) else {
            tracing::warn!(tool = %name, "Unknown tool");
            return Outcome::Failure(ToolFailure::new(
                ErrorKind::UnknownTool,
                format!("Unknown tool: {name}"),
            ));
        };

        let arguments = match tool.descriptor.validate(&arguments) {
            Ok(arguments) => arguments,
            Err(message) => {
                tracing::debug!(tool = %name, %message, "Rejected tool arguments");
                return Outcome::Failure(ToolFailure::new(ErrorKind::InvalidArguments, message));
            }
        };

        let handler = Arc::clone(&tool.handler);
        let joined = tokio::task::spawn_blocking(move || handler(&arguments)).await;

        match joined {
            Ok(Ok(payload)) => Outcome::Success(payload),
            Ok(Err(ToolError::InvalidInput(message))) => {
                Outcome::Failure(ToolFailure::new(ErrorKind::InvalidArguments, message))
            }
            Ok(Err(ToolError::Failed(message))) => {
                tracing::debug!(tool = %name, %message, "Tool failed");
                Outcome::Failure(ToolFailure::new(ErrorKind::HandlerError, message))
            }
            Err(join_error) => {
                let message = if join_error.is_panic() {
                    panic_message(join_error.into_panic())
                } else {
                    "tool execution was cancelled".to_string()
                };
                tracing::error!(tool = %name, %message, "Tool panicked");
                Outcome::Failure(ToolFailure::new(ErrorKind::HandlerError, message))
            }
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "tool panicked".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::registry::{ParamSpec, ParamType, Payload, ToolDescriptor};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn args(value: Value) -> Arguments {
        value.as_object().cloned().unwrap()
    }

    fn dispatcher_with_counter() -> (Dispatcher, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let mut registry = ToolRegistry::new();
        registry
            .register(
                ToolDescriptor::new("echo", "Echo text")
                    .param(ParamSpec::required("text", ParamType::String)),
                move |args| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Payload::from(args["text"].as_str().unwrap_or_default()))
                },
            )
            .unwrap();
        registry
            .register(ToolDescriptor::new("fail", "Always fails"), |_| {
                Err(ToolError::Failed("database is locked".to_string()))
            })
            .unwrap();
        registry
            .register(ToolDescriptor::new("panic", "Panics"), |_| {
                panic!("handler exploded")
            })
            .unwrap();

        (Dispatcher::new(Arc::new(registry)), calls)
    }

    #[tokio::test]
    async fn dispatch_returns_handler_value() {
        let (dispatcher, calls) = dispatcher_with_counter();
        let outcome = dispatcher.dispatch("echo", args(json!({"text": "hi"}))).await;
        assert_eq!(outcome, Outcome::Success(Payload::Text("hi".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_argument_never_reaches_handler() {
        let (dispatcher, calls) = dispatcher_with_counter();
        let outcome = dispatcher.dispatch("echo", Arguments::new()).await;
        let Outcome::Failure(failure) = outcome else {
            panic!("expected failure");
        };
        assert_eq!(failure.kind, ErrorKind::InvalidArguments);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_tool_fails() {
        let (dispatcher, _) = dispatcher_with_counter();
        let Outcome::Failure(failure) = dispatcher.dispatch("missing_tool", Arguments::new()).await
        else {
            panic!("expected failure");
        };
        assert_eq!(failure.kind, ErrorKind::UnknownTool);
    }

    #[tokio::test]
    async fn handler_error_and_panic_become_failures() {
        let (dispatcher, _) = dispatcher_with_counter();

        let Outcome::Failure(failure) = dispatcher.dispatch("fail", Arguments::new()).await else {
            panic!("expected failure");
        };
        assert_eq!(failure.kind, ErrorKind::HandlerError);
        assert_eq!(failure.message, "database is locked");

        let Outcome::Failure(failure) = dispatcher.dispatch("panic", Arguments::new()).await else {
            panic!("expected failure");
        };
        assert_eq!(failure.kind, ErrorKind::HandlerError);
        assert!(failure.message.contains("handler exploded"));

        // The dispatcher is still usable afterwards.
        let outcome = dispatcher.dispatch("echo", args(json!({"text": "still here"}))).await;
        assert!(matches!(outcome, Outcome::Success(_)));
    }
}
