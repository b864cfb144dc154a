//! Tool descriptors and the registry that maps names to handlers.
//!
//! A [`ToolDescriptor`] is the typed form of a tool's interface: an ordered
//! list of parameters, each with a kind, a required flag and an optional
//! default. On the wire it is rendered as a JSON Schema object (see
//! [`ToolDescriptor::input_schema`]), which is what `tools/list` returns.
//!
//! The registry is built once at startup and shared read-only while the
//! server is running.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{json, Map, Value};

use crate::mcp::error::{DecodeError, ErrorKind, RegistryError, ToolError};
use crate::mcp::protocol::{ToolCallResult, ToolInfo};

/// Arguments of a tool call: parameter name to value.
pub type Arguments = Map<String, Value>;

/// A tool implementation.
///
/// Handlers are synchronous; the dispatcher runs each one on the blocking
/// pool so a slow tool never stalls the session.
pub type ToolHandler = Arc<dyn Fn(&Arguments) -> Result<Payload, ToolError> + Send + Sync>;

/// The closed set of value kinds a parameter may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    /// A JSON string.
    String,
    /// A JSON number (integer or float).
    Number,
    /// A JSON boolean.
    Boolean,
    /// A nested JSON object.
    Object,
}

impl ParamType {
    /// JSON Schema type name.
    #[must_use]
    pub const fn schema_name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
        }
    }

    /// Parses a JSON Schema type name. `integer` is accepted as a number.
    #[must_use]
    pub fn from_schema_name(name: &str) -> Option<Self> {
        match name {
            "string" => Some(Self::String),
            "number" | "integer" => Some(Self::Number),
            "boolean" => Some(Self::Boolean),
            "object" => Some(Self::Object),
            _ => None,
        }
    }

    /// Whether `value` is of this kind.
    #[must_use]
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.schema_name())
    }
}

/// One declared parameter of a tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    /// Parameter name.
    pub name: String,
    /// Accepted value kind.
    pub kind: ParamType,
    /// Whether the caller must supply it.
    pub required: bool,
    /// Value used when an optional parameter is omitted.
    pub default: Option<Value>,
    /// Human-readable description.
    pub description: String,
}

impl ParamSpec {
    /// A parameter the caller must supply.
    #[must_use]
    pub fn required(name: impl Into<String>, kind: ParamType) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
            default: None,
            description: String::new(),
        }
    }

    /// A parameter the caller may omit.
    #[must_use]
    pub fn optional(name: impl Into<String>, kind: ParamType) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind)
        }
    }

    /// Sets the value substituted when the parameter is omitted.
    #[must_use]
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// The declared interface of a tool. Immutable once registered.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Parameters in declaration order.
    pub params: Vec<ParamSpec>,
}

impl ToolDescriptor {
    /// Creates a descriptor with no parameters.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            params: Vec::new(),
        }
    }

    /// Appends a parameter.
    #[must_use]
    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }

    /// Renders the parameters as a JSON Schema object.
    #[must_use]
    pub fn input_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();

        for param in &self.params {
            let mut prop = Map::new();
            prop.insert("type".to_string(), json!(param.kind.schema_name()));
            if !param.description.is_empty() {
                prop.insert("description".to_string(), json!(param.description));
            }
            if let Some(default) = &param.default {
                prop.insert("default".to_string(), default.clone());
            }
            properties.insert(param.name.clone(), Value::Object(prop));

            if param.required {
                required.push(json!(param.name));
            }
        }

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Checks `arguments` against the declared parameters.
    ///
    /// Returns the arguments with defaults filled in for omitted optional
    /// parameters, or a message describing the first mismatch.
    ///
    /// # Errors
    ///
    /// Fails on an undeclared argument name, a missing required argument, or
    /// a value of the wrong kind.
    pub fn validate(&self, arguments: &Arguments) -> Result<Arguments, String> {
        if let Some(unknown) = arguments
            .keys()
            .find(|name| !self.params.iter().any(|p| &p.name == *name))
        {
            return Err(format!(
                "unknown argument '{unknown}' for tool '{}'",
                self.name
            ));
        }

        let mut normalised = Map::new();
        for param in &self.params {
            match arguments.get(&param.name) {
                Some(value) if param.kind.matches(value) => {
                    normalised.insert(param.name.clone(), value.clone());
                }
                Some(_) => {
                    return Err(format!(
                        "argument '{}' must be a {}",
                        param.name, param.kind
                    ));
                }
                None if param.required => {
                    return Err(format!("missing required argument '{}'", param.name));
                }
                None => {
                    if let Some(default) = &param.default {
                        normalised.insert(param.name.clone(), default.clone());
                    }
                }
            }
        }

        Ok(normalised)
    }
}

impl From<&ToolDescriptor> for ToolInfo {
    fn from(descriptor: &ToolDescriptor) -> Self {
        Self {
            name: descriptor.name.clone(),
            description: descriptor.description.clone(),
            input_schema: descriptor.input_schema(),
        }
    }
}

impl TryFrom<ToolInfo> for ToolDescriptor {
    type Error = DecodeError;

    fn try_from(info: ToolInfo) -> Result<Self, Self::Error> {
        let invalid =
            |what: String| DecodeError::InvalidMessage(format!("tool '{}': {what}", info.name));

        let schema = info
            .input_schema
            .as_object()
            .ok_or_else(|| invalid("inputSchema must be an object".to_string()))?;

        let required: Vec<&str> = match schema.get("required") {
            None => Vec::new(),
            Some(list) => list
                .as_array()
                .ok_or_else(|| invalid("required must be an array".to_string()))?
                .iter()
                .filter_map(Value::as_str)
                .collect(),
        };

        let mut params = Vec::new();
        if let Some(properties) = schema.get("properties") {
            let properties = properties
                .as_object()
                .ok_or_else(|| invalid("properties must be an object".to_string()))?;

            for (name, prop) in properties {
                let type_name = prop.get("type").and_then(Value::as_str).unwrap_or("");
                let kind = ParamType::from_schema_name(type_name).ok_or_else(|| {
                    invalid(format!("unsupported type '{type_name}' for '{name}'"))
                })?;

                params.push(ParamSpec {
                    name: name.clone(),
                    kind,
                    required: required.contains(&name.as_str()),
                    default: prop.get("default").cloned(),
                    description: prop
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                });
            }
        }

        Ok(Self {
            name: info.name,
            description: info.description,
            params,
        })
    }
}

/// What a tool returns: text, or structured JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Plain text.
    Text(String),
    /// Structured data; also rendered as text for simple clients.
    Structured(Value),
}

impl Payload {
    /// Text rendering of the payload.
    #[must_use]
    pub fn to_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Structured(value) => value.to_string(),
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

/// A failed tool call as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolFailure {
    /// Failure classification.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
}

impl ToolFailure {
    /// Creates a failure.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// The outcome of one tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The handler returned a value.
    Success(Payload),
    /// The call was rejected or the handler failed.
    Failure(ToolFailure),
}

impl From<&Outcome> for ToolCallResult {
    fn from(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Success(Payload::Text(text)) => Self::text(text.clone()),
            Outcome::Success(Payload::Structured(value)) => Self {
                structured_content: Some(value.clone()),
                ..Self::text(value.to_string())
            },
            Outcome::Failure(failure) => {
                Self::error(failure.kind.as_str(), failure.message.clone())
            }
        }
    }
}

impl From<ToolCallResult> for Outcome {
    fn from(result: ToolCallResult) -> Self {
        if result.is_error {
            let kind = result
                .error_kind
                .as_deref()
                .and_then(ErrorKind::from_wire)
                .unwrap_or(ErrorKind::HandlerError);
            return Self::Failure(ToolFailure::new(kind, result.joined_text()));
        }

        match result.structured_content {
            Some(value) => Self::Success(Payload::Structured(value)),
            None => Self::Success(Payload::Text(result.joined_text())),
        }
    }
}

/// A registered tool: its descriptor and its handler.
#[derive(Clone)]
pub struct RegisteredTool {
    /// The declared interface.
    pub descriptor: ToolDescriptor,
    /// The implementation.
    pub handler: ToolHandler,
}

impl fmt::Debug for RegisteredTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredTool")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// Maps tool names to descriptors and handlers, in registration order.
#[derive(Debug, Default, Clone)]
pub struct ToolRegistry {
    tools: IndexMap<String, RegisteredTool>,
}

impl ToolRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateName`] if the name is taken.
    pub fn register<F>(
        &mut self,
        descriptor: ToolDescriptor,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(&Arguments) -> Result<Payload, ToolError> + Send + Sync + 'static,
    {
        if self.tools.contains_key(&descriptor.name) {
            return Err(RegistryError::DuplicateName(descriptor.name));
        }

        tracing::debug!(tool = %descriptor.name, "Registered tool");
        self.tools.insert(
            descriptor.name.clone(),
            RegisteredTool {
                descriptor,
                handler: Arc::new(handler),
            },
        );
        Ok(())
    }

    /// Looks up a tool by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    /// All descriptors, in registration order.
    #[must_use]
    pub fn list(&self) -> Vec<&ToolDescriptor> {
        self.tools.values().map(|t| &t.descriptor).collect()
    }

    /// Number of registered tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether no tools are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
