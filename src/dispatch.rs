//! Invocable tool handles.
//!
//! Each [`BoundTool`] owns its server id, tool name and schema by value, so
//! handles built in a loop stay bound to their own tool no matter how the
//! collection is later reordered or iterated.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::ToolError;
use crate::invoker::{json_type, Invoker, ToolOutput};
use crate::mcp::{ServerId, ToolDescriptor};

/// Builds [`BoundTool`]s that share one invoker.
#[derive(Clone)]
pub struct Dispatcher {
    invoker: Arc<Invoker>,
}

impl Dispatcher {
    pub fn new(invoker: Arc<Invoker>) -> Self {
        Self { invoker }
    }

    /// Bind one tool. `server_id` takes precedence over the descriptor's own.
    pub fn build(&self, descriptor: &ToolDescriptor, server_id: &ServerId) -> BoundTool {
        BoundTool {
            server_id: server_id.clone(),
            name: descriptor.name.clone(),
            description: descriptor.description.clone(),
            input_schema: descriptor.input_schema.clone(),
            invoker: self.invoker.clone(),
        }
    }

    pub fn build_all(&self, descriptors: &[ToolDescriptor]) -> Vec<BoundTool> {
        descriptors
            .iter()
            .map(|descriptor| self.build(descriptor, &descriptor.server_id))
            .collect()
    }
}

/// A callable permanently bound to one `(server, tool, schema)`.
#[derive(Clone)]
pub struct BoundTool {
    server_id: ServerId,
    name: String,
    description: String,
    input_schema: Option<Value>,
    invoker: Arc<Invoker>,
}

impl std::fmt::Debug for BoundTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundTool")
            .field("server_id", &self.server_id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl BoundTool {
    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn input_schema(&self) -> Option<&Value> {
        self.input_schema.as_ref()
    }

    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.server_id, self.name)
    }

    /// Check `arguments` against the input schema without calling.
    pub fn validate(&self, arguments: &Value) -> Result<(), ToolError> {
        validate_arguments(self.input_schema.as_ref(), arguments).map_err(|reason| {
            ToolError::SchemaValidation {
                server_id: self.server_id.clone(),
                tool: self.name.clone(),
                reason,
            }
        })
    }

    pub async fn call(&self, arguments: Value) -> Result<ToolOutput, ToolError> {
        self.call_with_cancel(arguments, &CancellationToken::new())
            .await
    }

    pub async fn call_with_cancel(
        &self,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, ToolError> {
        self.validate(&arguments)?;
        self.invoker
            .invoke(&self.server_id, &self.name, arguments, cancel)
            .await
    }
}

/// Best-effort check of `arguments` against a JSON Schema fragment.
///
/// Covers the top level only: `required`, per-property `type` and `enum`,
/// and `additionalProperties: false`. Anything the schema does not say, or
/// says in a form not understood here, is let through for the server to
/// judge.
pub fn validate_arguments(schema: Option<&Value>, arguments: &Value) -> Result<(), String> {
    let args = match arguments {
        Value::Null => None,
        Value::Object(map) => Some(map),
        other => return Err(format!("arguments must be a JSON object, got {}", json_type(other))),
    };
    let Some(schema) = schema.and_then(Value::as_object) else {
        return Ok(());
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if !args.is_some_and(|a| a.contains_key(field)) {
                return Err(format!("missing required field '{}'", field));
            }
        }
    }

    let Some(args) = args else {
        return Ok(());
    };
    let properties = schema.get("properties").and_then(Value::as_object);

    for (field, value) in args {
        let Some(property) = properties.and_then(|p| p.get(field)) else {
            if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
                return Err(format!("unexpected field '{}'", field));
            }
            continue;
        };

        match property.get("type") {
            Some(Value::String(expected)) if !type_matches(expected, value) => {
                return Err(format!(
                    "field '{}' must be {}, got {}",
                    field,
                    expected,
                    json_type(value)
                ));
            }
            Some(Value::Array(options)) => {
                let names: Vec<&str> = options.iter().filter_map(Value::as_str).collect();
                if !names.is_empty() && !names.iter().any(|t| type_matches(t, value)) {
                    return Err(format!(
                        "field '{}' must be one of [{}], got {}",
                        field,
                        names.join(", "),
                        json_type(value)
                    ));
                }
            }
            _ => {}
        }

        if let Some(allowed) = property.get("enum").and_then(Value::as_array) {
            if !allowed.contains(value) {
                return Err(format!("field '{}' is not one of the allowed values", field));
            }
        }
    }
    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        // Unknown type keywords are not ours to enforce.
        _ => true,
    }
}
