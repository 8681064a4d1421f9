//! Tool Invocation Bridge
//!
//! The remote model may call functions that run on the client. Tools are
//! registered up front as `name -> (schema, handler)`; the bridge looks calls
//! up by name, validates the arguments against the schema, runs the handler
//! and turns the outcome into the messages sent back over the data channel.

use crate::{
    error::ToolError,
    events::{EventHub, ToolActivity, ToolCallRequest, ToolPhase},
};
use chrono::{SecondsFormat, Utc};
use futures::{FutureExt, future::BoxFuture};
use serde_json::{Value, json};
use std::{collections::BTreeMap, future::Future, panic::AssertUnwindSafe, sync::Arc};
use tracing::{info, warn};

type Handler = dyn Fn(Value) -> BoxFuture<'static, Result<Value, ToolError>> + Send + Sync;

/// Name, description and JSON Schema advertised to the remote peer.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// The `session.update` representation of this tool.
    pub fn to_session_tool(&self) -> Value {
        json!({
            "type": "function",
            "name": self.name,
            "description": self.description,
            "parameters": self.parameters,
        })
    }
}

struct RegisteredTool {
    definition: ToolDefinition,
    handler: Arc<Handler>,
}

/// Capability map of callable tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool, rejecting empty or duplicate names and non-object schemas.
    pub fn register<F, Fut>(&mut self, definition: ToolDefinition, handler: F) -> Result<(), ToolError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        if definition.name.trim().is_empty() {
            return Err(ToolError::EmptyName);
        }
        if self.tools.contains_key(&definition.name) {
            return Err(ToolError::Duplicate(definition.name));
        }
        check_schema(&definition)?;

        let handler: Arc<Handler> = Arc::new(move |args| handler(args).boxed());
        self.tools.insert(
            definition.name.clone(),
            RegisteredTool {
                definition,
                handler,
            },
        );
        Ok(())
    }

    /// Builder-style registration for static tool sets.
    pub fn with_tool<F, Fut>(mut self, definition: ToolDefinition, handler: F) -> Result<Self, ToolError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        self.register(definition, handler)?;
        Ok(self)
    }

    pub fn definitions(&self) -> impl Iterator<Item = &ToolDefinition> {
        self.tools.values().map(|t| &t.definition)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Looks up, validates and runs a tool.
    pub async fn invoke(&self, name: &str, arguments: Value) -> Result<Value, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        validate_arguments(&arguments, &tool.definition.parameters)
            .map_err(ToolError::InvalidArguments)?;

        let handler = Arc::clone(&tool.handler);
        match AssertUnwindSafe(handler(arguments)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "tool handler panicked".to_string());
                Err(ToolError::Handler(message))
            }
        }
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.tools.keys()).finish()
    }
}

fn check_schema(definition: &ToolDefinition) -> Result<(), ToolError> {
    let invalid = |reason: &str| ToolError::InvalidSchema {
        name: definition.name.clone(),
        reason: reason.to_string(),
    };
    let schema = definition
        .parameters
        .as_object()
        .ok_or_else(|| invalid("schema must be a JSON object"))?;
    if schema.get("type").and_then(Value::as_str) != Some("object") {
        return Err(invalid("schema `type` must be \"object\""));
    }
    if let Some(properties) = schema.get("properties") {
        if !properties.is_object() {
            return Err(invalid("`properties` must be an object"));
        }
    }
    if let Some(required) = schema.get("required") {
        let all_strings = required
            .as_array()
            .is_some_and(|fields| fields.iter().all(Value::is_string));
        if !all_strings {
            return Err(invalid("`required` must be an array of strings"));
        }
    }
    Ok(())
}

/// Top-level argument validation: object shape, required fields, property types.
pub fn validate_arguments(args: &Value, schema: &Value) -> Result<(), String> {
    if schema.get("type").and_then(Value::as_str) == Some("object") && !args.is_object() {
        return Err(format!("expected object arguments, got {}", json_type_name(args)));
    }
    let Some(obj) = args.as_object() else {
        return Ok(());
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !obj.contains_key(name) {
                return Err(format!("missing required field '{name}'"));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (key, value) in obj {
            let expected = properties
                .get(key)
                .and_then(|p| p.get("type"))
                .and_then(Value::as_str);
            if let Some(expected) = expected {
                if !value_matches_type(value, expected) {
                    return Err(format!(
                        "field '{key}' expected type '{expected}', got {}",
                        json_type_name(value)
                    ));
                }
            }
        }
    }
    Ok(())
}

fn value_matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Result of one dispatched call, keyed by the remote correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub call_id: String,
    pub name: String,
    pub result: Result<Value, ToolError>,
}

impl ToolOutcome {
    /// The structured payload returned to the remote peer.
    pub fn output(&self) -> Value {
        match &self.result {
            Ok(value) => value.clone(),
            Err(err) => json!({
                "error": {
                    "code": err.code(),
                    "message": err.to_string(),
                }
            }),
        }
    }

    /// `conversation.item.create` + `response.create`, ready for the data channel.
    pub fn reply_messages(&self) -> Vec<String> {
        let item = json!({
            "type": "conversation.item.create",
            "item": {
                "type": "function_call_output",
                "call_id": self.call_id,
                "output": self.output().to_string(),
            }
        });
        let respond = json!({ "type": "response.create" });
        vec![item.to_string(), respond.to_string()]
    }
}

/// Dispatches remote tool calls against a registry and reports activity.
#[derive(Clone)]
pub struct ToolInvocationBridge {
    registry: Arc<ToolRegistry>,
    hub: EventHub,
}

impl ToolInvocationBridge {
    pub fn new(registry: Arc<ToolRegistry>, hub: EventHub) -> Self {
        Self { registry, hub }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Runs one call. Never fails: every error becomes a structured result.
    pub async fn dispatch(&self, call: ToolCallRequest) -> ToolOutcome {
        self.report(ToolPhase::Started, &call, call.arguments.clone());
        info!(tool = %call.name, call_id = %call.call_id, "Invoking tool");

        let result = self.registry.invoke(&call.name, call.arguments.clone()).await;
        match &result {
            Ok(value) => self.report(ToolPhase::Completed, &call, value.clone()),
            Err(err) => {
                warn!(tool = %call.name, call_id = %call.call_id, error = %err, "Tool call failed");
                self.report(ToolPhase::Failed, &call, json!({ "error": err.to_string() }));
            }
        }

        ToolOutcome {
            call_id: call.call_id,
            name: call.name,
            result,
        }
    }

    fn report(&self, phase: ToolPhase, call: &ToolCallRequest, detail: Value) {
        self.hub.publish(crate::events::ChannelEvent::Tool(ToolActivity {
            phase,
            name: call.name.clone(),
            call_id: call.call_id.clone(),
            detail,
        }));
    }
}

/// `getTime(timezone?)`: current time as ISO-8601, plus a wall-clock rendering
/// when a valid IANA timezone is given.
pub fn get_time(timezone: Option<&str>) -> Value {
    let now = Utc::now();
    let iso = now.to_rfc3339_opts(SecondsFormat::Millis, true);
    match timezone.map(str::parse::<chrono_tz::Tz>) {
        Some(Ok(tz)) => json!({
            "iso": iso,
            "formatted": now.with_timezone(&tz).format("%m/%d/%Y, %H:%M:%S").to_string(),
        }),
        _ => json!({ "iso": iso }),
    }
}

pub fn get_time_definition() -> ToolDefinition {
    ToolDefinition::new(
        "getTime",
        "Get the current time as an ISO string. Optional timezone IANA name.",
        json!({
            "type": "object",
            "properties": {
                "timezone": {
                    "type": "string",
                    "description": "IANA timezone, e.g. 'America/Los_Angeles'"
                }
            }
        }),
    )
}

/// The default registry shipped with the client.
pub fn default_registry() -> Result<ToolRegistry, ToolError> {
    ToolRegistry::new().with_tool(get_time_definition(), |args: Value| async move {
        Ok(get_time(args.get("timezone").and_then(Value::as_str)))
    })
}
