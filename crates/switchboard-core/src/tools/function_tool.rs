use crate::bridge::Bridge;
use crate::tools::tool::{Tool, ToolInvocation};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Parameter types a function tool can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl ParamKind {
    fn json_type(self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Integer => "integer",
            ParamKind::Number => "number",
            ParamKind::Boolean => "boolean",
            ParamKind::Object => "object",
            ParamKind::Array => "array",
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            ParamKind::String => value.is_string(),
            ParamKind::Integer => value.is_i64() || value.is_u64(),
            ParamKind::Number => value.is_number(),
            ParamKind::Boolean => value.is_boolean(),
            ParamKind::Object => value.is_object(),
            ParamKind::Array => value.is_array(),
        }
    }
}

/// One declared parameter of a function tool.
#[derive(Debug, Clone)]
pub struct ToolParam {
    pub name: String,
    pub kind: ParamKind,
    pub description: String,
    pub required: bool,
}

impl ToolParam {
    pub fn required(name: impl Into<String>, kind: ParamKind, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            description: description.into(),
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, kind: ParamKind, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            description: description.into(),
            required: false,
        }
    }
}

type ToolFn =
    Arc<dyn Fn(ToolInvocation) -> BoxFuture<'static, Result<Value>> + Send + Sync + 'static>;

/// A tool built from a plain async function plus declared parameters, the
/// static-registry analogue of deriving a schema from an annotated
/// function. The JSON schema is generated from the declarations, and
/// incoming arguments are validated against them (required keys, types,
/// unknown keys) before the function runs.
pub struct FunctionTool {
    name: String,
    description: String,
    params: Vec<ToolParam>,
    func: ToolFn,
}

impl FunctionTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        params: Vec<ToolParam>,
        func: F,
    ) -> Self
    where
        F: Fn(ToolInvocation) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        let func: ToolFn = Arc::new(move |invocation| Box::pin(func(invocation)));
        Self {
            name: name.into(),
            description: description.into(),
            params,
            func,
        }
    }

    fn validate(&self, arguments: &Value) -> Result<()> {
        let empty = Map::new();
        let object = match arguments {
            Value::Object(map) => map,
            Value::Null => &empty,
            _ => return Err(anyhow!("tool arguments must be an object")),
        };

        for param in &self.params {
            match object.get(&param.name) {
                None | Some(Value::Null) => {
                    if param.required {
                        return Err(anyhow!("missing required argument '{}'", param.name));
                    }
                }
                Some(value) => {
                    if !param.kind.accepts(value) {
                        return Err(anyhow!(
                            "argument '{}' must be of type {}",
                            param.name,
                            param.kind.json_type()
                        ));
                    }
                }
            }
        }
        for key in object.keys() {
            if !self.params.iter().any(|p| &p.name == key) {
                return Err(anyhow!("unknown argument '{key}'"));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for param in &self.params {
            properties.insert(
                param.name.clone(),
                json!({
                    "type": param.kind.json_type(),
                    "description": param.description,
                }),
            );
            if param.required {
                required.push(Value::String(param.name.clone()));
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    async fn execute(&self, invocation: ToolInvocation) -> Bridge<Value> {
        if let Err(e) = self.validate(&invocation.arguments) {
            return Bridge::fail(e);
        }
        let func = Arc::clone(&self.func);
        Bridge::from_future(async move { func(invocation).await })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn weather_tool() -> FunctionTool {
        FunctionTool::new(
            "get_weather",
            "Get weather for a location.",
            vec![
                ToolParam::required("loc", ParamKind::String, "City name"),
                ToolParam::optional("unit", ParamKind::String, "Temperature unit"),
            ],
            |invocation| async move {
                let loc = invocation.arguments["loc"].as_str().unwrap_or("?").to_string();
                Ok(json!({"loc": loc, "temp": 20}))
            },
        )
    }

    fn invocation(arguments: Value) -> ToolInvocation {
        ToolInvocation {
            user_id: "u1".to_string(),
            thread_id: "t1".to_string(),
            turn_correlation_id: "turn_1".to_string(),
            arguments,
        }
    }

    #[test]
    fn schema_is_generated_from_declarations() {
        let schema = weather_tool().parameters();
        assert_eq!(schema["type"], json!("object"));
        assert_eq!(schema["properties"]["loc"]["type"], json!("string"));
        assert_eq!(schema["required"], json!(["loc"]));
    }

    #[tokio::test]
    async fn valid_arguments_reach_the_function() {
        let result = weather_tool()
            .execute(invocation(json!({"loc": "X"})))
            .await
            .returns()
            .await
            .unwrap();
        assert_eq!(result, json!({"loc": "X", "temp": 20}));
    }

    #[tokio::test]
    async fn missing_required_argument_fails_before_invocation() {
        let err = weather_tool()
            .execute(invocation(json!({})))
            .await
            .returns()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("loc"));
    }

    #[tokio::test]
    async fn wrong_type_and_unknown_keys_are_rejected() {
        let err = weather_tool()
            .execute(invocation(json!({"loc": 5})))
            .await
            .returns()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("type string"));

        let err = weather_tool()
            .execute(invocation(json!({"loc": "X", "bogus": 1})))
            .await
            .returns()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown argument"));
    }
}
