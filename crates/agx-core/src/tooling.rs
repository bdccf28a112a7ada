//! Tool invocation contract and registry.
//!
//! The core never implements concrete tools. It consumes anything that
//! implements [`Tool`]: a name, a parameter schema, and an async `invoke`.
//! [`ToolRegistry`] resolves names and validates parameters before dispatch.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::plan::Params;
use crate::planner::FailureClass;

/// JSON type expected for a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
        }
    }
}

/// Declared shape of one parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSpec {
    #[serde(rename = "type")]
    pub param_type: ParamType,
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

/// Parameter name -> spec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSchema {
    params: BTreeMap<String, ParameterSpec>,
}

impl ParameterSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(
        mut self,
        name: impl Into<String>,
        param_type: ParamType,
        description: impl Into<String>,
    ) -> Self {
        self.params.insert(
            name.into(),
            ParameterSpec {
                param_type,
                required: true,
                description: description.into(),
            },
        );
        self
    }

    pub fn optional(
        mut self,
        name: impl Into<String>,
        param_type: ParamType,
        description: impl Into<String>,
    ) -> Self {
        self.params.insert(
            name.into(),
            ParameterSpec {
                param_type,
                required: false,
                description: description.into(),
            },
        );
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParameterSpec> {
        self.params.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParameterSpec)> {
        self.params.iter()
    }

    /// Required parameters must be present; declared parameters must have
    /// the declared type. Undeclared parameters pass through untouched.
    pub fn validate(&self, tool_name: &str, params: &Params) -> Result<(), ToolError> {
        for (name, spec) in &self.params {
            match params.get(name) {
                None if spec.required => {
                    return Err(ToolError::MissingParameter {
                        tool_name: tool_name.to_string(),
                        parameter: name.clone(),
                    });
                }
                Some(value) if !spec.param_type.accepts(value) => {
                    return Err(ToolError::InvalidParameterType {
                        tool_name: tool_name.to_string(),
                        parameter: name.clone(),
                        expected: spec.param_type,
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Outcome of one tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: Value,
    pub error: Option<String>,
    /// Structured failure classification, when the tool knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_class: Option<FailureClass>,
}

impl ToolResult {
    pub fn ok(output: impl Into<Value>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            failure_class: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Value::Null,
            error: Some(message.into()),
            failure_class: None,
        }
    }

    pub fn with_failure_class(mut self, class: FailureClass) -> Self {
        self.failure_class = Some(class);
        self
    }
}

/// Registry and dispatch failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("unknown tool: {tool_name}")]
    UnknownTool { tool_name: String },

    #[error("duplicate tool registration: {tool_name}")]
    DuplicateTool { tool_name: String },

    #[error("tool '{tool_name}' is missing required parameter '{parameter}'")]
    MissingParameter {
        tool_name: String,
        parameter: String,
    },

    #[error("tool '{tool_name}' parameter '{parameter}' must be of type {expected:?}")]
    InvalidParameterType {
        tool_name: String,
        parameter: String,
        expected: ParamType,
    },
}

/// Contract every tool implements.
#[async_trait]
pub trait Tool: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn parameter_schema(&self) -> ParameterSchema;

    async fn invoke(&self, params: &Params) -> ToolResult;
}

/// Name -> tool lookup.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Tool>(&mut self, tool: T) -> Result<(), ToolError> {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(ToolError::DuplicateTool { tool_name: name });
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered tool names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Resolve, validate, and invoke.
    pub async fn invoke(&self, name: &str, params: &Params) -> Result<ToolResult, ToolError> {
        let tool = self.get(name).ok_or_else(|| ToolError::UnknownTool {
            tool_name: name.to_string(),
        })?;
        tool.parameter_schema().validate(name, params)?;
        Ok(tool.invoke(params).await)
    }
}
