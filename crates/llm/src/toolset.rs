//! Tool definitions and the dynamic toolset seam.
//!
//! A [`Toolset`] bundles a few related tools behind one dispatch point; the
//! runtime passes toolsets into the executor per run, so tools can close
//! over per-run state (plan progress, scheduling quotas) without any global
//! registry.

use async_trait::async_trait;

/// Parameter type as rendered into the JSON schema sent to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Integer,
    Number,
    /// An array of free-form objects.
    ObjectArray,
}

impl ParamKind {
    fn json_type(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::ObjectArray => "array",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolParam {
    pub name: String,
    pub description: String,
    pub kind: ParamKind,
    pub required: bool,
}

impl ToolParam {
    pub fn required(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            kind: ParamKind::String,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(name, description)
        }
    }

    pub fn kind(mut self, kind: ParamKind) -> Self {
        self.kind = kind;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub params: Vec<ToolParam>,
}

/// A named bundle of tools invocable by the model.
#[async_trait]
pub trait Toolset: Send + Sync {
    fn specs(&self) -> Vec<ToolSpec>;

    /// Invoke a tool by name. Validation problems are returned as `Ok` with
    /// a human-readable message so the model can self-correct; `Err` is
    /// reserved for tools this set does not own.
    async fn invoke(&self, name: &str, args: serde_json::Value) -> anyhow::Result<String>;

    fn owns(&self, name: &str) -> bool {
        self.specs().iter().any(|s| s.name == name)
    }
}

/// Render specs into the OpenAI `tools` array shape.
pub fn specs_to_openai_tools(specs: &[ToolSpec]) -> serde_json::Value {
    let tools: Vec<serde_json::Value> = specs
        .iter()
        .map(|spec| {
            let mut properties = serde_json::Map::new();
            let mut required = Vec::new();
            for param in &spec.params {
                let mut schema = serde_json::Map::new();
                schema.insert("type".into(), param.kind.json_type().into());
                schema.insert("description".into(), param.description.clone().into());
                if param.kind == ParamKind::ObjectArray {
                    schema.insert("items".into(), serde_json::json!({"type": "object"}));
                }
                properties.insert(param.name.clone(), schema.into());
                if param.required {
                    required.push(param.name.clone());
                }
            }
            serde_json::json!({
                "type": "function",
                "function": {
                    "name": spec.name,
                    "description": spec.description,
                    "parameters": {
                        "type": "object",
                        "properties": properties,
                        "required": required,
                    },
                },
            })
        })
        .collect();
    serde_json::Value::Array(tools)
}
