// Anthropic Messages dialect: request models and conversion into the
// dialect-neutral conversation shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::GatewayError;
use crate::proxy::mappers::conversation::{
    image_part, tool_result_text, Conversation, Part, RequestParams, Role, ToolSpec, Turn,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    /// Fields this gateway does not interpret; logged at DEBUG and dropped.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingConfig {
    #[serde(rename = "type")]
    pub type_: String, // "enabled" | "disabled"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    String(String),
    Array(Vec<SystemBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    String(String),
    Array(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "thinking")]
    Thinking {
        thinking: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },

    #[serde(rename = "image")]
    Image { source: ImageSource },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub source_type: String, // "base64"
    pub media_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

impl ClaudeRequest {
    /// Lower this request into the shared conversation representation.
    pub fn to_conversation(&self) -> Result<(Conversation, RequestParams), GatewayError> {
        if !self.extra.is_empty() {
            let keys: Vec<&str> = self.extra.keys().map(|k| k.as_str()).collect();
            debug!("Ignoring unrecognized request fields: {:?}", keys);
        }

        let mut convo = Conversation::default();

        if let Some(system) = &self.system {
            match system {
                SystemPrompt::String(s) => convo.push_system(s),
                SystemPrompt::Array(blocks) => {
                    for block in blocks {
                        convo.push_system(&block.text);
                    }
                }
            }
        }

        for message in &self.messages {
            let role = match message.role.as_str() {
                "user" => Role::User,
                "assistant" => Role::Assistant,
                other => {
                    debug!("Normalizing unknown role {:?} to user", other);
                    Role::User
                }
            };

            let mut parts = Vec::new();
            match &message.content {
                MessageContent::String(s) => {
                    if !s.is_empty() {
                        parts.push(Part::Text(s.clone()));
                    }
                }
                MessageContent::Array(blocks) => {
                    for block in blocks {
                        match block {
                            ContentBlock::Text { text } => {
                                if !text.is_empty() {
                                    parts.push(Part::Text(text.clone()));
                                }
                            }
                            // Prior-turn reasoning is context like any other text.
                            ContentBlock::Thinking { thinking, .. } => {
                                if !thinking.is_empty() {
                                    parts.push(Part::Text(thinking.clone()));
                                }
                            }
                            ContentBlock::Image { source } => {
                                parts.push(image_part(&source.media_type, &source.data)?);
                            }
                            ContentBlock::ToolUse { id, name, input } => {
                                parts.push(Part::ToolUse {
                                    id: id.clone(),
                                    name: name.clone(),
                                    input: input.clone(),
                                });
                            }
                            ContentBlock::ToolResult { tool_use_id, content, is_error } => {
                                parts.push(Part::ToolResult {
                                    id: tool_use_id.clone(),
                                    content: tool_result_text(content),
                                    is_error: is_error.unwrap_or(false),
                                });
                            }
                        }
                    }
                }
            }

            convo.turns.push(Turn { role, parts });
        }

        let tools = self
            .tools
            .as_ref()
            .map(|tools| {
                tools
                    .iter()
                    .map(|t| ToolSpec {
                        name: t.name.clone(),
                        description: t.description.clone().unwrap_or_default(),
                        input_schema: t.input_schema.clone().unwrap_or_else(|| serde_json::json!({})),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let reasoning_budget = self.thinking.as_ref().and_then(|t| {
            if t.type_ == "enabled" {
                Some(t.budget_tokens.unwrap_or(4000))
            } else {
                None
            }
        });

        let params = RequestParams {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            stop_sequences: self.stop_sequences.clone().unwrap_or_default(),
            stream: self.stream,
            tools,
            reasoning_budget,
        };

        Ok((convo, params))
    }
}
