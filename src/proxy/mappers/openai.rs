// OpenAI Chat Completions dialect: request models and conversion into the
// dialect-neutral conversation shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::GatewayError;
use crate::proxy::mappers::conversation::{
    image_part, Conversation, Part, RequestParams, Role, ToolSpec, Turn,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiRequest {
    pub model: String,
    pub messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Newer alias for max_tokens; wins when both are present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopField>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<OpenAiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopField {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<OpenAiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<OpenAiToolCall>>,
    /// Set on role=tool messages: which call this result answers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OpenAiContent {
    String(String),
    Parts(Vec<OpenAiContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OpenAiContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: OpenAiFunctionCall,
}

fn function_kind() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiFunctionCall {
    pub name: String,
    /// Arguments arrive as a JSON-encoded string, per the OpenAI contract.
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiTool {
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: OpenAiFunctionDef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiFunctionDef {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// Reasoning budgets corresponding to the OpenAI effort levels.
fn effort_to_budget(effort: &str) -> Option<u32> {
    match effort {
        "low" => Some(1024),
        "medium" => Some(4096),
        "high" => Some(8192),
        other => {
            debug!("Ignoring unknown reasoning_effort {:?}", other);
            None
        }
    }
}

impl OpenAiRequest {
    pub fn to_conversation(&self) -> Result<(Conversation, RequestParams), GatewayError> {
        if !self.extra.is_empty() {
            let keys: Vec<&str> = self.extra.keys().map(|k| k.as_str()).collect();
            debug!("Ignoring unrecognized request fields: {:?}", keys);
        }

        let mut convo = Conversation::default();

        for message in &self.messages {
            match message.role.as_str() {
                "system" | "developer" => {
                    if let Some(content) = &message.content {
                        convo.push_system(&content_text(content));
                    }
                }

                "user" => {
                    convo.turns.push(Turn {
                        role: Role::User,
                        parts: content_parts(message.content.as_ref())?,
                    });
                }

                "assistant" => {
                    let mut parts = content_parts(message.content.as_ref())?;
                    if let Some(calls) = &message.tool_calls {
                        for call in calls {
                            let input: Value = if call.function.arguments.trim().is_empty() {
                                serde_json::json!({})
                            } else {
                                serde_json::from_str(&call.function.arguments).map_err(|e| {
                                    GatewayError::BadRequest(format!(
                                        "tool call {} has malformed arguments: {}",
                                        call.id, e
                                    ))
                                })?
                            };
                            parts.push(Part::ToolUse {
                                id: call.id.clone(),
                                name: call.function.name.clone(),
                                input,
                            });
                        }
                    }
                    convo.turns.push(Turn { role: Role::Assistant, parts });
                }

                "tool" => {
                    let id = message.tool_call_id.clone().ok_or_else(|| {
                        GatewayError::BadRequest("tool message missing tool_call_id".to_string())
                    })?;
                    let content = message
                        .content
                        .as_ref()
                        .map(content_text)
                        .unwrap_or_default();
                    convo.turns.push(Turn {
                        role: Role::User,
                        parts: vec![Part::ToolResult { id, content, is_error: false }],
                    });
                }

                other => {
                    debug!("Normalizing unknown role {:?} to user", other);
                    convo.turns.push(Turn {
                        role: Role::User,
                        parts: content_parts(message.content.as_ref())?,
                    });
                }
            }
        }

        let tools = self
            .tools
            .as_ref()
            .map(|tools| {
                tools
                    .iter()
                    .filter(|t| t.kind == "function")
                    .map(|t| ToolSpec {
                        name: t.function.name.clone(),
                        description: t.function.description.clone().unwrap_or_default(),
                        input_schema: t
                            .function
                            .parameters
                            .clone()
                            .unwrap_or_else(|| serde_json::json!({})),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let stop_sequences = match &self.stop {
            None => Vec::new(),
            Some(StopField::One(s)) => vec![s.clone()],
            Some(StopField::Many(v)) => v.clone(),
        };

        let params = RequestParams {
            model: self.model.clone(),
            max_tokens: self.max_completion_tokens.or(self.max_tokens),
            temperature: self.temperature,
            top_p: self.top_p,
            stop_sequences,
            stream: self.stream,
            tools,
            reasoning_budget: self
                .reasoning_effort
                .as_deref()
                .and_then(effort_to_budget),
        };

        Ok((convo, params))
    }
}

fn content_text(content: &OpenAiContent) -> String {
    match content {
        OpenAiContent::String(s) => s.clone(),
        OpenAiContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| match p {
                OpenAiContentPart::Text { text } => Some(text.as_str()),
                OpenAiContentPart::ImageUrl { .. } => None,
            })
            .collect::<Vec<_>>()
            .join(""),
    }
}

fn content_parts(content: Option<&OpenAiContent>) -> Result<Vec<Part>, GatewayError> {
    let Some(content) = content else {
        return Ok(Vec::new());
    };

    match content {
        OpenAiContent::String(s) => Ok(if s.is_empty() {
            Vec::new()
        } else {
            vec![Part::Text(s.clone())]
        }),
        OpenAiContent::Parts(parts) => {
            let mut out = Vec::new();
            for part in parts {
                match part {
                    OpenAiContentPart::Text { text } => {
                        if !text.is_empty() {
                            out.push(Part::Text(text.clone()));
                        }
                    }
                    OpenAiContentPart::ImageUrl { image_url } => {
                        out.push(image_part("", &image_url.url)?);
                    }
                }
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> OpenAiRequest {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn simple_request_to_conversation() {
        let request = parse(
            r#"{"model":"claude-sonnet-4","max_tokens":10,
                "messages":[
                    {"role":"system","content":"be terse"},
                    {"role":"user","content":"2+2?"}
                ]}"#,
        );
        let (convo, params) = request.to_conversation().unwrap();

        assert_eq!(convo.system.as_deref(), Some("be terse"));
        assert_eq!(convo.turns.len(), 1);
        assert_eq!(convo.turns[0].joined_text(), "2+2?");
        assert_eq!(params.max_tokens, Some(10));
        assert_eq!(params.model, "claude-sonnet-4");
    }

    #[test]
    fn max_completion_tokens_wins() {
        let request = parse(
            r#"{"model":"m","max_tokens":10,"max_completion_tokens":20,
                "messages":[{"role":"user","content":"x"}]}"#,
        );
        let (_, params) = request.to_conversation().unwrap();
        assert_eq!(params.max_tokens, Some(20));
    }

    #[test]
    fn assistant_tool_calls_become_tool_use_parts() {
        let request = parse(
            r#"{"model":"m","messages":[
                {"role":"assistant","content":null,"tool_calls":[
                    {"id":"call_1","type":"function",
                     "function":{"name":"get_weather","arguments":"{\"city\":\"Paris\"}"}}
                ]},
                {"role":"tool","tool_call_id":"call_1","content":"sunny"}
            ]}"#,
        );
        let (convo, _) = request.to_conversation().unwrap();

        assert!(matches!(
            &convo.turns[0].parts[0],
            Part::ToolUse { id, name, input }
                if id == "call_1" && name == "get_weather" && input["city"] == "Paris"
        ));
        assert!(matches!(
            &convo.turns[1].parts[0],
            Part::ToolResult { id, content, .. } if id == "call_1" && content == "sunny"
        ));
    }

    #[test]
    fn malformed_tool_arguments_rejected() {
        let request = parse(
            r#"{"model":"m","messages":[
                {"role":"assistant","tool_calls":[
                    {"id":"c","type":"function","function":{"name":"f","arguments":"{oops"}}
                ]}
            ]}"#,
        );
        assert!(matches!(
            request.to_conversation(),
            Err(GatewayError::BadRequest(_))
        ));
    }

    #[test]
    fn image_url_part_converted() {
        let request = parse(
            r#"{"model":"m","messages":[
                {"role":"user","content":[
                    {"type":"text","text":"what is this"},
                    {"type":"image_url","image_url":{"url":"data:image/png;base64,aGVsbG8="}}
                ]}
            ]}"#,
        );
        let (convo, _) = request.to_conversation().unwrap();
        assert!(matches!(
            &convo.turns[0].parts[1],
            Part::Image { format, .. } if format == "png"
        ));
    }

    #[test]
    fn stop_field_both_shapes() {
        let one = parse(r#"{"model":"m","stop":"END","messages":[{"role":"user","content":"x"}]}"#);
        let (_, p1) = one.to_conversation().unwrap();
        assert_eq!(p1.stop_sequences, vec!["END"]);

        let many =
            parse(r#"{"model":"m","stop":["a","b"],"messages":[{"role":"user","content":"x"}]}"#);
        let (_, p2) = many.to_conversation().unwrap();
        assert_eq!(p2.stop_sequences, vec!["a", "b"]);
    }

    #[test]
    fn reasoning_effort_maps_to_budget() {
        let request = parse(
            r#"{"model":"m","reasoning_effort":"medium","messages":[{"role":"user","content":"x"}]}"#,
        );
        let (_, params) = request.to_conversation().unwrap();
        assert_eq!(params.reasoning_budget, Some(4096));
    }

    #[test]
    fn tools_convert_to_specs() {
        let request = parse(
            r#"{"model":"m","messages":[{"role":"user","content":"x"}],
                "tools":[{"type":"function","function":{
                    "name":"get_weather","description":"d",
                    "parameters":{"type":"object","properties":{"city":{"type":"string"}}}}}]}"#,
        );
        let (_, params) = request.to_conversation().unwrap();
        assert_eq!(params.tools.len(), 1);
        assert_eq!(params.tools[0].name, "get_weather");
        assert_eq!(params.tools[0].input_schema["properties"]["city"]["type"], "string");
    }

    use proptest::prelude::*;

    proptest! {
        /// Params survive the lowering untouched for tool-free requests.
        #[test]
        fn prop_params_preserved(
            max_tokens in 1u32..100_000,
            temperature in 0.0f64..2.0,
            text in "[a-zA-Z0-9 ]{1,40}",
        ) {
            let raw = serde_json::json!({
                "model": "claude-sonnet-4",
                "max_tokens": max_tokens,
                "temperature": temperature,
                "messages": [{ "role": "user", "content": text }]
            });
            let request: OpenAiRequest = serde_json::from_value(raw).unwrap();
            let (convo, params) = request.to_conversation().unwrap();

            prop_assert_eq!(params.max_tokens, Some(max_tokens));
            prop_assert!((params.temperature.unwrap() - temperature).abs() < 1e-9);
            prop_assert_eq!(convo.turns[0].joined_text(), text);
        }
    }
}
