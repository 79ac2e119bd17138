// Dialect-neutral conversation representation.
//
// Both client surfaces parse into this shape, and the Kiro payload builder
// consumes it; dialect differences stay at the edges.

use serde_json::Value;

use crate::error::GatewayError;

/// Image formats the upstream accepts.
const SUPPORTED_IMAGE_FORMATS: &[&str] = &["jpeg", "png", "gif", "webp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(String),
    Image {
        /// Bare format name, e.g. "png".
        format: String,
        /// Raw base64 payload (no data-URL prefix).
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        id: String,
        content: String,
        is_error: bool,
    },
}

#[derive(Debug, Clone)]
pub struct Turn {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Turn {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![Part::Text(text.into())],
        }
    }

    /// Concatenated text content of this turn.
    pub fn joined_text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let Part::Text(t) = part {
                if !t.is_empty() {
                    if !out.is_empty() {
                        out.push('\n');
                    }
                    out.push_str(t);
                }
            }
        }
        out
    }

    pub fn has_tool_results(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, Part::ToolResult { .. }))
    }
}

#[derive(Debug, Clone, Default)]
pub struct Conversation {
    pub system: Option<String>,
    pub turns: Vec<Turn>,
}

impl Conversation {
    pub fn push_system(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        match &mut self.system {
            Some(existing) => {
                existing.push('\n');
                existing.push_str(text);
            }
            None => self.system = Some(text.to_string()),
        }
    }
}

/// A tool the client offered to the model, dialect-neutral.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool input.
    pub input_schema: Value,
}

/// Sampling and control parameters shared by both dialects.
#[derive(Debug, Clone, Default)]
pub struct RequestParams {
    pub model: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub stop_sequences: Vec<String>,
    pub stream: bool,
    pub tools: Vec<ToolSpec>,
    /// Requested reasoning budget in tokens, when the client asked for it.
    pub reasoning_budget: Option<u32>,
}

/// Build an image part from a media type (or bare format) and base64 data,
/// stripping a data-URL prefix when present.
pub fn image_part(media_type: &str, data: &str) -> Result<Part, GatewayError> {
    let mut media_type = media_type.to_string();
    let mut data = data.to_string();

    if data.starts_with("data:") {
        if let Some(comma) = data.find(',') {
            let header = &data[..comma];
            if let Some(mt) = header.strip_prefix("data:") {
                let mt = mt.split(';').next().unwrap_or("");
                if !mt.is_empty() {
                    media_type = mt.to_string();
                }
            }
            data = data[comma + 1..].to_string();
        }
    }

    let format = media_type
        .rsplit('/')
        .next()
        .unwrap_or(&media_type)
        .to_lowercase();
    let format = if format == "jpg" { "jpeg".to_string() } else { format };

    if !SUPPORTED_IMAGE_FORMATS.contains(&format.as_str()) {
        return Err(GatewayError::BadRequest(format!(
            "unsupported image format: {}",
            format
        )));
    }

    use base64::Engine;
    if base64::engine::general_purpose::STANDARD.decode(&data).is_err() {
        return Err(GatewayError::BadRequest("image data is not valid base64".to_string()));
    }

    Ok(Part::Image { format, data })
}

/// Render tool-result content that may be a string or an array of typed
/// blocks into plain text.
pub fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
