// AWS binary event-stream decoder.
//
// The Kiro streaming endpoint frames its JSON payloads in the AWS
// event-stream format:
//
//   prelude:  total_length:u32be | headers_length:u32be | prelude_crc:u32be
//   headers:  repeated { name_len:u8, name, value_type:u8, value }
//   payload:  total_length - headers_length - 16 bytes of UTF-8 JSON
//   trailer:  message_crc:u32be over everything before it
//
// Both CRCs are standard CRC-32 (reflected, init/xorout 0xFFFFFFFF). A CRC
// mismatch anywhere is fatal for the stream: the remaining bytes cannot be
// re-synchronized safely.

use bytes::{Buf, BytesMut};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::GatewayError;

const PRELUDE_LEN: usize = 12;
const CRC_LEN: usize = 4;
/// Upper bound on a single frame; anything larger is a corrupt length field.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Why the upstream stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}

impl StopReason {
    fn from_literal(raw: &str) -> Self {
        match raw {
            "endTurn" | "end_turn" => Self::EndTurn,
            "toolUse" | "tool_use" => Self::ToolUse,
            "maxTokens" | "max_tokens" => Self::MaxTokens,
            other => {
                warn!("Unknown upstream stop reason {:?}, treating as end of turn", other);
                Self::EndTurn
            }
        }
    }
}

/// Mid-stream failure kinds carried inside the chunk sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFault {
    /// Upstream reported an error/exception frame.
    Upstream { code: String, message: String },
    /// The connection ended without a terminal stop reason.
    Truncated,
}

/// Typed chunk records produced from the frame stream. Exactly one terminal
/// chunk (`Stop` or `Error`) is produced per accepted stream.
#[derive(Debug, Clone, PartialEq)]
pub enum KiroChunk {
    TextDelta(String),
    ToolUseStart { id: String, name: String },
    ToolUseDelta { id: String, fragment: String },
    ToolUseStop { id: String },
    Usage { input_tokens: u32, output_tokens: u32 },
    Stop(StopReason),
    Error(StreamFault),
}

struct Frame {
    message_type: String,
    event_type: String,
    payload: Vec<u8>,
}

/// Incremental decoder. Feed raw body bytes as they arrive; call `finish()`
/// once the connection closes.
pub struct EventStreamDecoder {
    buf: BytesMut,
    /// toolUseId of the tool block currently receiving input fragments.
    current_tool: Option<String>,
    saw_tool_use: bool,
    terminal_emitted: bool,
    fatal: bool,
}

impl Default for EventStreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            current_tool: None,
            saw_tool_use: false,
            terminal_emitted: false,
            fatal: false,
        }
    }

    /// Consume a slice of body bytes, returning every chunk that became
    /// complete. A CRC or framing violation poisons the decoder and returns
    /// a protocol error.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<KiroChunk>, GatewayError> {
        if self.fatal {
            return Err(GatewayError::Protocol("stream already failed".to_string()));
        }
        self.buf.extend_from_slice(bytes);

        let mut chunks = Vec::new();
        loop {
            match self.try_take_frame() {
                Ok(Some(frame)) => self.classify(frame, &mut chunks),
                Ok(None) => break,
                Err(e) => {
                    self.fatal = true;
                    return Err(e);
                }
            }
        }
        Ok(chunks)
    }

    /// Signal end of the byte stream. Partial trailing bytes are discarded;
    /// if no terminal chunk was seen the stream is reported as truncated.
    pub fn finish(&mut self) -> Vec<KiroChunk> {
        if !self.buf.is_empty() {
            debug!("Discarding {} trailing byte(s) of a partial frame", self.buf.len());
            self.buf.clear();
        }
        if self.terminal_emitted || self.fatal {
            return Vec::new();
        }
        self.terminal_emitted = true;
        vec![KiroChunk::Error(StreamFault::Truncated)]
    }

    fn try_take_frame(&mut self) -> Result<Option<Frame>, GatewayError> {
        if self.buf.len() < PRELUDE_LEN {
            return Ok(None);
        }

        let total_len = u32::from_be_bytes(self.buf[0..4].try_into().unwrap()) as usize;
        let headers_len = u32::from_be_bytes(self.buf[4..8].try_into().unwrap()) as usize;
        let prelude_crc = u32::from_be_bytes(self.buf[8..12].try_into().unwrap());

        if crc32fast::hash(&self.buf[0..8]) != prelude_crc {
            return Err(GatewayError::Protocol("prelude CRC mismatch".to_string()));
        }
        if total_len > MAX_FRAME_LEN || total_len < PRELUDE_LEN + CRC_LEN + headers_len {
            return Err(GatewayError::Protocol(format!(
                "implausible frame lengths (total={}, headers={})",
                total_len, headers_len
            )));
        }
        if self.buf.len() < total_len {
            return Ok(None);
        }

        let message_crc =
            u32::from_be_bytes(self.buf[total_len - CRC_LEN..total_len].try_into().unwrap());
        if crc32fast::hash(&self.buf[..total_len - CRC_LEN]) != message_crc {
            return Err(GatewayError::Protocol("message CRC mismatch".to_string()));
        }

        let headers = parse_headers(&self.buf[PRELUDE_LEN..PRELUDE_LEN + headers_len])?;
        let payload = self.buf[PRELUDE_LEN + headers_len..total_len - CRC_LEN].to_vec();
        self.buf.advance(total_len);

        let mut message_type = String::new();
        let mut event_type = String::new();
        for (name, value) in headers {
            match name.as_str() {
                ":message-type" => message_type = value,
                ":event-type" => event_type = value,
                ":exception-type" | ":error-code" if event_type.is_empty() => event_type = value,
                _ => {}
            }
        }

        Ok(Some(Frame {
            message_type,
            event_type,
            payload,
        }))
    }

    fn classify(&mut self, frame: Frame, out: &mut Vec<KiroChunk>) {
        let payload: Value = match serde_json::from_slice(&frame.payload) {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    "Skipping frame with unparseable payload ({}: {})",
                    frame.event_type, e
                );
                return;
            }
        };

        if frame.message_type == "error" || frame.message_type == "exception" {
            let message = payload
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("upstream error")
                .to_string();
            let code = if frame.event_type.is_empty() {
                frame.message_type.clone()
            } else {
                frame.event_type.clone()
            };
            self.terminal_emitted = true;
            out.push(KiroChunk::Error(StreamFault::Upstream { code, message }));
            return;
        }

        match frame.event_type.as_str() {
            "assistantResponseEvent" => {
                if let Some(content) = payload.get("content").and_then(|c| c.as_str()) {
                    if !content.is_empty() {
                        out.push(KiroChunk::TextDelta(content.to_string()));
                    }
                }
            }

            "toolUseEvent" => self.classify_tool_use(&payload, out),

            "messageMetadataEvent" => {
                if let Some(usage) = payload.get("usage") {
                    let input = usage
                        .get("inputTokens")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0) as u32;
                    let output = usage
                        .get("outputTokens")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0) as u32;
                    out.push(KiroChunk::Usage {
                        input_tokens: input,
                        output_tokens: output,
                    });
                }

                let reason = match payload.get("stopReason").and_then(|r| r.as_str()) {
                    Some(raw) => StopReason::from_literal(raw),
                    // Older upstream builds omit the literal; infer from what
                    // the stream actually carried.
                    None if self.saw_tool_use => StopReason::ToolUse,
                    None => StopReason::EndTurn,
                };
                self.terminal_emitted = true;
                out.push(KiroChunk::Stop(reason));
            }

            other => {
                warn!("Skipping unknown event type: {:?}", other);
            }
        }
    }

    fn classify_tool_use(&mut self, payload: &Value, out: &mut Vec<KiroChunk>) {
        let id = payload
            .get("toolUseId")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let name = payload.get("name").and_then(|v| v.as_str()).unwrap_or_default();
        let input = payload.get("input").and_then(|v| v.as_str()).unwrap_or_default();
        let stop = payload.get("stop").and_then(|v| v.as_bool()).unwrap_or(false);

        if id.is_empty() {
            warn!("Skipping toolUseEvent without toolUseId");
            return;
        }

        // First fragment for a new id implicitly opens the block.
        if self.current_tool.as_deref() != Some(id.as_str()) {
            if let Some(prev) = self.current_tool.take() {
                out.push(KiroChunk::ToolUseStop { id: prev });
            }
            self.saw_tool_use = true;
            self.current_tool = Some(id.clone());
            out.push(KiroChunk::ToolUseStart {
                id: id.clone(),
                name: name.to_string(),
            });
        }

        if !input.is_empty() {
            out.push(KiroChunk::ToolUseDelta {
                id: id.clone(),
                fragment: input.to_string(),
            });
        }

        if stop {
            self.current_tool = None;
            out.push(KiroChunk::ToolUseStop { id });
        }
    }
}

fn parse_headers(mut block: &[u8]) -> Result<Vec<(String, String)>, GatewayError> {
    let mut headers = Vec::new();

    while !block.is_empty() {
        let name_len = block[0] as usize;
        block = &block[1..];
        if block.len() < name_len + 1 {
            return Err(GatewayError::Protocol("header name overruns block".to_string()));
        }
        let name = String::from_utf8_lossy(&block[..name_len]).to_string();
        block = &block[name_len..];

        let value_type = block[0];
        block = &block[1..];

        // Per the event-stream header value types; only strings (7) carry
        // routing information here, everything else is skipped by length.
        let value = match value_type {
            0 | 1 => String::new(),
            2 => skip(&mut block, 1)?,
            3 => skip(&mut block, 2)?,
            4 => skip(&mut block, 4)?,
            5 | 8 => skip(&mut block, 8)?,
            6 | 7 => {
                if block.len() < 2 {
                    return Err(GatewayError::Protocol("header value overruns block".to_string()));
                }
                let len = u16::from_be_bytes(block[0..2].try_into().unwrap()) as usize;
                block = &block[2..];
                if block.len() < len {
                    return Err(GatewayError::Protocol("header value overruns block".to_string()));
                }
                let value = String::from_utf8_lossy(&block[..len]).to_string();
                block = &block[len..];
                value
            }
            9 => skip(&mut block, 16)?,
            other => {
                return Err(GatewayError::Protocol(format!(
                    "unknown header value type {}",
                    other
                )))
            }
        };

        headers.push((name, value));
    }

    Ok(headers)
}

fn skip(block: &mut &[u8], n: usize) -> Result<String, GatewayError> {
    if block.len() < n {
        return Err(GatewayError::Protocol("header value overruns block".to_string()));
    }
    *block = &block[n..];
    Ok(String::new())
}

/// Build one wire frame. Test-only: the gateway never encodes frames, but the
/// decoder tests and the pipeline integration test need realistic input.
#[cfg(test)]
pub fn encode_frame(message_type: &str, event_type: &str, payload: &[u8]) -> Vec<u8> {
    fn string_header(name: &str, value: &str) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(name.len() as u8);
        out.extend_from_slice(name.as_bytes());
        out.push(7u8);
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.extend_from_slice(value.as_bytes());
        out
    }

    let mut headers = string_header(":message-type", message_type);
    headers.extend(string_header(":event-type", event_type));

    let total_len = PRELUDE_LEN + headers.len() + payload.len() + CRC_LEN;
    let mut frame = Vec::with_capacity(total_len);
    frame.extend_from_slice(&(total_len as u32).to_be_bytes());
    frame.extend_from_slice(&(headers.len() as u32).to_be_bytes());
    frame.extend_from_slice(&crc32fast::hash(&frame[0..8]).to_be_bytes());
    frame.extend_from_slice(&headers);
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&crc32fast::hash(&frame).to_be_bytes());
    frame
}
