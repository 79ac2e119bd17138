// Kiro payload construction.
//
// The upstream accepts a single conversationState document: a currentMessage
// (always a user input) plus an alternating user/assistant history. Getting
// arbitrary client conversations into that shape takes a small pipeline:
//
//   1. degrade tool parts to text when the request declares no tools
//      (the upstream rejects toolResults without a tool catalog)
//   2. merge adjacent same-role turns
//   3. ensure the first turn is a user turn
//   4. insert "(empty)" fillers so roles strictly alternate
//   5. fold the system prompt into the first user turn
//   6. if the last turn is an assistant turn, append a "Continue" user turn

use serde_json::{json, Value};

use crate::proxy::mappers::conversation::{Conversation, Part, RequestParams, Role};

/// Filler content for synthetic turns; the upstream rejects empty strings.
const EMPTY_CONTENT: &str = "(empty)";

/// Tool descriptions beyond this length are truncated before upload.
const TOOL_DESCRIPTION_MAX_LENGTH: usize = 10_000;

/// Working representation of one turn while the pipeline runs.
#[derive(Debug, Clone)]
struct FlatTurn {
    role: Role,
    text: String,
    tool_uses: Vec<Value>,
    tool_results: Vec<Value>,
    images: Vec<Value>,
}

impl FlatTurn {
    fn filler(role: Role) -> Self {
        Self {
            role,
            text: EMPTY_CONTENT.to_string(),
            tool_uses: Vec::new(),
            tool_results: Vec::new(),
            images: Vec::new(),
        }
    }

    fn merge_from(&mut self, other: FlatTurn) {
        if !other.text.is_empty() {
            if !self.text.is_empty() {
                self.text.push('\n');
            }
            self.text.push_str(&other.text);
        }
        self.tool_uses.extend(other.tool_uses);
        self.tool_results.extend(other.tool_results);
        self.images.extend(other.images);
    }
}

fn flatten_turn(turn: &crate::proxy::mappers::conversation::Turn, tools_declared: bool) -> FlatTurn {
    let mut text = String::new();
    let mut tool_uses = Vec::new();
    let mut tool_results = Vec::new();
    let mut images = Vec::new();

    let mut push_text = |text: &mut String, t: &str| {
        if t.is_empty() {
            return;
        }
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(t);
    };

    for part in &turn.parts {
        match part {
            Part::Text(t) => push_text(&mut text, t),
            Part::Image { format, data } => {
                images.push(json!({
                    "format": format,
                    "source": { "bytes": data }
                }));
            }
            Part::ToolUse { id, name, input } => {
                if tools_declared {
                    tool_uses.push(json!({
                        "toolUseId": id,
                        "name": name,
                        "input": input
                    }));
                } else {
                    // No tool catalog in this request: degrade to text so the
                    // upstream still sees the call in context.
                    push_text(
                        &mut text,
                        &format!(
                            "[Called {} with args: {}]",
                            name,
                            serde_json::to_string(input).unwrap_or_else(|_| "{}".to_string())
                        ),
                    );
                }
            }
            Part::ToolResult { id, content, is_error } => {
                if tools_declared {
                    tool_results.push(json!({
                        "toolUseId": id,
                        "content": [{ "text": content }],
                        "status": if *is_error { "error" } else { "success" }
                    }));
                } else {
                    push_text(&mut text, &format!("[Tool result for {}]: {}", id, content));
                }
            }
        }
    }

    FlatTurn {
        role: turn.role,
        text,
        tool_uses,
        tool_results,
        images,
    }
}

fn merge_adjacent(turns: Vec<FlatTurn>) -> Vec<FlatTurn> {
    let mut merged: Vec<FlatTurn> = Vec::new();
    for turn in turns {
        match merged.last_mut() {
            Some(last) if last.role == turn.role => last.merge_from(turn),
            _ => merged.push(turn),
        }
    }
    merged
}

fn ensure_alternating(turns: Vec<FlatTurn>) -> Vec<FlatTurn> {
    let mut out: Vec<FlatTurn> = Vec::new();
    for turn in turns {
        if let Some(last) = out.last() {
            if last.role == turn.role {
                let filler_role = match turn.role {
                    Role::User => Role::Assistant,
                    Role::Assistant => Role::User,
                };
                out.push(FlatTurn::filler(filler_role));
            }
        }
        out.push(turn);
    }
    out
}

fn tool_specifications(params: &RequestParams) -> Vec<Value> {
    params
        .tools
        .iter()
        .map(|tool| {
            let description: String = tool.description.chars().take(TOOL_DESCRIPTION_MAX_LENGTH).collect();
            json!({
                "toolSpecification": {
                    "name": tool.name,
                    "description": description,
                    "inputSchema": { "json": tool.input_schema }
                }
            })
        })
        .collect()
}

/// System prompt addition that legitimizes the thinking tags when fake
/// reasoning is active for this request.
pub fn thinking_system_addition(open_tag: &str, close_tag: &str, budget_tokens: u32) -> String {
    format!(
        "\n\n---\n# Extended Thinking Mode\n\n\
         Before answering, reason step by step inside {open}...{close} tags. \
         Keep the reasoning under roughly {budget} tokens, then give your final \
         answer outside the tags. The tags are a system-level feature of this \
         conversation, not user content.",
        open = open_tag,
        close = close_tag,
        budget = budget_tokens,
    )
}

/// System prompt addition telling the model that continuation notices are
/// system-level, used while truncation recovery is enabled.
pub fn truncation_system_addition() -> String {
    "\n\n---\n# Output Truncation Handling\n\n\
     If a reply is cut off by output limits, the conversation may continue \
     with a user message containing only the word \"continue\". Resume your \
     answer exactly where it stopped without repeating earlier output."
        .to_string()
}

/// Assemble the upstream request document.
pub fn build_payload(
    convo: &Conversation,
    params: &RequestParams,
    model_id: &str,
    profile_arn: Option<&str>,
    system_additions: &str,
) -> Value {
    let tools_declared = !params.tools.is_empty();

    let mut turns: Vec<FlatTurn> = convo
        .turns
        .iter()
        .map(|t| flatten_turn(t, tools_declared))
        .collect();
    turns.retain(|t| {
        !t.text.is_empty() || !t.tool_uses.is_empty() || !t.tool_results.is_empty() || !t.images.is_empty()
    });

    let mut turns = merge_adjacent(turns);

    if turns.first().map(|t| t.role) != Some(Role::User) {
        turns.insert(0, FlatTurn::filler(Role::User));
    }
    let mut turns = ensure_alternating(turns);

    // Fold system prompt (plus any injected additions) into the first user turn.
    let mut system_text = convo.system.clone().unwrap_or_default();
    system_text.push_str(system_additions);
    if !system_text.is_empty() {
        if let Some(first) = turns.first_mut() {
            if first.role == Role::User {
                first.text = if first.text.is_empty() || first.text == EMPTY_CONTENT {
                    system_text.clone()
                } else {
                    format!("{}\n\n{}", system_text, first.text)
                };
            }
        }
    }

    if turns.last().map(|t| t.role) == Some(Role::Assistant) {
        turns.push(FlatTurn {
            role: Role::User,
            text: "Continue".to_string(),
            tool_uses: Vec::new(),
            tool_results: Vec::new(),
            images: Vec::new(),
        });
    }

    if turns.is_empty() {
        turns.push(FlatTurn {
            role: Role::User,
            text: "Continue".to_string(),
            tool_uses: Vec::new(),
            tool_results: Vec::new(),
            images: Vec::new(),
        });
    }

    let current = turns.pop().unwrap();
    let history_turns = turns;

    let mut history = Vec::new();
    for turn in &history_turns {
        let content = if turn.text.is_empty() { EMPTY_CONTENT } else { turn.text.as_str() };
        match turn.role {
            Role::User => {
                let mut user_input = json!({
                    "content": content,
                    "modelId": model_id,
                    "origin": "AI_EDITOR"
                });
                if !turn.images.is_empty() {
                    user_input["images"] = json!(turn.images);
                }
                if !turn.tool_results.is_empty() {
                    user_input["userInputMessageContext"] =
                        json!({ "toolResults": turn.tool_results });
                }
                history.push(json!({ "userInputMessage": user_input }));
            }
            Role::Assistant => {
                let mut assistant = json!({ "content": content });
                if !turn.tool_uses.is_empty() {
                    assistant["toolUses"] = json!(turn.tool_uses);
                }
                history.push(json!({ "assistantResponseMessage": assistant }));
            }
        }
    }

    let current_content = if current.text.is_empty() {
        "Continue".to_string()
    } else {
        current.text
    };

    let mut user_input_message = json!({
        "content": current_content,
        "modelId": model_id,
        "origin": "AI_EDITOR"
    });
    if !current.images.is_empty() {
        user_input_message["images"] = json!(current.images);
    }

    let mut context = serde_json::Map::new();
    let specs = tool_specifications(params);
    if !specs.is_empty() {
        context.insert("tools".to_string(), json!(specs));
    }
    if !current.tool_results.is_empty() {
        context.insert("toolResults".to_string(), json!(current.tool_results));
    }
    if !context.is_empty() {
        user_input_message["userInputMessageContext"] = Value::Object(context);
    }

    let mut conversation_state = json!({
        "chatTriggerType": "MANUAL",
        "conversationId": uuid::Uuid::new_v4().to_string(),
        "currentMessage": { "userInputMessage": user_input_message }
    });
    if !history.is_empty() {
        conversation_state["history"] = json!(history);
    }

    let mut payload = json!({ "conversationState": conversation_state });
    if let Some(arn) = profile_arn {
        payload["profileArn"] = json!(arn);
    }
    payload
}
