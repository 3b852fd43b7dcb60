use foreman_protocol::stream::StreamMessage;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl ConversationMessage {
    fn assistant() -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            tool_calls: Vec::new(),
        }
    }
}

/// Group a raw message log into conversation turns.
///
/// Consecutive `assistant`, `tool_use` and `tool_result` messages form one
/// assistant turn; a `user` message or the end of the log closes it.
/// `system`, `result` and `error` messages carry no conversation content.
pub fn reconstruct(messages: &[StreamMessage]) -> Vec<ConversationMessage> {
    let mut out = Vec::new();
    let mut current: Option<ConversationMessage> = None;

    for message in messages {
        match message {
            StreamMessage::Assistant(assistant) => {
                current
                    .get_or_insert_with(ConversationMessage::assistant)
                    .content
                    .push_str(&assistant.content);
            }
            StreamMessage::ToolUse(tool_use) => {
                current
                    .get_or_insert_with(ConversationMessage::assistant)
                    .tool_calls
                    .push(ToolCall {
                        id: tool_use.id.clone(),
                        name: tool_use.name.clone(),
                        input: tool_use.input.clone(),
                        output: None,
                        is_error: false,
                    });
            }
            StreamMessage::ToolResult(result) => {
                let call = current.as_mut().and_then(|turn| {
                    turn.tool_calls
                        .iter_mut()
                        .find(|call| call.id == result.tool_use_id)
                });
                match call {
                    Some(call) => {
                        call.output = Some(result.content_text());
                        call.is_error = result.is_error;
                    }
                    None => {
                        tracing::debug!(tool_use_id = %result.tool_use_id, "tool result without matching tool use");
                    }
                }
            }
            StreamMessage::User(user) => {
                out.extend(current.take());
                out.push(ConversationMessage {
                    role: Role::User,
                    content: user.content.clone(),
                    tool_calls: Vec::new(),
                });
            }
            StreamMessage::System(_) | StreamMessage::Result(_) | StreamMessage::Error(_) => {}
        }
    }

    out.extend(current);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(lines: &[&str]) -> Vec<StreamMessage> {
        lines
            .iter()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_groups_assistant_turn_with_tools() {
        let messages = decode(&[
            r#"{"type":"system","subtype":"init"}"#,
            r#"{"type":"assistant","content":"Let me look. "}"#,
            r#"{"type":"tool_use","id":"t1","name":"Read","input":{"path":"a.rs"}}"#,
            r#"{"type":"tool_result","tool_use_id":"t1","content":"fn a() {}"}"#,
            r#"{"type":"assistant","content":"Looks fine."}"#,
            r#"{"type":"result","success":true}"#,
        ]);

        let conversation = reconstruct(&messages);
        assert_eq!(conversation.len(), 1);
        let turn = &conversation[0];
        assert_eq!(turn.role, Role::Assistant);
        assert_eq!(turn.content, "Let me look. Looks fine.");
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].name, "Read");
        assert_eq!(turn.tool_calls[0].output.as_deref(), Some("fn a() {}"));
        assert!(!turn.tool_calls[0].is_error);
    }

    #[test]
    fn test_user_message_closes_turn() {
        let messages = decode(&[
            r#"{"type":"assistant","content":"first"}"#,
            r#"{"type":"user","content":"follow up"}"#,
            r#"{"type":"assistant","content":"second"}"#,
        ]);

        let conversation = reconstruct(&messages);
        let roles: Vec<_> = conversation.iter().map(|m| m.role).collect();
        assert_eq!(roles, [Role::Assistant, Role::User, Role::Assistant]);
        assert_eq!(conversation[2].content, "second");
    }

    #[test]
    fn test_orphan_tool_result_is_ignored() {
        let messages = decode(&[
            r#"{"type":"tool_result","tool_use_id":"missing","content":"x","is_error":true}"#,
        ]);
        assert!(reconstruct(&messages).is_empty());
    }

    #[test]
    fn test_empty_log() {
        assert!(reconstruct(&[]).is_empty());
    }
}
