use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};

use foreman_protocol::stream::{
    ErrorMessage, ResultMessage, StreamMessage, ToolResultMessage, ToolUseMessage,
};

/// Names listeners subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParserEventKind {
    Message,
    Text,
    ToolUse,
    ToolResult,
    Result,
    Error,
    ParseError,
}

#[derive(Debug, Clone)]
pub enum ParserEvent {
    Message(StreamMessage),
    Text(String),
    ToolUse(ToolUseMessage),
    ToolResult(ToolResultMessage),
    Result(ResultMessage),
    Error(ErrorMessage),
    ParseError { error: String, raw_line: String },
}

impl ParserEvent {
    pub fn kind(&self) -> ParserEventKind {
        match self {
            ParserEvent::Message(_) => ParserEventKind::Message,
            ParserEvent::Text(_) => ParserEventKind::Text,
            ParserEvent::ToolUse(_) => ParserEventKind::ToolUse,
            ParserEvent::ToolResult(_) => ParserEventKind::ToolResult,
            ParserEvent::Result(_) => ParserEventKind::Result,
            ParserEvent::Error(_) => ParserEventKind::Error,
            ParserEvent::ParseError { .. } => ParserEventKind::ParseError,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Box<dyn Fn(&ParserEvent) + Send + Sync>;

struct ListenerEntry {
    id: ListenerId,
    once: bool,
    callback: Listener,
}

/// Decoder for the assistant's newline-delimited JSON stream.
///
/// Bytes arrive in arbitrary chunks; only complete lines are decoded, the
/// trailing partial line stays buffered until a later chunk completes it.
/// Malformed lines are reported through [`ParserEventKind::ParseError`] and
/// skipped.
#[derive(Default)]
pub struct StreamParser {
    buffer: String,
    messages: Vec<StreamMessage>,
    text: String,
    listeners: HashMap<ParserEventKind, Vec<ListenerEntry>>,
    next_listener: u64,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of stdout. Returns the messages completed by this chunk.
    pub fn parse(&mut self, chunk: &str) -> Vec<StreamMessage> {
        self.buffer.push_str(chunk);

        let Some(last_newline) = self.buffer.rfind('\n') else {
            return Vec::new();
        };
        let rest = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, rest);

        let mut decoded = Vec::new();
        for line in complete.split('\n') {
            if let Some(message) = self.parse_line(line) {
                decoded.push(message);
            }
        }
        decoded
    }

    /// Decode whatever is left in the buffer once the stream has ended.
    pub fn finish(&mut self) -> Option<StreamMessage> {
        let rest = std::mem::take(&mut self.buffer);
        self.parse_line(&rest)
    }

    fn parse_line(&mut self, line: &str) -> Option<StreamMessage> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        match serde_json::from_str::<StreamMessage>(line) {
            Ok(message) => {
                self.messages.push(message.clone());
                if let StreamMessage::Assistant(assistant) = &message {
                    self.text.push_str(&assistant.content);
                }
                self.emit(ParserEvent::Message(message.clone()));
                match &message {
                    StreamMessage::Assistant(assistant) => {
                        self.emit(ParserEvent::Text(assistant.content.clone()))
                    }
                    StreamMessage::ToolUse(tool_use) => {
                        self.emit(ParserEvent::ToolUse(tool_use.clone()))
                    }
                    StreamMessage::ToolResult(result) => {
                        self.emit(ParserEvent::ToolResult(result.clone()))
                    }
                    StreamMessage::Result(result) => self.emit(ParserEvent::Result(result.clone())),
                    StreamMessage::Error(error) => self.emit(ParserEvent::Error(error.clone())),
                    StreamMessage::System(_) | StreamMessage::User(_) => {}
                }
                Some(message)
            }
            Err(e) => {
                tracing::debug!(error = %e, line_len = line.len(), "failed to parse stream line");
                self.emit(ParserEvent::ParseError {
                    error: e.to_string(),
                    raw_line: line.to_string(),
                });
                None
            }
        }
    }

    /// Concatenated assistant text so far
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn messages(&self) -> Vec<StreamMessage> {
        self.messages.clone()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.messages.clear();
        self.text.clear();
    }

    pub fn on<F>(&mut self, kind: ParserEventKind, callback: F) -> ListenerId
    where
        F: Fn(&ParserEvent) + Send + Sync + 'static,
    {
        self.add_listener(kind, false, Box::new(callback))
    }

    /// Listener removed after its first delivery.
    pub fn once<F>(&mut self, kind: ParserEventKind, callback: F) -> ListenerId
    where
        F: Fn(&ParserEvent) + Send + Sync + 'static,
    {
        self.add_listener(kind, true, Box::new(callback))
    }

    pub fn off(&mut self, id: ListenerId) -> bool {
        let mut removed = false;
        for entries in self.listeners.values_mut() {
            let before = entries.len();
            entries.retain(|entry| entry.id != id);
            removed |= entries.len() != before;
        }
        removed
    }

    fn add_listener(&mut self, kind: ParserEventKind, once: bool, callback: Listener) -> ListenerId {
        self.next_listener += 1;
        let id = ListenerId(self.next_listener);
        self.listeners.entry(kind).or_default().push(ListenerEntry {
            id,
            once,
            callback,
        });
        id
    }

    fn emit(&mut self, event: ParserEvent) {
        let Some(entries) = self.listeners.get_mut(&event.kind()) else {
            return;
        };
        for entry in entries.iter() {
            if catch_unwind(AssertUnwindSafe(|| (entry.callback)(&event))).is_err() {
                tracing::error!(event = ?event.kind(), "stream parser listener panicked");
            }
        }
        entries.retain(|entry| !entry.once);
    }
}
