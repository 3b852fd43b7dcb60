// Stream Parser
//
// Decodes the assistant program's line-delimited JSON output into typed
// messages and fans them out to listeners.

pub mod parser;

pub use parser::{ListenerId, ParserEvent, ParserEventKind, StreamParser};
