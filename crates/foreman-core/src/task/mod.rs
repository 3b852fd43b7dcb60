// Task Queue / Processor
//
// Tasks wait in a priority queue until the processor's polling loop picks
// them up and hands them to the registered handlers. The agent task handler
// is the handler that runs a task's assigned agent.

pub mod handler;
pub mod processor;
pub mod queue;

pub use handler::AgentTaskHandler;
pub use processor::{ProcessorConfig, TaskCancelled, TaskHandler, TaskProcessor};
pub use queue::TaskQueue;
