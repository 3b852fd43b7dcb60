//! Foreman: runs assistant-backed agents in response to events.
//!
//! Events published on the [`event_bus`] are matched against agent
//! triggers, turned into [`task`]s and executed by spawning the assistant
//! program through the [`process`] controller.

pub mod agent;
pub mod assistant;
pub mod cancellation;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod pattern;
pub mod process;
pub mod runtime;
pub mod stream;
pub mod task;

pub use error::{ErrorKind, ForemanError, Result};
pub use runtime::Foreman;
