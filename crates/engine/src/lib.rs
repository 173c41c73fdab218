// workbench-engine: command log, undo/redo and history retention for workflows.

pub mod clock;
pub mod commands;
pub mod config;
pub mod error;
pub mod graph;
pub mod notify;
pub mod orchestrator;
pub mod reaper;
pub mod store;

pub use commands::{Command, CommandRegistry};
pub use error::{CommandError, EngineError, ErrorCode, StoreError, ValidationError};
pub use orchestrator::{CommitEvent, HistoryAction, Orchestrator};
pub use store::Store;
