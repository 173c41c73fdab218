// workbench-common: shared types and utilities for the workbench workspace

pub mod command;
pub mod module;
pub mod protocol;
pub mod slug;
pub mod types;
