// src/shutdown/mod.rs
mod coordinator;

pub use coordinator::{Completion, CompletionSender, ShutdownCoordinator, ShutdownError};
