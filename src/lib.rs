//! Terminal coding assistant engine.
//!
//! A model reply is scanned for closed tags, each tag becomes a [`command::Command`],
//! the batch goes through the approval gate and is executed against the file tree or a
//! shell. Observations are fed back until the model answers in prose.

pub mod agent;
pub mod command;
pub mod config;
pub mod error;
pub mod tools;
pub mod utils;
