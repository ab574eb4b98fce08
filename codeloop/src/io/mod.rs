//! Side-effecting collaborators: processes, files, and the generation service.

pub mod attempt_log;
pub mod capability;
pub mod config;
pub mod generator;
pub mod process;
pub mod prompt;
pub mod sandbox;
