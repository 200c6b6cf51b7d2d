//! Side-effecting collaborators used by the step executor and orchestrator.
//!
//! Each collaborator sits behind a trait so tests can substitute recording or
//! scripted fakes (see `test_support`).

pub mod artifacts;
pub mod config;
pub mod console;
pub mod fs;
pub mod model;
pub mod parser;
pub mod process;
pub mod prompt;
pub mod shell;
pub mod state_store;
pub mod store;
