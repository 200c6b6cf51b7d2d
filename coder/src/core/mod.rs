//! Deterministic, pure logic shared by the agent.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod graph;
pub mod imports;
pub mod language;
pub mod path;
pub mod plan;
pub mod quality;
pub mod reply;
pub mod state;
pub mod step;
pub mod summary;
pub mod task_id;
pub mod types;
