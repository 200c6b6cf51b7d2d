//! Plan–execute–refine coding assistant.
//!
//! A task description is turned into a plan by a language model, the plan's
//! steps are executed one at a time with the user confirming anything that
//! writes files or runs commands, and a failed step can trigger a refined plan.
//! Progress is persisted after every step so an interrupted task can resume.
//!
//! - **[`core`]**: Pure, deterministic logic (step and plan models, execution
//!   state, dependency graph, path sandboxing). No I/O.
//! - **[`io`]**: Side-effecting collaborators behind traits (model, file system,
//!   shell, context store, parser, console). Swappable for fakes in tests.
//! - **[`agents`]**: Prompt in, typed value out, one module per model role.
//!
//! [`step`] executes a single step and [`orchestrator`] drives a whole task.

pub mod agents;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod services;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
