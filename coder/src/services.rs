//! Collaborators shared by every task in the process.

use std::sync::Arc;

use crate::io::console::Console;
use crate::io::fs::FileSystem;
use crate::io::model::ModelClient;
use crate::io::parser::StructuralParser;
use crate::io::shell::CommandRunner;
use crate::io::state_store::ExecutionStateStore;

/// Handles to the side-effecting collaborators. Cloning shares them.
///
/// `model` should already be wrapped in a [`crate::io::model::LimitedModel`]
/// when tasks run concurrently.
#[derive(Clone)]
pub struct Services {
    pub model: Arc<dyn ModelClient>,
    pub fs: Arc<dyn FileSystem>,
    pub commands: Arc<dyn CommandRunner>,
    pub parser: Arc<dyn StructuralParser>,
    pub console: Arc<dyn Console>,
    pub states: ExecutionStateStore,
}
