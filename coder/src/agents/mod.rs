//! Model-facing agents: each renders a prompt, calls the model and turns the
//! reply into a typed value.

pub mod coder;
pub mod improver;
pub mod planner;
pub mod refiner;
