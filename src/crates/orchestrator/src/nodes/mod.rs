//! The four node kinds (C8) driving the graph runtime: each is a pure
//! transform over a [`crate::model::Session`], with side effects scoped to
//! the checkpoint store, provider router, and tool bridge.

pub mod decider;
pub mod executor;
pub mod planner;
pub mod reporter;

pub use decider::{Decider, Decision};
pub use executor::Executor;
pub use planner::Planner;
pub use reporter::{Reporter, SessionReport};
