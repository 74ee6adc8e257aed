//! Core orchestration logic: variables, graph, planning, execution, state.

pub mod codegen;
pub mod environment;
pub mod error;
pub mod executor;
pub mod planner;
pub mod policy;
pub mod resolver;
pub mod retry;
pub mod secret;
pub mod state;
pub mod types;
pub mod variables;
