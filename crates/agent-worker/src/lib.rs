//! # Worker Runtime
//!
//! The child side of the task execution core. The runner spawns one
//! `agent-worker` process per task; this crate is that process. It speaks
//! the line-delimited JSON protocol from `agent_shared::protocol` on
//! stdin/stdout, resolves the task named by its positional argument against
//! the compiled-in registry, and drives it through the
//! [`context::TaskContext`] surface.

pub mod context;
pub mod runtime;
pub mod tasks;
