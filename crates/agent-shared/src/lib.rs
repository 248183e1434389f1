//! # Agent Shared Types
//!
//! Common building blocks used by every crate in the node-agent workspace:
//!
//! - **Errors**: the [`AgentError`] enum and [`AgentResult`] alias
//! - **Configuration**: agent and sdc config structs with layered loading
//! - **Logging**: one-shot tracing initialization
//! - **Wire protocol**: the parent/worker message types exchanged over the
//!   child process channel, plus the task request envelope
//! - **Backoff**: jittered exponential retry delays for the controller link
//! - **Samples**: the status snapshot published by the sampler

pub mod backoff;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod sample;

pub use error::{AgentError, AgentResult};
