//! # rivet-core
//!
//! Core types for the rivet reactor engine. This crate is platform-agnostic
//! and contains no OS-specific code; the completion backends and resource
//! wrappers live in `rivet-reactor`, the task scheduler in `rivet-exec`.
//!
//! ## Modules
//!
//! - `id` - context and operation identifier types
//! - `event` - boolean readiness primitive with observer list
//! - `op_state` - operation state machine (transition + action tables)
//! - `error` - error types and errno handling
//! - `token_bucket` - standalone rate limiter
//! - `rlog` - kernel-style debug printing macros
//! - `env` - environment variable utilities

#![allow(dead_code)]

pub mod env;
pub mod error;
pub mod event;
pub mod id;
pub mod op_state;
pub mod rlog;
pub mod token_bucket;

// Re-exports for convenience
pub use env::{env_get, env_get_bool};
pub use error::{Errno, RivetError, RivetResult};
pub use event::{Event, EventObserver, EventSignal};
pub use id::{CtxId, OpId};
pub use op_state::{OpAction, OpEvent, OpState, OpStateMachine};
pub use token_bucket::TokenBucket;
