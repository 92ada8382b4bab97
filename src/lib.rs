//! WEP: worker execution process for orchestrator-pushed task streams.

pub mod builtin;
pub mod config;
pub mod error;
pub mod executor;
pub mod handler;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod spec;
pub mod validation;
