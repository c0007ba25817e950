//! bootstrap-sandbox: launch child processes whose service lookups go through
//! a policy-enforcing broker.
//!
//! This crate provides:
//! - The broker and its check-in protocol (`sandbox::broker`)
//! - The async-signal-safe launch hook (`sandbox::pre_exec`)
//! - The interception server that answers sandboxed lookups (`sandbox::server`)
//! - The client a sandboxed process uses to look services up (`sandbox::client`)

pub mod cli;
pub mod config;
pub mod paths;
pub mod sandbox;

pub use config::Config;
