//! Bootstrap-namespace sandboxing for child processes.
//!
//! A broker in the parent issues a one-time token per launch. The child's
//! pre-exec hook presents that token on the broker's check-in port and gets
//! back a replacement bootstrap port: a private channel to the interception
//! server, which answers every later service lookup according to the policy
//! the token was issued for.
//!
//! Transport: the bootstrap namespace is a directory of Unix stream sockets
//! (or the Linux abstract namespace), ports are descriptors passed with
//! `SCM_RIGHTS`, and the sender's pid comes from the kernel's peer
//! credentials.

pub mod broker;
pub mod client;
pub mod launcher;
pub mod namespace;
pub mod policy;
pub mod pre_exec;
pub mod server;
pub mod wire;

pub use broker::{BootstrapSandbox, BrokerError, BrokerOptions, CheckInError, ClientRegistry};
pub use client::{BootstrapClient, LookUpError};
pub use launcher::{spawn_sandboxed, SandboxedChild};
pub use namespace::{broker_service_name, Namespace, NamespaceError, ServiceAddress};
pub use policy::{build_policy, PolicyError, PolicyId, Rule, SandboxPolicy};
pub use pre_exec::{HandshakeError, LookupStrategy, PreExecDelegate, BOOTSTRAP_FD_ENV};
pub use server::{InterceptionServer, LaunchdInterceptionServer, PolicyResolver};
