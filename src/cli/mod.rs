pub mod config;
pub mod lookup;
pub mod paths;
pub mod policy;
pub mod run;
pub mod serve;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "bootstrap-sandbox")]
#[command(author, version, about = "Launch processes behind a filtered bootstrap namespace")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Path to config file
    #[arg(short, long, global = true, env = "BOOTSTRAP_SANDBOX_CONFIG")]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a command under a sandbox policy
    Run(run::RunArgs),

    /// Look up services through the sandbox (inside a sandboxed process)
    Lookup(lookup::LookupArgs),

    /// Register a service that greets every connection
    Serve(serve::ServeArgs),

    /// Inspect configured policies
    Policy(policy::PolicyArgs),

    /// Configuration management
    Config(config::ConfigArgs),

    /// Show resolved XDG directory paths
    Paths,
}
