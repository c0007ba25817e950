use anyhow::{Context, Result};
use clap::Args;
use std::os::unix::process::ExitStatusExt;
use std::process::Command;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::sandbox::{spawn_sandboxed, BootstrapSandbox};

#[derive(Args)]
pub struct RunArgs {
    /// Policy name from the config file
    #[arg(short, long)]
    pub policy: String,

    /// Command and arguments to run
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}

pub async fn run(args: RunArgs, config_path: Option<&str>) -> Result<()> {
    let config = Config::load_from(config_path)?;
    let policy_id = config.policy_id(&args.policy)?;
    let policies = config.sandbox_policies()?;

    let broker = BootstrapSandbox::create(config.broker_options()?, config.namespace()?)
        .context("Failed to start the sandbox broker")?;
    for (name, id, policy) in policies {
        debug!("Registering policy {} as {}", name, id);
        broker.register_sandbox_policy(id, policy);
    }

    let (program, rest) = args
        .command
        .split_first()
        .context("No command given")?;
    let mut cmd = Command::new(program);
    cmd.args(rest);

    let mut child = spawn_sandboxed(&broker, policy_id, cmd)
        .await
        .with_context(|| format!("Failed to launch {}", program))?;
    info!(
        "Running {} (pid {}) under policy {}",
        program,
        child.pid(),
        args.policy
    );

    let exited = tokio::select! {
        status = child.wait() => Some(status?),
        _ = tokio::signal::ctrl_c() => None,
    };
    let status = match exited {
        Some(status) => status,
        None => {
            warn!("Interrupted; terminating pid {}", child.pid());
            child.terminate()?;
            child.wait().await?
        }
    };
    drop(child);
    broker.shutdown();

    if let Some(code) = status.code() {
        if code != 0 {
            std::process::exit(code);
        }
    } else if let Some(signal) = status.signal() {
        warn!("{} killed by signal {}", program, signal);
        std::process::exit(128 + signal);
    }

    Ok(())
}
