use anyhow::Result;
use clap::{Args, Subcommand};

use crate::config::Config;

#[derive(Args)]
pub struct PolicyArgs {
    #[command(subcommand)]
    pub command: PolicyCommands,
}

#[derive(Subcommand)]
pub enum PolicyCommands {
    /// List configured policies and their rules
    List,

    /// Show the rule a policy applies to a service
    Check {
        /// Policy name
        policy: String,

        /// Service name
        service: String,
    },
}

pub async fn run(args: PolicyArgs, config_path: Option<&str>) -> Result<()> {
    let config = Config::load_from(config_path)?;
    let policies = config.sandbox_policies()?;

    match args.command {
        PolicyCommands::List => {
            if policies.is_empty() {
                println!("No policies configured.");
            }
            for (name, id, policy) in &policies {
                println!("{} (id {}): default {}", name, id, policy.default_rule());
                for (service, rule) in policy.rules() {
                    println!("  {:<40} {}", service, rule);
                }
            }
        }
        PolicyCommands::Check { policy, service } => {
            let Some((_, _, found)) = policies.iter().find(|(name, _, _)| *name == policy) else {
                anyhow::bail!("Unknown policy: {}", policy);
            };
            println!("{}", found.rule_for(&service));
        }
    }

    Ok(())
}
