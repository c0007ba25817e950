use anyhow::Result;
use clap::{Args, Subcommand};

use crate::config::{Config, DEFAULT_CONFIG_TEMPLATE};

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show {
        /// Output format: toml (default) or json
        #[arg(short, long, default_value = "toml")]
        format: String,
    },

    /// Get a configuration value
    Get {
        /// Config key (e.g., broker.reply_timeout_ms, policies.renderer.default)
        key: String,
    },

    /// Set a configuration value in the default config file
    Set {
        /// Config key (e.g., policies.renderer.rules.fonts)
        key: String,

        /// Value to set
        value: String,
    },

    /// Validate broker settings and every policy
    Check,

    /// Show config file path
    Path,

    /// Initialize default config file
    Init {
        /// Overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

pub async fn run(args: ConfigArgs, config_path: Option<&str>) -> Result<()> {
    match args.command {
        ConfigCommands::Show { format } => show_config(config_path, &format),
        ConfigCommands::Get { key } => get_config(config_path, &key),
        ConfigCommands::Set { key, value } => set_config(&key, &value),
        ConfigCommands::Check => check_config(config_path),
        ConfigCommands::Path => show_path(config_path),
        ConfigCommands::Init { force } => init_config(force),
    }
}

fn show_config(config_path: Option<&str>, format: &str) -> Result<()> {
    let config = Config::load_from(config_path)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&config)?),
        "toml" => println!("{}", toml::to_string_pretty(&config)?),
        other => anyhow::bail!("Unknown format: {} (expected toml or json)", other),
    }

    Ok(())
}

fn get_config(config_path: Option<&str>, key: &str) -> Result<()> {
    let config = Config::load_from(config_path)?;
    println!("{}", config.get_value(key)?);
    Ok(())
}

fn set_config(key: &str, value: &str) -> Result<()> {
    let mut config = Config::load()?;
    config.set_value(key, value)?;
    config.save()?;
    println!("Set {} = {}", key, value);
    Ok(())
}

fn check_config(config_path: Option<&str>) -> Result<()> {
    let config = Config::load_from(config_path)?;
    config.broker_options()?;
    let namespace = config.namespace()?;
    let policies = config.sandbox_policies()?;

    let check_in = crate::sandbox::broker_service_name(&config.broker.bundle_id, std::process::id());
    namespace.address_for(&check_in)?;

    println!(
        "OK: {} polic{}, namespace {}",
        policies.len(),
        if policies.len() == 1 { "y" } else { "ies" },
        namespace
            .dir()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| "(abstract)".to_string())
    );
    Ok(())
}

fn show_path(config_path: Option<&str>) -> Result<()> {
    match config_path {
        Some(path) => println!("{}", path),
        None => println!("{}", Config::config_path()?.display()),
    }
    Ok(())
}

fn init_config(force: bool) -> Result<()> {
    let path = Config::config_path()?;

    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists at {}. Use --force to overwrite.",
            path.display()
        );
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;

    println!("Created config file at {}", path.display());
    Ok(())
}
