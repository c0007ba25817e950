use anyhow::Result;
use clap::Parser;

use bootstrap_sandbox::cli::{self, Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    // Logs go to stderr; stdout belongs to subcommand output.
    let log_level = if cli.verbose { "debug" } else { "info" };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr);
    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let config = cli.config.as_deref();
    match cli.command {
        Commands::Run(args) => cli::run::run(args, config).await,
        Commands::Lookup(args) => cli::lookup::run(args).await,
        Commands::Serve(args) => cli::serve::run(args, config).await,
        Commands::Policy(args) => cli::policy::run(args, config).await,
        Commands::Config(args) => cli::config::run(args, config).await,
        Commands::Paths => cli::paths::run(config),
    }
}
