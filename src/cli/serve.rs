use anyhow::Result;
use clap::Args;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::config::Config;

#[derive(Args)]
pub struct ServeArgs {
    /// Service name to register
    pub service: String,

    /// Line sent to every client (default: "hello from <service>")
    #[arg(short, long)]
    pub message: Option<String>,
}

pub async fn run(args: ServeArgs, config_path: Option<&str>) -> Result<()> {
    let config = Config::load_from(config_path)?;
    let namespace = config.namespace()?;

    let (listener, _registration) = namespace.register(&args.service)?;
    listener.set_nonblocking(true)?;
    let listener = tokio::net::UnixListener::from_std(listener)?;

    let line = format!(
        "{}\n",
        args.message
            .unwrap_or_else(|| format!("hello from {}", args.service))
    );
    info!(
        "Serving {} at {}",
        args.service,
        namespace.address_for(&args.service)?
    );

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (mut stream, _) = accepted?;
                let line = line.clone();
                tokio::spawn(async move {
                    if let Err(e) = stream.write_all(line.as_bytes()).await {
                        debug!("Greeting failed: {}", e);
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Unregistering {}", args.service);
    Ok(())
}
