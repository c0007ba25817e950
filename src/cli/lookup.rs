//! CLI subcommand: `bootstrap-sandbox lookup`
//!
//! Runs inside a sandboxed process. Looks each service up through the
//! replacement bootstrap port and prints what came back.

use anyhow::Result;
use clap::Args;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::sandbox::BootstrapClient;

#[derive(Args)]
pub struct LookupArgs {
    /// Service names to look up
    #[arg(required = true)]
    pub services: Vec<String>,

    /// How long to wait for a greeting line on a granted port
    #[arg(long, default_value = "1000")]
    pub timeout_ms: u64,
}

pub async fn run(args: LookupArgs) -> Result<()> {
    let mut client = BootstrapClient::from_env()?;

    for service in &args.services {
        let name = service.clone();
        let (returned, result) = tokio::task::spawn_blocking(move || {
            let result = client.look_up(&name);
            (client, result)
        })
        .await?;
        client = returned;

        let port = match result {
            Ok(port) => port,
            Err(e) => {
                println!("{}: denied: {}", service, e);
                continue;
            }
        };

        let stream = std::os::unix::net::UnixStream::from(port);
        stream.set_nonblocking(true)?;
        let stream = tokio::net::UnixStream::from_std(stream)?;
        let mut lines = BufReader::new(stream).lines();

        match tokio::time::timeout(Duration::from_millis(args.timeout_ms), lines.next_line()).await
        {
            Ok(Ok(Some(line))) => println!("{}: granted: {}", service, line),
            Ok(Ok(None)) => println!("{}: granted (port closed)", service),
            Ok(Err(e)) => println!("{}: granted (read failed: {})", service, e),
            Err(_) => println!("{}: granted (no greeting)", service),
        }
    }

    Ok(())
}
