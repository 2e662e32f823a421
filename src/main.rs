//! tunnelkeeper: keep one SSH port forward alive.
//!
//! Usage:
//!   tunnelkeeper [settings.json]            run the tunnel until it stops
//!   tunnelkeeper --store-password <name>    store a password read from stdin

use anyhow::{Context, Result, bail};
use std::io::BufRead;
use std::path::PathBuf;
use tunnelkeeper::config::Settings;
use tunnelkeeper::logging;
use tunnelkeeper::ssh::{
    KeychainCredentials, TunnelEventKind, TunnelManager, TunnelState, handle_askpass_mode,
};

const STORE_PASSWORD_FLAG: &str = "--store-password";

fn main() -> Result<()> {
    // Must run before anything else: ssh re-executes us as its askpass helper
    handle_askpass_mode();

    logging::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some(STORE_PASSWORD_FLAG) => {
            let Some(name) = args.get(1) else {
                bail!("{} requires a credential name", STORE_PASSWORD_FLAG);
            };
            store_password(name)
        }
        Some(path) => smol::block_on(run(PathBuf::from(path))),
        None => smol::block_on(run(Settings::default_path()?)),
    }
}

fn store_password(name: &str) -> Result<()> {
    eprintln!("Enter password for '{}' followed by a newline:", name);

    let mut password = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut password)
        .context("Failed to read password from stdin")?;
    let password = password.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        bail!("Refusing to store an empty password");
    }

    KeychainCredentials::new()
        .store(name, password)
        .context("Failed to store password in keychain")?;
    tracing::info!("Stored password for '{}'", name);
    Ok(())
}

async fn run(path: PathBuf) -> Result<()> {
    let settings = Settings::load(&path).await?;
    tracing::info!("Loaded settings from {}", path.display());

    let manager = TunnelManager::new(
        settings.to_target(),
        settings.to_tunnel_config(),
        settings.to_transport(),
        KeychainCredentials::new(),
    )
    .context("Invalid tunnel settings")?;

    let events = manager.subscribe().await;
    manager
        .start()
        .await
        .with_context(|| format!("Failed to start tunnel '{}'", settings.name))?;

    if let Some(addr) = manager.local_addr().await {
        tracing::info!(
            "Forwarding {} -> {}:{} via {}",
            addr,
            settings.remote_host,
            settings.remote_port,
            manager.target().ssh_url()
        );
    }

    let outcome = async {
        while let Ok(event) = events.recv().await {
            match event.kind {
                TunnelEventKind::StateChanged {
                    to: TunnelState::Stopped,
                    ..
                } => bail!("Tunnel '{}' stopped", settings.name),
                TunnelEventKind::MaxRetriesExceeded { attempts } => {
                    tracing::error!("Gave up after {} reconnect attempts", attempts);
                }
                _ => {}
            }
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    manager.shutdown().await;
    outcome
}
