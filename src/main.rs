//! Parlor — ephemeral group voice chat server
//!
//! WebSocket signaling, WebRTC audio forwarding, end-to-end-encrypted text
//! relay. All state is in-memory; nothing survives a restart.

mod config;
mod net;

use crate::config::Config;
use crate::net::hub::Hub;
use crate::net::media::MediaApi;
use crate::net::rate_limit::ConnectionAdmission;
use crate::net::types::GC_INTERVAL_SECS;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "parlor", version, about = "Parlor: ephemeral group voice chat server")]
struct Args {
    /// Listen port (overrides the PORT environment variable)
    #[arg(short, long)]
    port: Option<u16>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("parlor=info".parse().expect("static directive")),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::from_env();
    if let Some(port) = args.port {
        config.port = port;
    }
    if args.print_config {
        println!("{config:#?}");
        return;
    }

    info!("════════════════════════════════════════════════════════════");
    info!("  Parlor v{VERSION} — ephemeral voice chat");
    info!("════════════════════════════════════════════════════════════");
    info!(
        "Port: {} | rooms: {} | users/room: {} | UDP: {}-{}",
        config.port, config.max_rooms, config.max_users_per_room, config.udp_min, config.udp_max
    );

    let public_ip = config.resolve_public_ip().await;
    if let Some(ip) = public_ip {
        info!("Public address: {}", ip);
    }
    let media = match MediaApi::new(config.udp_min, config.udp_max, public_ip) {
        Ok(media) => media,
        Err(e) => {
            error!("Failed to initialize media API: {}", e);
            return;
        }
    };

    let recheck_secs = config.public_ip_recheck_secs;
    let hub = Hub::new(config.clone(), media);
    let admission = Arc::new(ConnectionAdmission::new());

    // Periodic garbage collection plus the admission sweep.
    {
        let hub = Arc::clone(&hub);
        let admission = Arc::clone(&admission);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(GC_INTERVAL_SECS));
            loop {
                interval.tick().await;
                hub.run_gc().await;
                admission.sweep();
            }
        });
    }

    // Status printer
    {
        let hub = Arc::clone(&hub);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));
            loop {
                interval.tick().await;
                let (rooms, sessions) = hub.stats().await;
                info!("Status: {} rooms | {} sessions", rooms, sessions);
            }
        });
    }

    // Re-resolve the public address and rebuild live connections on change.
    if recheck_secs > 0 {
        let hub = Arc::clone(&hub);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(recheck_secs));
            interval.tick().await;
            loop {
                interval.tick().await;
                let resolved = hub.config.resolve_public_ip().await;
                if resolved != hub.media.public_ip() {
                    info!("Public address changed to {:?}; rebuilding", resolved);
                    if let Err(e) = hub.media.rebuild(resolved).await {
                        warn!("Media API rebuild failed: {}", e);
                        continue;
                    }
                    hub.rebuild_all_media().await;
                }
            }
        });
    }

    let listener = match TcpListener::bind(("0.0.0.0", hub.config.port)).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind port {}: {}", hub.config.port, e);
            return;
        }
    };
    info!("Listening on 0.0.0.0:{}", hub.config.port);

    let accept_hub = Arc::clone(&hub);
    let accept_admission = Arc::clone(&admission);
    let accept = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let hub = Arc::clone(&accept_hub);
                    let admission = Arc::clone(&accept_admission);
                    tokio::spawn(async move {
                        net::conn::handle_connection(hub, admission, stream, addr).await;
                    });
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                }
            }
        }
    });

    // Wait for shutdown
    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down...");
    accept.abort();
}
