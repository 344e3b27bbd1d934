//! powercab-node - standalone station server
//!
//! Binds the cabinet TCP port and runs the protocol engine over in-memory
//! storage. Intended for bench work against real or simulated cabinets;
//! production deployments embed `powercab-core` behind their own storage.
//!
//! # Usage
//!
//! ```bash
//! # Listen on the default port with one provisioned station
//! powercab-node --provision STN001:5:station-secret
//!
//! # Custom bind address and stricter anti-abuse budget
//! powercab-node --bind 0.0.0.0:7100 --max-suspicious 3 \
//!     --provision STN001:5:station-secret
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use powercab_core::{Engine, EngineConfig, MemoryStorage, StationServer};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Power-bank cabinet station server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP listen address for station connections
    #[arg(short, long, default_value = "0.0.0.0:7020")]
    bind: SocketAddr,

    /// Suspicious-packet budget per connection
    #[arg(long, default_value = "5")]
    max_suspicious: u32,

    /// Heartbeat timeout in seconds before a connection is swept
    #[arg(long, default_value = "300")]
    heartbeat_timeout: u64,

    /// Deadline in seconds for a station's borrow result
    #[arg(long, default_value = "15")]
    borrow_timeout: u64,

    /// Provision a station as box_id:slots:secret (can be repeated)
    #[arg(long)]
    provision: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Print banner
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║             powercab-node - Cabinet Station Server           ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Bind:            {:<43} ║", args.bind);
    println!("║  Suspicious max:  {:<43} ║", args.max_suspicious);
    println!("║  Heartbeat (s):   {:<43} ║", args.heartbeat_timeout);
    println!("║  Provisioned:     {:<43} ║", args.provision.len());
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let storage = Arc::new(MemoryStorage::new());
    for entry in &args.provision {
        match parse_provision(entry) {
            Some((box_id, slots, secret)) => {
                let station = storage.provision_station(box_id, slots, secret.as_bytes(), None);
                info!(station_id = station.id, box_id, slots, "provisioned station");
            }
            None => {
                eprintln!("Invalid --provision entry (want box_id:slots:secret): {}", entry);
            }
        }
    }

    let config = EngineConfig::default()
        .with_bind_addr(args.bind)
        .with_max_suspicious(args.max_suspicious)
        .with_heartbeat_timeout(Duration::from_secs(args.heartbeat_timeout))
        .with_borrow_timeout(Duration::from_secs(args.borrow_timeout));

    info!("Starting station server...");
    let engine = Engine::new(config, storage);
    let server = StationServer::new(engine);
    server.run().await?;

    Ok(())
}

/// Split a `box_id:slots:secret` provisioning entry.
fn parse_provision(entry: &str) -> Option<(&str, u8, &str)> {
    let mut parts = entry.splitn(3, ':');
    let box_id = parts.next()?;
    let slots: u8 = parts.next()?.parse().ok()?;
    let secret = parts.next()?;
    if box_id.is_empty() || secret.is_empty() {
        return None;
    }
    Some((box_id, slots, secret))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_provision() {
        assert_eq!(
            parse_provision("STN001:5:secret-key"),
            Some(("STN001", 5, "secret-key"))
        );
        // secrets may contain colons
        assert_eq!(
            parse_provision("STN001:5:a:b:c"),
            Some(("STN001", 5, "a:b:c"))
        );
        assert!(parse_provision("STN001:5").is_none());
        assert!(parse_provision("STN001:many:key").is_none());
        assert!(parse_provision(":5:key").is_none());
    }
}
