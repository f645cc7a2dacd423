//! Basalt - a single-node relational database server
//!
//! SQL arrives over a length-prefixed JSON socket protocol, is planned into
//! a small algebra tree, and executes under one of three pluggable
//! concurrency-control protocols with write-ahead logging and redo-only
//! crash recovery.
//!
//! Architecture overview:
//!
//! ```text
//! clients ── length-prefixed JSON frames ──┐
//!                                          ▼
//!                              connection handlers ──► retry dispatcher
//!                                          │                 ▲ (wait events)
//!                                          ▼                 │
//!                                   query processor ── concurrency manager
//!                                          │
//!                                 planner / executor
//!                                     │         │
//!                                     ▼         ▼
//!                                  storage ─── WAL
//! ```

use std::path::PathBuf;

use log::info;

use basalt::{Config, Server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Parse command line arguments (simple)
    let args: Vec<String> = std::env::args().collect();

    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    let port: u16 = args[i + 1].parse()?;
                    config.bind_addr = format!("127.0.0.1:{}", port).parse()?;
                    i += 1;
                }
            }
            "--data-dir" | "-d" => {
                if i + 1 < args.len() {
                    config.data_dir = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--protocol" | "-c" => {
                if i + 1 < args.len() {
                    config.protocol = args[i + 1].parse()?;
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Basalt - a single-node relational database server");
                println!();
                println!("Usage: basalt [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -p, --port PORT        Port to listen on (default: 5432)");
                println!("  -d, --data-dir DIR     Data directory (default: ./data)");
                println!("  -c, --protocol PROTO   Concurrency protocol: lock | timestamp | validation");
                println!("                         (default: lock)");
                println!("  -h, --help             Show this help");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    info!("starting basalt server...");

    let server = Server::new(config)?;
    server.run().await?;

    Ok(())
}
