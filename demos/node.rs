use std::sync::mpsc;

use clap::Parser;
use souk::{Config, Dht};
use tracing::Level;
use tracing_subscriber;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Port to listen on (defaults to 8889, falling back to a random port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bootstrap nodes as `ip:port`, repeatable
    #[arg(short, long)]
    bootstrap: Vec<String>,

    /// Path to persist routing table and records across restarts
    #[arg(short, long)]
    snapshot: Option<std::path::PathBuf>,
}

fn main() {
    tracing_subscriber::fmt().with_max_level(Level::DEBUG).init();

    let cli = Cli::parse();

    let dht = Dht::new(Config {
        port: cli.port,
        bootstrap: cli.bootstrap,
        snapshot_path: cli.snapshot,
        ..Default::default()
    })
    .expect("failed to bind UDP socket");

    println!("Node id: {:?}", dht.id().expect("node is running"));
    println!(
        "Listening on {}",
        dht.local_addr().expect("node is running")
    );

    println!("Bootstrapping ...");
    dht.bootstrapped().expect("node is running");
    println!(
        "Bootstrap complete, routing table has {} reachable nodes.",
        dht.to_bootstrap().expect("node is running").len()
    );

    println!("Press Ctrl+C to stop.");

    let (sender, receiver) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = sender.send(());
    })
    .expect("failed to set Ctrl+C handler");

    let _ = receiver.recv();

    println!("Shutting down ...");
    dht.shutdown();
}
