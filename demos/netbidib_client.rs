//! netBiDiB Client Example
//!
//! Connects to a netBiDiB participant (command station, interface or server),
//! runs the pairing handshake and keeps the session open until Ctrl+C.
//!
//! An unknown participant has to confirm the pairing request on its side
//! within the pairing timeout. After a successful pairing the participant is
//! stored and later connections take the trusted fast path.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example netbidib_client --features demos
//! ```
//!
//! Or with custom parameters:
//!
//! ```bash
//! NETBIDIB_HOST="192.168.0.42" \
//! NETBIDIB_PORT="62875" \
//! NETBIDIB_CLIENT_ID="0A0B" \
//! RUST_LOG=debug \
//! cargo run --example netbidib_client --features demos
//! ```
//!
//! A JSON configuration file may be given as the first argument instead:
//!
//! ```bash
//! cargo run --example netbidib_client --features demos -- netbidib.json
//! ```

use std::env;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use netbidib::receiver::ROOT_ADDRESS;
use netbidib::store::load_json;
use netbidib::{
    ConnectionControllerFactory, NetBidibConfig, NetBidibMessageReceiver, NodeTable, StateChange,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::init();

    println!("netBiDiB Client Example");
    println!("=======================\n");

    let config = load_config()?;

    println!("Configuration:");
    println!("  Application: {}", config.application_name);
    println!("  Endpoint: {}", config.endpoint());
    println!("  Instance id: {}", hex::encode_upper(config.instance_id()));
    println!("  Pairing timeout: {} s\n", config.pairing_timeout);

    let factory = ConnectionControllerFactory::tcp();

    let nodes = Arc::new(NodeTable::new());
    let root = nodes.insert(&ROOT_ADDRESS);
    factory
        .dispatcher()
        .add_receiver(Arc::new(NetBidibMessageReceiver::new(Arc::clone(&nodes))));

    let controller = factory.get_controller(Some(&config))?;
    controller.add_state_listener(Box::new(|change: &StateChange| {
        println!(
            "  state: {:?} (local {:?}, remote {:?})",
            change.interface, change.local, change.remote
        );
    }));

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    println!("Connecting to {}...", controller.connection_name());
    let state = controller.open_connection().await;

    if let Some(error) = &state.error {
        eprintln!("✗ Connection failed: {}", error);
        controller.close();
        return Ok(());
    }

    println!("✓ Connected: {:?}", state.interface_state);
    println!(
        "  Remote: {} ({})",
        state.remote_name.as_deref().unwrap_or("unknown"),
        state.remote_id_string().unwrap_or_default()
    );
    if state.has_guest_functions() {
        println!("  Remote offers guest functions");
    }
    println!("\nPress Ctrl+C to stop\n");

    let mut last = None;
    while running.load(Ordering::SeqCst) {
        let node = root.lock().map(|n| n.clone()).unwrap_or_default();
        if last.as_ref() != Some(&node) {
            println!("Root node: {:?} {}", node.state, node.state_info);
            last = Some(node);
        }

        if !controller.connection_state().is_connected() {
            println!("Connection lost");
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    println!("\nClosing connection...");
    controller.close();
    println!("Example completed");

    Ok(())
}

/// Read the configuration from a JSON file argument or the environment
fn load_config() -> Result<NetBidibConfig, Box<dyn std::error::Error>> {
    if let Some(path) = env::args().nth(1) {
        return load_json(Path::new(&path))?
            .ok_or_else(|| format!("configuration file {} not found", path).into());
    }

    let mut config = NetBidibConfig {
        application_name: "BiDiB-netbidib-rs".to_string(),
        ..Default::default()
    };
    if let Ok(host) = env::var("NETBIDIB_HOST") {
        config.host_address = host;
    }
    if let Ok(port) = env::var("NETBIDIB_PORT") {
        config.port_number = port.parse()?;
    }
    if let Ok(client_id) = env::var("NETBIDIB_CLIENT_ID") {
        config.client_id = client_id;
    }
    if let Ok(timeout) = env::var("NETBIDIB_PAIRING_TIMEOUT") {
        config.pairing_timeout = timeout.parse()?;
    }

    Ok(config)
}
