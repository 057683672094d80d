//! netBiDiB Implementation
//!
//! Pairing, logon and session handshake for BiDiB (model railway control
//! bus) connections over TCP.
//!
//! netBiDiB establishes a trusted connection between a controlling host and
//! a remote participant with:
//! - Protocol signature exchange to confirm both sides speak BiDiB
//! - Identity exchange through local link descriptors
//! - Pairing negotiation, remembered across sessions in a pairing store
//! - Logon and control handover
//!
//! # Architecture
//!
//! - **[`MessageProcessor`]** is the handshake state machine. It tracks a
//!   local and a remote state and answers inbound messages synchronously.
//! - **[`NetBidibController`]** owns the transport, splits inbound bytes into
//!   frames, drives `open_connection` to completion or timeout and exposes
//!   the connection status.
//! - **[`PairingStore`]** persists trusted participants as JSON.
//! - **[`MessageDispatcher`]** routes post-logon traffic to
//!   [`MessageReceiver`]s such as [`NetBidibMessageReceiver`].
//! - **[`ConnectionControllerFactory`]** wires all of the above together.
//!
//! # Usage
//!
//! ```rust,ignore
//! use netbidib::{ConnectionControllerFactory, NetBidibConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NetBidibConfig {
//!         application_name: "BiDiB-Monitor".to_string(),
//!         host_address: "192.168.0.42".to_string(),
//!         ..Default::default()
//!     };
//!
//!     let factory = ConnectionControllerFactory::tcp();
//!     let controller = factory.get_controller(Some(&config))?;
//!
//!     let state = controller.open_connection().await;
//!     match state.error {
//!         Some(error) => println!("not connected: {}", error),
//!         None => println!("{:?}", state.interface_state),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Handshake
//!
//! 1. **Signature**: both sides send a protocol signature starting with `BiDiB`
//! 2. **Descriptors**: unique id, product name, user name, protocol version, role
//! 3. **Pairing**: `STATUS_PAIRED` for trusted peers, otherwise
//!    `STATUS_UNPAIRED` followed by a `PAIRING_REQUEST`
//! 4. **Logon**: once both sides report paired, logon and logon-ack hand
//!    over control
//!
//! # Frame Format
//!
//! ```text
//! +--------+------------------+--------+--------+-------------+
//! | LENGTH | Address stack, 0 | MSGNUM | TYPE   | Data        |
//! +--------+------------------+--------+--------+-------------+
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod factory;
pub mod message;
pub mod participant;
pub mod processor;
pub mod receiver;
pub mod store;
pub mod transport;

pub use config::{NetBidibConfig, DEFAULT_INSTANCE_ID, DEFAULT_PAIRING_TIMEOUT, DEFAULT_PORT};
pub use controller::{ConnectionFailure, ConnectionStateInfo, NetBidibController};
pub use error::{NetBidibError, Result};
pub use factory::ConnectionControllerFactory;
pub use message::{InputMessage, LocalLinkType, OutputMessage, UniqueId};
pub use participant::Participant;
pub use processor::{InterfaceConnectionState, MessageProcessor, NetBidibState, StateChange};
pub use receiver::{
    MessageDispatcher, MessageReceiver, NetBidibMessageReceiver, Node, NodeRegistry, NodeState,
    NodeTable,
};
pub use store::PairingStore;
pub use transport::{TcpTransport, Transport};
