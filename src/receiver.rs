//! Post-logon message handling
//!
//! Once the handshake is complete the controller hands raw traffic to a
//! [`MessageDispatcher`], which splits and decodes it and fans each message
//! out to the registered [`MessageReceiver`]s.
//!
//! [`NetBidibMessageReceiver`] keeps the root node's availability in sync
//! with the in-band local link notifications of the peer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::message::{data_string, FrameBuffer, InputMessage, LocalLinkType};

/// Address of the interface node
pub const ROOT_ADDRESS: [u8; 1] = [0];

/// Availability of a BiDiB node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeState {
    /// Nothing reported yet
    #[default]
    Unknown,

    /// Logged on and controlled by this host
    Ok,

    /// Free to be controlled
    Available,

    /// Controlled by another host
    Unavailable,
}

/// A BiDiB node as seen by the receiver
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    pub address: Vec<u8>,
    pub state: NodeState,

    /// Human readable detail for `state`
    pub state_info: String,
}

/// Lookup of nodes by address
pub trait NodeRegistry: Send + Sync {
    fn node(&self, address: &[u8]) -> Option<Arc<Mutex<Node>>>;
}

/// In-memory node registry
#[derive(Debug, Default)]
pub struct NodeTable {
    nodes: Mutex<HashMap<Vec<u8>, Arc<Mutex<Node>>>>,
}

impl NodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn nodes(&self) -> MutexGuard<'_, HashMap<Vec<u8>, Arc<Mutex<Node>>>> {
        self.nodes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Get or create the node at `address`
    pub fn insert(&self, address: &[u8]) -> Arc<Mutex<Node>> {
        Arc::clone(self.nodes().entry(address.to_vec()).or_insert_with(|| {
            Arc::new(Mutex::new(Node {
                address: address.to_vec(),
                ..Default::default()
            }))
        }))
    }
}

impl NodeRegistry for NodeTable {
    fn node(&self, address: &[u8]) -> Option<Arc<Mutex<Node>>> {
        self.nodes().get(address).cloned()
    }
}

/// Consumer of decoded post-logon messages
pub trait MessageReceiver: Send + Sync {
    fn process_message(&self, message: &InputMessage);
}

/// Tracks root node availability from local link notifications
pub struct NetBidibMessageReceiver<R: NodeRegistry> {
    registry: Arc<R>,
}

impl<R: NodeRegistry> NetBidibMessageReceiver<R> {
    pub fn new(registry: Arc<R>) -> Self {
        Self { registry }
    }

    fn set_state_on_root(&self, state: NodeState, data: &str) {
        let Some(root) = self.registry.node(&ROOT_ADDRESS) else {
            return;
        };
        let mut root = root.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        root.state = state;
        root.state_info = match state {
            NodeState::Available => "Node is available for control".to_string(),
            NodeState::Unavailable => format!("Node is controlled by {}", data),
            NodeState::Ok | NodeState::Unknown => data.to_string(),
        };
        log::debug!("Root node {:?}: {}", root.state, root.state_info);
    }
}

impl<R: NodeRegistry> MessageReceiver for NetBidibMessageReceiver<R> {
    fn process_message(&self, message: &InputMessage) {
        match message {
            InputMessage::LocalLogon { .. } => self.set_state_on_root(NodeState::Ok, ""),
            InputMessage::LocalLogoff { .. } => self.set_state_on_root(NodeState::Available, ""),
            InputMessage::LocalLink(link) => match link.link_type {
                LocalLinkType::NodeUnavailable => {
                    self.set_state_on_root(NodeState::Unavailable, &link.string_value())
                }
                LocalLinkType::NodeAvailable => self.set_state_on_root(NodeState::Available, ""),
                _ => {}
            },
            _ => {}
        }
    }
}

/// Splits post-logon traffic and hands every message to the receivers
#[derive(Default)]
pub struct MessageDispatcher {
    receivers: Mutex<Vec<Arc<dyn MessageReceiver>>>,
    frames: Mutex<FrameBuffer>,
}

impl MessageDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_receiver(&self, receiver: Arc<dyn MessageReceiver>) {
        self.receivers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(receiver);
    }

    /// Decode `data` and deliver each message in arrival order.
    ///
    /// A frame cut off at the end of `data` is completed by the next call.
    pub fn dispatch(&self, data: &[u8]) {
        let receivers = self
            .receivers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let frames = self
            .frames
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(data);

        for frame in frames {
            match InputMessage::decode(&frame) {
                Ok(message) => {
                    log::debug!("<< {:?} {}", message, data_string(&frame));
                    for receiver in &receivers {
                        receiver.process_message(&message);
                    }
                }
                Err(e) => log::warn!("Dropping frame {}: {}", data_string(&frame), e),
            }
        }
    }
}
