//! netBiDiB Handshake Processor
//!
//! Drives one pairing / logon handshake. Inbound messages advance the local
//! state and may emit outbound messages through the registered sender. The
//! processor never fails on protocol anomalies: unknown messages are logged
//! and dropped, a non-BiDiB peer moves the local state to `Disconnected`.
//!
//! ```text
//! Disconnected
//!   ↓ start()                         → protocol signature
//! SendSignature
//!   ↓ peer signature "BiDiB…"        → UID, PROD, USER, P_VERSION, ROLE
//! WaitForId
//!   ↓ peer DESCRIPTOR_UID
//!   ├─ trusted   → Paired             → STATUS_PAIRED
//!   └─ unknown   → Unpaired → RequestPairing
//!                                     → STATUS_UNPAIRED, PAIRING_REQUEST
//! Paired + remote Paired              → LOCAL_LOGON
//!   ↓ peer LOGON / LOGON_ACK
//! ConnectedControlling  (LOGOFF → ConnectedUncontrolled)
//! ```

use std::collections::HashSet;

use crate::message::{
    data_string, descriptor_string, InputMessage, LocalLinkMessage, LocalLinkType, OutputMessage,
    UniqueId,
};
use crate::participant::Participant;

/// Emitter prefix a peer must announce to be accepted
pub const BIDIB_SIGNATURE_PREFIX: &str = "BiDiB";

/// Protocol version announced by this side (wire order, minor first)
pub const PROTOCOL_VERSION: [u8; 2] = [0, 8];

/// Role announced by this side
pub const ROLE_CONTROLLER: u8 = 1;

/// netBiDiB connection state, used for both the local and the remote track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NetBidibState {
    #[default]
    Disconnected,
    SendSignature,
    WaitForId,
    WaitForStatus,
    Unpaired,
    RequestPairing,
    Paired,
    PairingRejected,
    ConnectedUncontrolled,
    ConnectedControlling,
}

impl NetBidibState {
    /// Logon completed, with or without control
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            Self::ConnectedControlling | Self::ConnectedUncontrolled
        )
    }
}

/// Interface-level connection state exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterfaceConnectionState {
    #[default]
    Disconnected,
    Unpaired,
    PartiallyConnected,
    FullyConnected,
}

/// Snapshot passed to state listeners after a change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub local: NetBidibState,
    pub remote: NetBidibState,

    /// Interface state derived from `local`
    pub interface: InterfaceConnectionState,
}

/// Callback receiving every outbound message
pub type MessageSender = Box<dyn Fn(&OutputMessage) + Send + Sync>;

/// Callback invoked synchronously after every state change
pub type StateListener = Box<dyn Fn(&StateChange) + Send + Sync>;

/// netBiDiB handshake state machine
pub struct MessageProcessor {
    /// Local emitter name
    emitter: String,

    /// Local user name
    username: String,

    /// Local unique id
    unique_id: UniqueId,

    /// Node address assigned by the peer's logon-ack
    address: Option<Vec<u8>>,

    /// Peer being paired with
    participant: Participant,

    /// Ids of already trusted participants
    known_participants: HashSet<UniqueId>,

    pairing_timeout: u8,
    local_state: NetBidibState,
    remote_state: NetBidibState,
    sender: Option<MessageSender>,
    listeners: Vec<StateListener>,
}

impl Default for MessageProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MessageProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageProcessor")
            .field("emitter", &self.emitter)
            .field("unique_id", &data_string(&self.unique_id))
            .field("local_state", &self.local_state)
            .field("remote_state", &self.remote_state)
            .field("participant", &self.participant)
            .finish()
    }
}

impl MessageProcessor {
    pub fn new() -> Self {
        Self {
            emitter: String::new(),
            username: default_username(),
            unique_id: [0; 7],
            address: None,
            participant: Participant::default(),
            known_participants: HashSet::new(),
            pairing_timeout: 0,
            local_state: NetBidibState::Disconnected,
            remote_state: NetBidibState::Disconnected,
            sender: None,
            listeners: Vec::new(),
        }
    }

    pub fn emitter(&self) -> &str {
        &self.emitter
    }

    pub fn set_emitter(&mut self, emitter: impl Into<String>) {
        self.emitter = emitter.into();
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn set_username(&mut self, username: impl Into<String>) {
        self.username = username.into();
    }

    pub fn unique_id(&self) -> UniqueId {
        self.unique_id
    }

    pub fn set_unique_id(&mut self, unique_id: UniqueId) {
        self.unique_id = unique_id;
    }

    /// Local node address once a logon-ack was received
    pub fn address(&self) -> Option<&[u8]> {
        self.address.as_deref()
    }

    pub fn current_participant(&self) -> &Participant {
        &self.participant
    }

    pub fn local_state(&self) -> NetBidibState {
        self.local_state
    }

    pub fn remote_state(&self) -> NetBidibState {
        self.remote_state
    }

    pub fn is_connected(&self) -> bool {
        self.local_state.is_connected()
    }

    /// Register the outbound message sink, replacing any previous one
    pub fn set_message_sender(&mut self, sender: MessageSender) {
        self.sender = Some(sender);
    }

    /// Register a state listener
    pub fn add_state_listener(&mut self, listener: StateListener) {
        self.listeners.push(listener);
    }

    /// Begin a handshake: remember the trusted ids and send our signature
    pub fn start(&mut self, trusted_participants: impl IntoIterator<Item = UniqueId>, timeout: u8) {
        self.known_participants = trusted_participants.into_iter().collect();
        self.pairing_timeout = timeout;
        self.set_local_state(NetBidibState::SendSignature);
        self.send(OutputMessage::ProtocolSignature {
            emitter: self.emitter.clone(),
        });
    }

    /// Feed one inbound message into the handshake
    pub fn process_message(&mut self, message: &InputMessage) {
        log::debug!("{:?}", message);

        match message {
            InputMessage::ProtocolSignature { emitter } => self.process_protocol_signature(emitter),
            InputMessage::LocalLink(link) => self.process_link_message(link),
            InputMessage::LocalLogon { uid } => {
                self.send(OutputMessage::LocalLogonAck {
                    node_address: 0,
                    uid: *uid,
                });
                self.set_local_state(NetBidibState::ConnectedControlling);
            }
            InputMessage::LocalLogoff { .. } => {
                self.set_local_state(NetBidibState::ConnectedUncontrolled);
            }
            InputMessage::LocalLogonAck { node_address, .. } => {
                self.address = Some(vec![*node_address]);
                self.set_local_state(NetBidibState::ConnectedControlling);
            }
            InputMessage::Unknown { message_type, .. } => {
                log::warn!(
                    "Received unknown message type '0x{:02X}' at this point",
                    message_type
                );
            }
        }
    }

    /// Accept the pairing by announcing `STATUS_PAIRED`
    pub fn request_control(&mut self) {
        self.send_pairing_status(LocalLinkType::StatusPaired);
    }

    /// Refuse control of the bus.
    pub fn reject_control(&mut self) {
        self.set_local_state(NetBidibState::WaitForStatus);
        self.send(OutputMessage::LocalLogonRejected {
            uid: self.unique_id,
        });
        // provisional until the peer answers the rejection
        self.set_local_state(NetBidibState::ConnectedUncontrolled);
    }

    /// Return to the initial state, dropping participant and trusted ids
    pub fn reset(&mut self) {
        self.participant = Participant::default();
        self.known_participants.clear();
        self.set_local_state(NetBidibState::Disconnected);
        self.set_remote_state(NetBidibState::Disconnected);
        self.address = None;
    }

    /// Map the local state onto the interface connection state
    pub fn interface_connection_state(&self) -> InterfaceConnectionState {
        match self.local_state {
            NetBidibState::RequestPairing | NetBidibState::Unpaired => {
                InterfaceConnectionState::Unpaired
            }
            NetBidibState::ConnectedControlling => InterfaceConnectionState::FullyConnected,
            NetBidibState::ConnectedUncontrolled => InterfaceConnectionState::PartiallyConnected,
            NetBidibState::Disconnected
            | NetBidibState::SendSignature
            | NetBidibState::WaitForId
            | NetBidibState::WaitForStatus
            | NetBidibState::Paired
            | NetBidibState::PairingRejected => InterfaceConnectionState::Disconnected,
        }
    }

    fn set_local_state(&mut self, state: NetBidibState) {
        if self.local_state == state {
            return;
        }
        self.local_state = state;
        self.notify_state_changed();
    }

    fn set_remote_state(&mut self, state: NetBidibState) {
        if self.remote_state == state {
            return;
        }
        self.remote_state = state;
        self.notify_state_changed();
    }

    fn notify_state_changed(&self) {
        log::debug!(
            "netBiDiB state local: {:?}, remote: {:?}",
            self.local_state,
            self.remote_state
        );
        let change = StateChange {
            local: self.local_state,
            remote: self.remote_state,
            interface: self.interface_connection_state(),
        };
        for listener in &self.listeners {
            listener(&change);
        }
    }

    fn send(&self, message: OutputMessage) {
        match &self.sender {
            Some(sender) => sender(&message),
            None => log::warn!("No message sender registered, dropping {:?}", message),
        }
    }

    fn is_known_participant(&self) -> bool {
        self.participant
            .id()
            .is_some_and(|id| self.known_participants.contains(&id))
    }

    fn process_protocol_signature(&mut self, emitter: &str) {
        if !emitter.starts_with(BIDIB_SIGNATURE_PREFIX) {
            log::info!("Peer signature '{}' is not a BiDiB emitter", emitter);
            self.set_local_state(NetBidibState::Disconnected);
            return;
        }

        self.participant.requestor_name = Some(emitter.to_string());
        self.set_local_state(NetBidibState::WaitForId);

        self.send(OutputMessage::link(
            LocalLinkType::DescriptorUid,
            self.unique_id.to_vec(),
        ));
        self.send(OutputMessage::link(
            LocalLinkType::DescriptorProdString,
            descriptor_string(&self.emitter),
        ));
        self.send(OutputMessage::link(
            LocalLinkType::DescriptorUserString,
            descriptor_string(&self.username),
        ));
        self.send(OutputMessage::link(
            LocalLinkType::DescriptorPVersion,
            PROTOCOL_VERSION.to_vec(),
        ));
        self.send(OutputMessage::link(
            LocalLinkType::DescriptorRole,
            vec![ROLE_CONTROLLER],
        ));
    }

    fn process_link_message(&mut self, link: &LocalLinkMessage) {
        match link.link_type {
            LocalLinkType::DescriptorUid => {
                match link.data.get(..7).and_then(|id| UniqueId::try_from(id).ok()) {
                    Some(id) => self.participant.set_id(id),
                    None => {
                        log::warn!("Ignoring short unique id {}", data_string(&link.data));
                        return;
                    }
                }

                if self.is_known_participant() {
                    self.send_pairing_status(LocalLinkType::StatusPaired);
                } else {
                    self.send_pairing_status(LocalLinkType::StatusUnpaired);
                    self.send_pairing_status(LocalLinkType::PairingRequest);
                }
            }
            LocalLinkType::DescriptorProdString => {
                self.participant.product_name = Some(link.string_value());
            }
            LocalLinkType::DescriptorPVersion => {
                self.participant.protocol_version = Some(format_protocol_version(&link.data));
            }
            LocalLinkType::DescriptorUserString => {
                self.participant.user_name = Some(link.string_value().trim().to_string());
            }
            LocalLinkType::PairingRequest => {
                self.set_remote_state(NetBidibState::RequestPairing);
                self.request_control();
            }
            LocalLinkType::StatusPaired => self.handle_remote_paired(),
            LocalLinkType::StatusUnpaired => self.handle_remote_unpaired(),
            other => {
                log::warn!(
                    "Received unknown local link type '{:?}' at this point",
                    other
                );
            }
        }
    }

    fn handle_remote_paired(&mut self) {
        if self.local_state == NetBidibState::WaitForStatus {
            self.set_local_state(NetBidibState::Paired);
        }

        if self.remote_state != NetBidibState::Disconnected
            && self.local_state == NetBidibState::RequestPairing
        {
            self.send_pairing_status(LocalLinkType::StatusPaired);
        }

        self.set_remote_state(NetBidibState::Paired);

        if self.remote_state == NetBidibState::Paired && self.local_state == NetBidibState::Paired {
            self.send(OutputMessage::LocalLogon {
                uid: self.unique_id,
            });
        }
    }

    fn handle_remote_unpaired(&mut self) {
        if (self.remote_state != NetBidibState::Disconnected
            && self.local_state == NetBidibState::RequestPairing)
            || self.remote_state == NetBidibState::RequestPairing
        {
            self.set_local_state(NetBidibState::PairingRejected);
        }

        if matches!(
            self.remote_state,
            NetBidibState::Disconnected | NetBidibState::Unpaired
        ) && self.local_state == NetBidibState::Paired
        {
            self.send_pairing_status(LocalLinkType::PairingRequest);
        }

        self.set_remote_state(NetBidibState::Unpaired);
    }

    /// Announce a pairing status; the only place status traffic changes the local state
    fn send_pairing_status(&mut self, status: LocalLinkType) {
        let mut parameters = self.unique_id.to_vec();
        parameters.extend_from_slice(&self.participant.id().unwrap_or_default());

        match status {
            LocalLinkType::PairingRequest => {
                self.set_local_state(NetBidibState::RequestPairing);
                parameters.push(self.pairing_timeout);
            }
            LocalLinkType::StatusPaired => self.set_local_state(NetBidibState::Paired),
            LocalLinkType::StatusUnpaired => self.set_local_state(NetBidibState::Unpaired),
            _ => {}
        }

        self.send(OutputMessage::link(status, parameters));
    }
}

/// Format a wire protocol version (minor first) as `major.minor`
pub fn format_protocol_version(data: &[u8]) -> String {
    data.iter()
        .rev()
        .map(u8::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

fn default_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default()
}
