//! netBiDiB Connection Controller
//!
//! Owns the transport for one netBiDiB connection and drives the handshake
//! processor to a connected state. Inbound bytes are split into frames and
//! fed to the processor until logon completes; afterwards they are passed
//! through untouched to the received data handler.
//!
//! `open_connection` is the only suspension point. It polls the processor
//! every [`POLL_INTERVAL`] until a connected state is reached or the
//! deadline passes. The deadline starts at [`CONNECT_TIMEOUT`], is re-armed
//! with the configured pairing timeout once a pairing request is out, and
//! collapses to "now" when the pairing is rejected.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::config::{NetBidibConfig, DEFAULT_INSTANCE_ID};
use crate::error::{NetBidibError, Result};
use crate::message::{data_string, FrameBuffer, InputMessage, OutputMessage, UniqueId};
use crate::processor::{
    InterfaceConnectionState, MessageProcessor, NetBidibState, StateChange, StateListener,
};
use crate::store::PairingStore;
use crate::transport::{ReceiveHandler, Transport};

/// Overall bound for reaching a connected state
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(6);

/// Interval between handshake state checks
pub const POLL_INTERVAL: Duration = Duration::from_millis(300);

/// Why a connection attempt did not complete
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionFailure {
    #[error("pairing rejected by remote")]
    PairingRejected,

    #[error("pairing process aborted")]
    PairingAborted,

    #[error("connection process timed out")]
    TimedOut,

    /// The base transport could not be opened
    #[error("{0}")]
    Transport(String),
}

/// Externally visible state of a netBiDiB connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStateInfo {
    pub interface_state: InterfaceConnectionState,
    pub local_state: NetBidibState,
    pub remote_state: NetBidibState,
    pub remote_id: Option<UniqueId>,
    pub remote_name: Option<String>,

    /// Connection name of the controller
    pub remote_address: String,

    /// Node address assigned by the peer
    pub local_address: Option<Vec<u8>>,
    pub error: Option<ConnectionFailure>,

    /// Pairing timeout in seconds
    pub timeout: u8,
}

impl ConnectionStateInfo {
    pub fn remote_id_string(&self) -> Option<String> {
        self.remote_id.as_ref().map(|id| data_string(id))
    }

    /// Peer id has the guest function class bit set
    pub fn has_guest_functions(&self) -> bool {
        self.remote_id.is_some_and(|id| id[0] & 0x20 == 0x20)
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.interface_state,
            InterfaceConnectionState::FullyConnected | InterfaceConnectionState::PartiallyConnected
        )
    }
}

/// Deadline and listeners shared with the processor's state callback
struct HandshakeTimer {
    deadline: Mutex<Instant>,
    pairing_timeout: AtomicU8,
    listeners: Mutex<Vec<StateListener>>,
}

impl HandshakeTimer {
    fn new() -> Self {
        Self {
            deadline: Mutex::new(Instant::now()),
            pairing_timeout: AtomicU8::new(0),
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn set_deadline(&self, deadline: Instant) {
        *self
            .deadline
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = deadline;
    }

    fn is_timed_out(&self) -> bool {
        Instant::now()
            >= *self
                .deadline
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pairing_timeout(&self) -> u8 {
        self.pairing_timeout.load(Ordering::SeqCst)
    }

    fn on_state_changed(&self, change: &StateChange) {
        for listener in self
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
        {
            listener(change);
        }

        match change.local {
            NetBidibState::RequestPairing => {
                let timeout = self.pairing_timeout();
                log::debug!(
                    "State changed to request pairing, extending timeout by {}",
                    timeout
                );
                self.set_deadline(Instant::now() + Duration::from_secs(u64::from(timeout)));
            }
            NetBidibState::PairingRejected => {
                log::debug!("Pairing was rejected, stopping timeout");
                self.set_deadline(Instant::now());
            }
            _ => {}
        }
    }
}

/// netBiDiB connection controller
pub struct NetBidibController<T: Transport> {
    transport: Arc<T>,
    processor: Mutex<MessageProcessor>,
    store: Arc<Mutex<PairingStore>>,
    timer: Arc<HandshakeTimer>,
    instance_id: Mutex<UniqueId>,
    data_handler: Mutex<Option<ReceiveHandler>>,

    /// Partial handshake frame carried over to the next chunk
    frames: Mutex<FrameBuffer>,
}

impl<T: Transport + 'static> NetBidibController<T> {
    /// Create a controller sending through `transport` and trusting the
    /// participants in `store`
    pub fn new(transport: Arc<T>, store: Arc<Mutex<PairingStore>>) -> Self {
        let timer = Arc::new(HandshakeTimer::new());
        let mut processor = MessageProcessor::new();

        let sender = Arc::clone(&transport);
        processor.set_message_sender(Box::new(move |message: &OutputMessage| {
            let bytes = message.encode();
            log::debug!(">> {:?} {}", message, data_string(&bytes));
            if let Err(e) = sender.send(&bytes) {
                log::warn!("Could not send {:?}: {}", message, e);
            }
        }));

        let state_timer = Arc::clone(&timer);
        processor.add_state_listener(Box::new(move |change: &StateChange| {
            state_timer.on_state_changed(change)
        }));

        Self {
            transport,
            processor: Mutex::new(processor),
            store,
            timer,
            instance_id: Mutex::new(DEFAULT_INSTANCE_ID),
            data_handler: Mutex::new(None),
            frames: Mutex::new(FrameBuffer::new()),
        }
    }
}

impl<T: Transport> NetBidibController<T> {
    fn processor(&self) -> MutexGuard<'_, MessageProcessor> {
        self.processor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn frames(&self) -> MutexGuard<'_, FrameBuffer> {
        self.frames
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn store(&self) -> MutexGuard<'_, PairingStore> {
        self.store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_processor_connected(&self) -> bool {
        self.processor().is_connected()
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Apply `config`: transport endpoint, pairing timeout, instance id and
    /// the identity announced during the handshake
    pub fn initialize(&self, config: Option<&NetBidibConfig>) -> Result<()> {
        let config = config.ok_or(NetBidibError::InvalidArgument("config"))?;

        if !self.transport.is_connected() {
            self.transport.initialize(config);
        }

        self.timer
            .pairing_timeout
            .store(config.pairing_timeout, Ordering::SeqCst);

        let instance_id = config.instance_id();
        *self
            .instance_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = instance_id;

        let mut processor = self.processor();
        processor.set_emitter(config.application_name.clone());
        processor.set_unique_id(instance_id);
        if !config.username.is_empty() {
            processor.set_username(config.username.clone());
        }
        Ok(())
    }

    /// Register a listener for handshake state changes.
    ///
    /// Listeners run synchronously while a message is being processed and
    /// must not call back into the controller; the [`StateChange`] carries
    /// the interface state for that purpose.
    pub fn add_state_listener(&self, listener: StateListener) {
        self.timer
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }

    /// Receiver of post-handshake traffic
    pub fn set_received_data_handler(&self, handler: ReceiveHandler) {
        *self
            .data_handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handler);
    }

    /// Open the transport if needed and run the handshake until it connects,
    /// fails or times out
    pub async fn open_connection(&self) -> ConnectionStateInfo {
        if self.is_processor_connected() {
            // handshake completed in the background since the last attempt
            return self.process_current_state(false);
        }

        if !self.transport.is_connected() {
            if let Err(e) = self.transport.open().await {
                log::warn!("Could not open {}: {}", self.connection_name(), e);
                return self.state_info(Some(ConnectionFailure::Transport(e.to_string())));
            }
        }

        self.timer.set_deadline(Instant::now() + CONNECT_TIMEOUT);
        self.frames().clear();
        let trusted_ids = self.store().trusted_ids();
        let pairing_timeout = self.timer.pairing_timeout();
        self.processor().start(trusted_ids, pairing_timeout);

        while !self.is_processor_connected() && !self.timer.is_timed_out() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        self.process_current_state(self.timer.is_timed_out())
    }

    fn process_current_state(&self, timed_out: bool) -> ConnectionStateInfo {
        let error = self.classify(timed_out);

        let participant = {
            let mut processor = self.processor();
            if processor.is_connected() {
                Some(processor.current_participant().clone())
            } else {
                processor.reset();
                None
            }
        };

        if let Some(participant) = participant {
            log::info!("netBiDiB connected to {}", participant);
            self.store().add_or_update(participant);
        }

        self.state_info(error)
    }

    /// First matching failure wins
    fn classify(&self, timed_out: bool) -> Option<ConnectionFailure> {
        let (local, remote, connected) = {
            let processor = self.processor();
            (
                processor.local_state(),
                processor.remote_state(),
                processor.is_connected(),
            )
        };

        if local == NetBidibState::PairingRejected {
            return Some(ConnectionFailure::PairingRejected);
        }

        if (timed_out && local == NetBidibState::RequestPairing)
            || remote == NetBidibState::RequestPairing
        {
            return Some(ConnectionFailure::PairingAborted);
        }

        if !connected && timed_out {
            self.close();
            return Some(ConnectionFailure::TimedOut);
        }

        None
    }

    /// Feed `size` bytes of `message` into the connection.
    ///
    /// Handshake frames may span several calls. Once connected, buffered
    /// bytes are forwarded ahead of `message`.
    pub fn process_message(&self, message: &[u8], size: usize) {
        let message = &message[..size.min(message.len())];

        if self.is_processor_connected() {
            let pending = self.frames().take();
            let handler = self
                .data_handler
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone();
            match handler {
                Some(handler) if pending.is_empty() => handler(message),
                Some(handler) => handler(&[&pending[..], message].concat()),
                None => log::debug!("No data handler, dropping {}", data_string(message)),
            }
            return;
        }

        let frames = self.frames().push(message);
        for frame in frames {
            match InputMessage::decode(&frame) {
                Ok(input) => {
                    log::debug!("<< {:?} {}", input, data_string(&frame));
                    self.processor().process_message(&input);
                }
                Err(e) => log::warn!("Dropping frame {}: {}", data_string(&frame), e),
            }
        }
    }

    /// Close the transport and end any running attempt
    pub fn close(&self) {
        self.transport.close();
        self.timer.set_deadline(Instant::now());
        self.frames().clear();

        let mut processor = self.processor();
        if processor.is_connected() {
            processor.reset();
        }
    }

    pub fn request_control(&self) {
        self.processor().request_control();
    }

    pub fn reject_control(&self) {
        self.processor().reject_control();
    }

    pub fn instance_id(&self) -> UniqueId {
        *self
            .instance_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// `netBiDiB {instance id} -> {transport}`
    pub fn connection_name(&self) -> String {
        format!(
            "netBiDiB {} -> {}",
            hex::encode_upper(self.instance_id()),
            self.transport.name()
        )
    }

    pub fn connection_state(&self) -> ConnectionStateInfo {
        self.state_info(None)
    }

    fn state_info(&self, error: Option<ConnectionFailure>) -> ConnectionStateInfo {
        let remote_address = self.connection_name();
        let processor = self.processor();
        let participant = processor.current_participant();

        ConnectionStateInfo {
            interface_state: processor.interface_connection_state(),
            local_state: processor.local_state(),
            remote_state: processor.remote_state(),
            remote_id: participant.id(),
            remote_name: participant.product_name.clone(),
            remote_address,
            local_address: processor.address().map(<[u8]>::to_vec),
            error,
            timeout: self.timer.pairing_timeout(),
        }
    }
}
