//! netBiDiB byte transport
//!
//! The controller only needs an ordered byte stream to the peer. [`Transport`]
//! is that seam; [`TcpTransport`] is the TCP implementation used in practice.
//!
//! Received chunks are handed to the registered [`ReceiveHandler`] as they
//! arrive. A chunk may hold several frames or end in a partial one; splitting
//! is left to the receiver. A connection ended by the peer is reported to the
//! [`CloseHandler`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::NetBidibConfig;
use crate::error::{NetBidibError, Result};
use crate::message::data_string;

/// Default TCP connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Size of the socket read buffer
pub const READ_BUFFER_SIZE: usize = 8192;

/// Callback receiving raw inbound chunks
pub type ReceiveHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Callback invoked when the peer ends the connection
pub type CloseHandler = Arc<dyn Fn() + Send + Sync>;

/// Ordered byte stream to a netBiDiB peer
#[async_trait]
pub trait Transport: Send + Sync {
    /// Take the endpoint and other settings from `config`
    fn initialize(&self, config: &NetBidibConfig);

    /// Establish the connection
    async fn open(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Queue `data` for transmission
    fn send(&self, data: &[u8]) -> Result<()>;

    /// Drop the connection; a no-op when already closed
    fn close(&self);

    /// Human readable endpoint, `host:port` for TCP
    fn name(&self) -> String;

    /// Register the receiver of inbound chunks, replacing any previous one
    fn set_receive_handler(&self, handler: ReceiveHandler);

    /// Register the callback for a connection lost on the peer side
    fn set_close_handler(&self, _handler: CloseHandler) {}
}

struct Connection {
    writer: mpsc::UnboundedSender<Bytes>,
    reader_task: JoinHandle<()>,
    connected: Arc<AtomicBool>,
}

/// netBiDiB over TCP
pub struct TcpTransport {
    endpoint: Mutex<String>,
    connect_timeout: Duration,
    connection: Mutex<Option<Connection>>,
    handler: Arc<Mutex<Option<ReceiveHandler>>>,
    close_handler: Arc<Mutex<Option<CloseHandler>>>,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::with_connect_timeout(DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        Self {
            endpoint: Mutex::new(NetBidibConfig::default().endpoint()),
            connect_timeout,
            connection: Mutex::new(None),
            handler: Arc::new(Mutex::new(None)),
            close_handler: Arc::new(Mutex::new(None)),
        }
    }

    fn connection(&self) -> MutexGuard<'_, Option<Connection>> {
        self.connection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn configure_socket(stream: &TcpStream) -> Result<()> {
        stream.set_nodelay(true)?;
        socket2::SockRef::from(stream).set_keepalive(true)?;
        Ok(())
    }

    async fn read_loop(
        mut reader: OwnedReadHalf,
        handler: Arc<Mutex<Option<ReceiveHandler>>>,
        close_handler: Arc<Mutex<Option<CloseHandler>>>,
        connected: Arc<AtomicBool>,
        endpoint: String,
    ) {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    log::info!("netBiDiB connection to {} closed by peer", endpoint);
                    break;
                }
                Ok(n) => {
                    log::trace!("<< {}", data_string(&buf[..n]));
                    let current = handler
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .clone();
                    match current {
                        Some(handler) => handler(&buf[..n]),
                        None => log::warn!("No receive handler, dropping {} bytes", n),
                    }
                }
                Err(e) => {
                    log::warn!("netBiDiB read from {} failed: {}", endpoint, e);
                    break;
                }
            }
        }
        connected.store(false, Ordering::SeqCst);

        let on_close = close_handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(on_close) = on_close {
            on_close();
        }
    }

    async fn write_loop(
        mut writer: OwnedWriteHalf,
        mut rx: mpsc::UnboundedReceiver<Bytes>,
        connected: Arc<AtomicBool>,
    ) {
        while let Some(data) = rx.recv().await {
            log::trace!(">> {}", data_string(&data));
            if let Err(e) = writer.write_all(&data).await {
                log::warn!("netBiDiB write failed: {}", e);
                connected.store(false, Ordering::SeqCst);
                break;
            }
        }
        let _ = writer.shutdown().await;
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn initialize(&self, config: &NetBidibConfig) {
        *self
            .endpoint
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = config.endpoint();
    }

    async fn open(&self) -> Result<()> {
        self.close();

        let endpoint = self.name();
        log::info!("Opening netBiDiB connection to {}", endpoint);

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&endpoint))
            .await
            .map_err(|_| NetBidibError::Connection(format!("connect to {} timed out", endpoint)))?
            .map_err(|e| NetBidibError::Connection(format!("connect to {} failed: {}", endpoint, e)))?;
        Self::configure_socket(&stream)?;

        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));

        tokio::spawn(Self::write_loop(writer, rx, Arc::clone(&connected)));
        let reader_task = tokio::spawn(Self::read_loop(
            reader,
            Arc::clone(&self.handler),
            Arc::clone(&self.close_handler),
            Arc::clone(&connected),
            endpoint,
        ));

        *self.connection() = Some(Connection {
            writer: tx,
            reader_task,
            connected,
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection()
            .as_ref()
            .is_some_and(|c| c.connected.load(Ordering::SeqCst))
    }

    fn send(&self, data: &[u8]) -> Result<()> {
        let connection = self.connection();
        let connection = connection
            .as_ref()
            .filter(|c| c.connected.load(Ordering::SeqCst))
            .ok_or(NetBidibError::NotConnected)?;
        connection
            .writer
            .send(Bytes::copy_from_slice(data))
            .map_err(|_| NetBidibError::NotConnected)
    }

    fn close(&self) {
        if let Some(connection) = self.connection().take() {
            log::info!("Closing netBiDiB connection to {}", self.name());
            connection.connected.store(false, Ordering::SeqCst);
            connection.reader_task.abort();
        }
    }

    fn name(&self) -> String {
        self.endpoint
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_receive_handler(&self, handler: ReceiveHandler) {
        *self
            .handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handler);
    }

    fn set_close_handler(&self, handler: CloseHandler) {
        *self
            .close_handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handler);
    }
}
