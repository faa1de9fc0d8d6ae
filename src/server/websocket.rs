//! WebSocket server implementation
//!
//! Accepts TCP connections, pumps bytes between each socket and its
//! [`Connection`], and drives periodic application ticks.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info};

use super::{Connection, Severity, Transport};
use crate::app::Registry;
use crate::config::ServerConfig;

/// Size of the per-connection read buffer
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Outgoing messages queued per socket before the peer counts as stalled
const OUTBOUND_QUEUE_LEN: usize = 256;

/// Instruction for the task owning a socket
#[derive(Debug)]
enum Outbound {
    Data(Vec<u8>),
    Close,
}

/// Transport that queues writes for the socket task
///
/// A write fails once the socket task has gone away or when the peer has
/// fallen `capacity` messages behind.
struct ChannelTransport {
    tx: mpsc::Sender<Outbound>,
}

impl ChannelTransport {
    fn new(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl Transport for ChannelTransport {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.tx
            .try_send(Outbound::Data(bytes.to_vec()))
            .map_err(|e| match e {
                TrySendError::Full(_) => {
                    io::Error::new(io::ErrorKind::WouldBlock, "outbound queue is full")
                }
                TrySendError::Closed(_) => {
                    io::Error::new(io::ErrorKind::BrokenPipe, "socket task has exited")
                }
            })
    }

    // A full queue drops the close message; the sender is dropped right after,
    // which ends the socket task once the queue drains.
    fn close(&mut self) {
        let _ = self.tx.try_send(Outbound::Close);
    }
}

/// WebSocket server
pub struct WebSocketServer {
    config: ServerConfig,
    registry: Arc<Registry>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    /// Create a new WebSocket server
    pub fn new(config: ServerConfig, registry: Arc<Registry>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            registry,
            shutdown_tx,
        }
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("WebSocket server listening on ws://{}", addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        self.spawn_ticker();

        loop {
            tokio::select! {
                // Accept new connections
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let registry = Arc::clone(&self.registry);
                            let shutdown_rx = self.shutdown_tx.subscribe();
                            let max_message_size = self.config.max_message_size;

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, registry, max_message_size, shutdown_rx).await {
                                    error!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                // Handle shutdown signal
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Tick every application at the configured interval until shutdown
    fn spawn_ticker(&self) {
        let registry = Arc::clone(&self.registry);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let period = self.config.tick_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => registry.tick_all(),
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("Ticker stopped");
        });
    }
}

/// Pump a single socket until its connection closes
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    registry: Arc<Registry>,
    max_message_size: usize,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let (transport, mut rx) = ChannelTransport::new(OUTBOUND_QUEUE_LEN);
    let connection = Connection::new(
        Box::new(transport),
        Some(peer_addr),
        registry,
        max_message_size,
    );
    let (mut reader, mut writer) = stream.split();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        tokio::select! {
            // Flush queued writes before reading more
            biased;

            outbound = rx.recv() => {
                match outbound {
                    Some(Outbound::Data(bytes)) => {
                        if let Err(e) = writer.write_all(&bytes).await {
                            connection.log(Severity::Warn, &format!("Socket write failed: {}", e));
                            connection.on_disconnect();
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = writer.shutdown().await;
                        break;
                    }
                }
            }
            read = reader.read(&mut buf) => {
                match read {
                    Ok(0) => connection.on_disconnect(),
                    Ok(n) => connection.on_data(&buf[..n]),
                    Err(e) => {
                        connection.log(Severity::Debug, &format!("Socket read failed: {}", e));
                        connection.on_disconnect();
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                connection.on_disconnect();
            }
        }
    }

    debug!("Connection from {} closed", peer_addr);
    Ok(())
}
