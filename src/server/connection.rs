//! WebSocket connection
//!
//! Per-socket state machine: drives the handshake, then decodes incoming
//! frames and dispatches messages to the bound application. Outgoing messages
//! are framed for the negotiated protocol variant and written to the transport.
//!
//! `AwaitingHandshake -> Open -> Closed`; `Closed` is terminal.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::{Application, Registry};
use crate::protocol::{
    frame, legacy, negotiate, Negotiation, ProtocolVariant, Upgrade, FLASH_POLICY,
};

/// Shared handle to a connection, as seen by applications
pub type ConnectionRef = Arc<Connection>;

/// Byte sink owned by a connection
///
/// `close` is called exactly once, when the connection reaches `Closed`.
pub trait Transport: Send {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn close(&mut self);
}

/// Errors returned by [`Connection::send`]
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Connection is not open")]
    NotOpen,

    #[error("Write failed: {0}")]
    WriteFailed(#[from] io::Error),
}

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingHandshake,
    Open,
    Closed,
}

/// Log severity for [`Connection::log`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

/// Message extracted from the reassembly buffer
type Decoded = Result<Option<Vec<u8>>, String>;

struct Inner {
    state: ConnectionState,
    variant: Option<ProtocolVariant>,
    transport: Option<Box<dyn Transport>>,
    application: Option<Arc<dyn Application>>,
    /// Set once `on_connect` has been delivered
    connected: bool,
    /// Bytes received but not yet decoded into a whole frame
    buffer: Vec<u8>,
    /// Leading bytes of `buffer` already searched for a legacy frame end
    scanned: usize,
}

impl Inner {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self.transport.as_mut() {
            Some(transport) => transport.write(bytes),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "transport already released",
            )),
        }
    }

    /// Mark closed and release the transport
    fn close(&mut self) {
        self.state = ConnectionState::Closed;
        self.release();
    }

    fn release(&mut self) {
        self.buffer = Vec::new();
        self.scanned = 0;
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
    }

    fn next_message(&mut self, max_message_size: usize) -> Decoded {
        let decoded = match self.variant {
            Some(ProtocolVariant::Hybi10) => match frame::decode(&self.buffer, max_message_size) {
                Ok(Some((decoded, consumed))) => {
                    if !decoded.masked {
                        debug!("Accepting unmasked frame from client");
                    }
                    if decoded.opcode != frame::TEXT_FINAL {
                        debug!("Treating frame with header {:#04x} as text", decoded.opcode);
                    }
                    Ok(Some((decoded.payload, consumed)))
                }
                Ok(None) => Ok(None),
                Err(e) => Err(e.to_string()),
            },
            Some(ProtocolVariant::Legacy76) => {
                legacy::decode_next_from(&self.buffer, self.scanned).map_err(|e| e.to_string())
            }
            None => return Err("no protocol variant negotiated".to_string()),
        }?;

        match decoded {
            Some((message, consumed)) => {
                self.buffer.drain(..consumed);
                self.scanned = 0;
                Ok(Some(message))
            }
            None if self.buffer.len() > max_message_size + frame::MAX_HEADER_LEN => Err(format!(
                "{} buffered bytes without a complete frame",
                self.buffer.len()
            )),
            None => {
                self.scanned = self.buffer.len();
                Ok(None)
            }
        }
    }
}

/// A single client connection
pub struct Connection {
    id: Uuid,
    peer: Option<SocketAddr>,
    registry: Arc<Registry>,
    max_message_size: usize,
    inner: Mutex<Inner>,
}

impl Connection {
    /// Create a connection for a freshly accepted socket
    pub fn new(
        transport: Box<dyn Transport>,
        peer: Option<SocketAddr>,
        registry: Arc<Registry>,
        max_message_size: usize,
    ) -> ConnectionRef {
        let connection = Arc::new(Self {
            id: Uuid::new_v4(),
            peer,
            registry,
            max_message_size,
            inner: Mutex::new(Inner {
                state: ConnectionState::AwaitingHandshake,
                variant: None,
                transport: Some(transport),
                application: None,
                connected: false,
                buffer: Vec::new(),
                scanned: 0,
            }),
        });
        connection.log(Severity::Info, "Connected");
        connection
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Negotiated protocol variant, once the handshake has completed
    #[allow(dead_code)]
    pub fn variant(&self) -> Option<ProtocolVariant> {
        self.inner.lock().variant
    }

    #[allow(dead_code)]
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Feed bytes read from the socket
    pub fn on_data(self: &Arc<Self>, data: &[u8]) {
        match self.state() {
            ConnectionState::AwaitingHandshake => self.handshake(data),
            ConnectionState::Open => self.handle(data),
            ConnectionState::Closed => {
                self.log(Severity::Debug, "Ignoring data on closed connection");
            }
        }
    }

    /// Frame and write a message to the client
    ///
    /// A failed write takes the same path as a socket close: the application
    /// gets `on_disconnect` and the connection is closed.
    pub fn send(self: &Arc<Self>, message: &[u8]) -> Result<(), ConnectionError> {
        let result = {
            let mut inner = self.inner.lock();
            let encoded = match (inner.state, inner.variant) {
                (ConnectionState::Open, Some(ProtocolVariant::Hybi10)) => frame::encode(message),
                (ConnectionState::Open, Some(ProtocolVariant::Legacy76)) => {
                    legacy::encode(message)
                }
                _ => return Err(ConnectionError::NotOpen),
            };
            inner.write(&encoded)
        };

        if let Err(e) = result {
            self.log(Severity::Warn, &format!("Write failed: {}", e));
            self.on_disconnect();
            return Err(ConnectionError::WriteFailed(e));
        }
        Ok(())
    }

    /// Socket closed or errored; also used for protocol violations
    ///
    /// Idempotent. The application sees `on_disconnect` only if it saw
    /// `on_connect`.
    pub fn on_disconnect(self: &Arc<Self>) {
        let application = {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Closed {
                return;
            }
            inner.state = ConnectionState::Closed;
            if inner.connected {
                inner.application.clone()
            } else {
                None
            }
        };

        self.log(Severity::Info, "Disconnected");
        if let Some(application) = application {
            application.on_disconnect(self);
        }

        self.inner.lock().release();
    }

    /// Log a message tagged with the peer address
    pub fn log(&self, severity: Severity, message: &str) {
        let peer = self
            .peer
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        match severity {
            Severity::Debug => debug!("[client {}] {}", peer, message),
            Severity::Info => info!("[client {}] {}", peer, message),
            Severity::Warn => warn!("[client {}] {}", peer, message),
            Severity::Error => error!("[client {}] {}", peer, message),
        }
    }

    fn handshake(self: &Arc<Self>, data: &[u8]) {
        self.log(Severity::Debug, "Performing handshake");

        match negotiate(data, |name| self.registry.get(name)) {
            Ok(Negotiation::PolicyFile) => {
                self.log(Severity::Info, "Flash policy file request");
                let mut inner = self.inner.lock();
                if let Err(e) = inner.write(FLASH_POLICY.as_bytes()) {
                    self.log(Severity::Warn, &format!("Failed to write policy file: {}", e));
                }
                inner.close();
            }
            Ok(Negotiation::Upgrade(upgrade)) => self.upgrade(upgrade),
            Err(e) => {
                self.log(Severity::Warn, &format!("Handshake failed: {}", e));
                self.inner.lock().close();
            }
        }
    }

    fn upgrade(self: &Arc<Self>, upgrade: Upgrade<Arc<dyn Application>>) {
        {
            let mut inner = self.inner.lock();
            if let Err(e) = inner.write(&upgrade.response) {
                self.log(Severity::Error, &format!("Failed to write handshake: {}", e));
                inner.close();
                return;
            }
            inner.state = ConnectionState::Open;
            inner.variant = Some(upgrade.variant);
            inner.application = Some(Arc::clone(&upgrade.application));
            inner.connected = true;
        }

        self.log(
            Severity::Info,
            &format!("Handshake sent ({} {})", upgrade.variant, upgrade.path),
        );
        upgrade.application.on_connect(self);

        if !upgrade.trailing.is_empty() {
            self.handle(&upgrade.trailing);
        }
    }

    fn handle(self: &Arc<Self>, data: &[u8]) {
        let application = {
            let mut inner = self.inner.lock();
            if inner.state != ConnectionState::Open {
                return;
            }
            inner.buffer.extend_from_slice(data);
            match inner.application.clone() {
                Some(application) => application,
                None => return,
            }
        };

        loop {
            // The lock is released before dispatch so the application can
            // call back into `send` on this connection
            let next = {
                let mut inner = self.inner.lock();
                if inner.state != ConnectionState::Open {
                    return;
                }
                inner.next_message(self.max_message_size)
            };

            match next {
                Ok(Some(message)) => application.on_data(&message, self),
                Ok(None) => break,
                Err(reason) => {
                    self.log(
                        Severity::Warn,
                        &format!("Data incorrectly framed ({}). Dropping connection", reason),
                    );
                    self.on_disconnect();
                    return;
                }
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::Broadcaster;
    use crate::server::testing::{
        connect, hybi_handshake, legacy_handshake, open_hybi, registry_with, Event, RecordingApp,
        LIMIT,
    };

    fn recording_registry() -> (Arc<RecordingApp>, Arc<Registry>) {
        let app = Arc::new(RecordingApp::default());
        let registry = registry_with("echo", app.clone());
        (app, registry)
    }

    #[test]
    fn test_hybi10_handshake_opens_connection() {
        let (app, registry) = recording_registry();
        let (connection, socket) = connect(&registry);
        assert_eq!(connection.state(), ConnectionState::AwaitingHandshake);
        assert_eq!(connection.variant(), None);

        connection.on_data(&hybi_handshake("/echo"));

        assert_eq!(connection.state(), ConnectionState::Open);
        assert_eq!(connection.variant(), Some(ProtocolVariant::Hybi10));
        let writes = socket.writes();
        assert_eq!(writes.len(), 1);
        assert!(writes[0].starts_with(b"HTTP/1.1 101 Web Socket Protocol Handshake\r\n"));
        assert_eq!(app.events(), vec![Event::Connect(connection.id())]);
    }

    #[test]
    fn test_legacy76_handshake_and_framing() {
        let (app, registry) = recording_registry();
        let (connection, socket) = connect(&registry);

        connection.on_data(&legacy_handshake("/echo"));
        assert_eq!(connection.variant(), Some(ProtocolVariant::Legacy76));
        let writes = socket.writes();
        let response = &writes[0];
        // Header block followed by the 16 raw digest bytes
        let head_end = response.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        assert_eq!(response.len() - head_end, 16);

        connection.on_data(b"\x00one\xff\x00two\xff\x00th");
        connection.on_data(b"ree\xff");
        let id = connection.id();
        assert_eq!(
            app.events(),
            vec![
                Event::Connect(id),
                Event::Data(id, b"one".to_vec()),
                Event::Data(id, b"two".to_vec()),
                Event::Data(id, b"three".to_vec()),
            ]
        );

        socket.clear();
        connection.send(b"hello").unwrap();
        assert_eq!(socket.writes(), vec![b"\x00hello\xff".to_vec()]);
    }

    #[test]
    fn test_bad_request_line_closes_without_callbacks() {
        let (app, registry) = recording_registry();
        let (connection, socket) = connect(&registry);

        connection.on_data(b"OPTIONS /echo HTTP/1.1\r\nHost: x\r\nOrigin: y\r\n\r\n");

        assert!(connection.is_closed());
        assert!(socket.writes().is_empty());
        assert_eq!(socket.closes(), 1);
        assert!(app.events().is_empty());

        // Disconnect after a failed handshake is a no-op
        connection.on_disconnect();
        assert_eq!(socket.closes(), 1);
        assert!(app.events().is_empty());
    }

    #[test]
    fn test_unknown_application_closes_without_callbacks() {
        let (app, registry) = recording_registry();
        let (connection, socket) = connect(&registry);

        connection.on_data(&hybi_handshake("/missing"));

        assert!(connection.is_closed());
        assert_eq!(socket.closes(), 1);
        assert!(app.events().is_empty());
    }

    #[test]
    fn test_policy_file_request() {
        let (app, registry) = recording_registry();
        let (connection, socket) = connect(&registry);

        connection.on_data(b"<policy-file-request/>\0");

        assert_eq!(socket.writes(), vec![FLASH_POLICY.as_bytes().to_vec()]);
        assert_eq!(socket.closes(), 1);
        assert!(connection.is_closed());
        assert!(app.events().is_empty());
    }

    #[test]
    fn test_hybi10_frames_dispatch_in_order() {
        let (app, registry) = recording_registry();
        let (connection, _socket) = open_hybi(&registry, "/echo");

        let mut data = frame::encode(b"first");
        data.extend(frame::encode(b"second"));
        let third = frame::encode(&[b'x'; 300]);
        data.extend_from_slice(&third[..10]);
        connection.on_data(&data);
        connection.on_data(&third[10..]);

        let id = connection.id();
        assert_eq!(
            app.events()[1..],
            [
                Event::Data(id, b"first".to_vec()),
                Event::Data(id, b"second".to_vec()),
                Event::Data(id, vec![b'x'; 300]),
            ]
        );
    }

    #[test]
    fn test_frames_pipelined_with_handshake() {
        let (app, registry) = recording_registry();
        let (connection, _socket) = connect(&registry);

        let mut data = hybi_handshake("/echo");
        data.extend(frame::encode(b"early"));
        connection.on_data(&data);

        let id = connection.id();
        assert_eq!(
            app.events(),
            vec![Event::Connect(id), Event::Data(id, b"early".to_vec())]
        );
    }

    #[test]
    fn test_send_encodes_hybi10_frame() {
        let (_app, registry) = recording_registry();
        let (connection, socket) = open_hybi(&registry, "/echo");

        connection.send(b"hi").unwrap();
        connection.send(b"there").unwrap();

        assert_eq!(socket.frames(), vec![b"hi".to_vec(), b"there".to_vec()]);
    }

    #[test]
    fn test_send_before_handshake_fails() {
        let (_app, registry) = recording_registry();
        let (connection, socket) = connect(&registry);

        assert!(matches!(connection.send(b"hi"), Err(ConnectionError::NotOpen)));
        assert!(socket.writes().is_empty());
        assert!(!connection.is_closed());
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let (app, registry) = recording_registry();
        let (connection, socket) = open_hybi(&registry, "/echo");

        connection.on_disconnect();
        connection.on_disconnect();

        let id = connection.id();
        assert_eq!(app.events(), vec![Event::Connect(id), Event::Disconnect(id)]);
        assert_eq!(socket.closes(), 1);
        assert!(matches!(connection.send(b"late"), Err(ConnectionError::NotOpen)));

        // No dispatch after disconnect
        connection.on_data(&frame::encode(b"ignored"));
        assert_eq!(app.events().len(), 2);
    }

    #[test]
    fn test_write_failure_runs_disconnect_path() {
        let (app, registry) = recording_registry();
        let (connection, socket) = open_hybi(&registry, "/echo");

        socket.fail_writes();
        let result = connection.send(b"lost");

        assert!(matches!(result, Err(ConnectionError::WriteFailed(_))));
        assert!(connection.is_closed());
        assert_eq!(socket.closes(), 1);
        let id = connection.id();
        assert_eq!(app.events(), vec![Event::Connect(id), Event::Disconnect(id)]);

        // A later close event does not repeat the callback
        connection.on_disconnect();
        assert_eq!(app.events().len(), 2);
    }

    #[test]
    fn test_handshake_write_failure_has_no_callbacks() {
        let (app, registry) = recording_registry();
        let (connection, socket) = connect(&registry);
        socket.fail_writes();

        connection.on_data(&hybi_handshake("/echo"));

        assert!(connection.is_closed());
        assert_eq!(socket.closes(), 1);
        assert!(app.events().is_empty());
    }

    #[test]
    fn test_legacy_framing_violation_disconnects() {
        let (app, registry) = recording_registry();
        let (connection, socket) = connect(&registry);
        connection.on_data(&legacy_handshake("/echo"));

        connection.on_data(b"\x00good\xffbad\xff");

        let id = connection.id();
        assert_eq!(
            app.events(),
            vec![
                Event::Connect(id),
                Event::Data(id, b"good".to_vec()),
                Event::Disconnect(id),
            ]
        );
        assert!(connection.is_closed());
        assert_eq!(socket.closes(), 1);
    }

    #[test]
    fn test_oversized_frame_disconnects() {
        let (app, registry) = recording_registry();
        let (connection, _socket) = open_hybi(&registry, "/echo");

        connection.on_data(&frame::encode(&vec![0u8; LIMIT + 1]));

        let id = connection.id();
        assert_eq!(app.events(), vec![Event::Connect(id), Event::Disconnect(id)]);
    }

    #[test]
    fn test_unterminated_legacy_data_disconnects() {
        let (app, registry) = recording_registry();
        let (connection, _socket) = connect(&registry);
        connection.on_data(&legacy_handshake("/echo"));

        let mut data = vec![0u8];
        data.extend(std::iter::repeat(b'a').take(LIMIT + frame::MAX_HEADER_LEN));
        connection.on_data(&data);

        assert!(connection.is_closed());
        assert_eq!(app.events().last(), Some(&Event::Disconnect(connection.id())));
    }

    #[test]
    fn test_legacy_byte_at_a_time_resumes_scan() {
        let (app, registry) = recording_registry();
        let (connection, _socket) = connect(&registry);
        connection.on_data(&legacy_handshake("/echo"));

        for byte in b"\x00abcde" {
            connection.on_data(&[*byte]);
        }
        assert_eq!(connection.inner.lock().scanned, 6);

        connection.on_data(b"\xff\x00x");
        let id = connection.id();
        assert_eq!(
            app.events(),
            vec![Event::Connect(id), Event::Data(id, b"abcde".to_vec())]
        );
        // Only the unfinished second frame remains, scanned once
        let inner = connection.inner.lock();
        assert_eq!(inner.buffer, b"\x00x");
        assert_eq!(inner.scanned, 2);
    }

    #[test]
    fn test_connect_disconnect_pairing() {
        let (app, registry) = recording_registry();
        let connections: Vec<_> = (0..5).map(|_| open_hybi(&registry, "/echo").0).collect();
        for connection in connections.iter().rev() {
            connection.on_disconnect();
            connection.on_disconnect();
        }

        let events = app.events();
        assert_eq!(events.len(), 10);
        for connection in &connections {
            let id = connection.id();
            let connect = events.iter().position(|e| *e == Event::Connect(id));
            let disconnects: Vec<usize> = events
                .iter()
                .enumerate()
                .filter(|(_, e)| **e == Event::Disconnect(id))
                .map(|(i, _)| i)
                .collect();
            assert_eq!(disconnects.len(), 1);
            assert!(connect.unwrap() < disconnects[0]);
        }
    }

    #[test]
    fn test_broadcaster_fan_out() {
        let broadcaster = Arc::new(Broadcaster::new());
        let registry = registry_with("echo", broadcaster.clone());
        let (a, socket_a) = open_hybi(&registry, "/echo");
        let (_b, socket_b) = open_hybi(&registry, "/echo");
        let (_c, socket_c) = open_hybi(&registry, "/echo");
        assert_eq!(broadcaster.client_count(), 3);

        a.on_data(&frame::encode(b"hi"));

        for socket in [&socket_a, &socket_b, &socket_c] {
            assert_eq!(socket.frames(), vec![b"hi".to_vec()]);
        }
    }

    #[test]
    fn test_broadcaster_drops_failed_client() {
        let broadcaster = Arc::new(Broadcaster::new());
        let registry = registry_with("echo", broadcaster.clone());
        let (a, socket_a) = open_hybi(&registry, "/echo");
        let (b, socket_b) = open_hybi(&registry, "/echo");

        socket_b.fail_writes();
        a.on_data(&frame::encode(b"hi"));

        assert!(b.is_closed());
        assert_eq!(broadcaster.client_count(), 1);
        assert_eq!(socket_a.frames(), vec![b"hi".to_vec()]);

        a.on_data(&frame::encode(b"again"));
        assert_eq!(socket_a.frames().len(), 2);
    }
}
