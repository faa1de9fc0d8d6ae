//! Test doubles for connections: an in-memory socket and a recording
//! application.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use super::{Connection, ConnectionRef, Transport};
use crate::app::{Application, Registry};
use crate::protocol::frame;

pub const LIMIT: usize = 1024 * 1024;

#[derive(Default)]
struct SocketLog {
    writes: Vec<Vec<u8>>,
    closes: usize,
    fail_writes: bool,
}

/// In-memory socket; clones share the same log
#[derive(Clone, Default)]
pub struct MockSocket {
    log: Arc<Mutex<SocketLog>>,
}

impl MockSocket {
    pub fn transport(&self) -> Box<dyn Transport> {
        Box::new(self.clone())
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.log.lock().writes.clone()
    }

    pub fn clear(&self) {
        self.log.lock().writes.clear();
    }

    pub fn closes(&self) -> usize {
        self.log.lock().closes
    }

    pub fn fail_writes(&self) {
        self.log.lock().fail_writes = true;
    }

    /// Payloads of the Hybi-10 frames written so far
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.writes()
            .iter()
            .map(|write| {
                let (decoded, consumed) = frame::decode(write, LIMIT).unwrap().unwrap();
                assert_eq!(consumed, write.len());
                decoded.payload
            })
            .collect()
    }
}

impl Transport for MockSocket {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut log = self.log.lock();
        if log.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock write failure"));
        }
        log.writes.push(bytes.to_vec());
        Ok(())
    }

    fn close(&mut self) {
        self.log.lock().closes += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connect(Uuid),
    Disconnect(Uuid),
    Data(Uuid, Vec<u8>),
}

/// Application that records every callback
#[derive(Default)]
pub struct RecordingApp {
    events: Mutex<Vec<Event>>,
    ticks: AtomicUsize,
}

impl RecordingApp {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn ticks(&self) -> usize {
        self.ticks.load(Ordering::SeqCst)
    }
}

impl Application for RecordingApp {
    fn on_connect(&self, connection: &ConnectionRef) {
        self.events.lock().push(Event::Connect(connection.id()));
    }

    fn on_disconnect(&self, connection: &ConnectionRef) {
        self.events.lock().push(Event::Disconnect(connection.id()));
    }

    fn on_tick(&self) {
        self.ticks.fetch_add(1, Ordering::SeqCst);
    }

    fn on_data(&self, data: &[u8], connection: &ConnectionRef) {
        self.events
            .lock()
            .push(Event::Data(connection.id(), data.to_vec()));
    }
}

pub fn registry_with(path: &str, application: Arc<dyn Application>) -> Arc<Registry> {
    let mut registry = Registry::new();
    registry.register(path, application);
    Arc::new(registry)
}

pub fn hybi_handshake(path: &str) -> Vec<u8> {
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: localhost:8000\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         Sec-WebSocket-Origin: http://localhost\r\n\
         Sec-WebSocket-Version: 8\r\n\r\n"
    )
    .into_bytes()
}

pub fn legacy_handshake(path: &str) -> Vec<u8> {
    let mut data = format!(
        "GET {path} HTTP/1.1\r\n\
         Upgrade: WebSocket\r\n\
         Connection: Upgrade\r\n\
         Host: localhost:8000\r\n\
         Origin: http://localhost\r\n\
         Sec-WebSocket-Key1: 4 @1  46546xW%0l 1 5\r\n\
         Sec-WebSocket-Key2: 12998 5 Y3 1  .P00\r\n\r\n"
    )
    .into_bytes();
    data.extend_from_slice(b"^n:ds[4U");
    data
}

/// Fresh connection on a mock socket
pub fn connect(registry: &Arc<Registry>) -> (ConnectionRef, MockSocket) {
    let socket = MockSocket::default();
    let connection = Connection::new(socket.transport(), None, Arc::clone(registry), LIMIT);
    (connection, socket)
}

/// Connection that has completed a Hybi-10 handshake; the socket log is cleared
pub fn open_hybi(registry: &Arc<Registry>, path: &str) -> (ConnectionRef, MockSocket) {
    let (connection, socket) = connect(registry);
    connection.on_data(&hybi_handshake(path));
    assert!(!connection.is_closed(), "handshake for {path} failed");
    socket.clear();
    (connection, socket)
}
