//! Handshake negotiation
//!
//! Parses the HTTP upgrade request sent on a fresh connection, classifies it as
//! a Hixie-76 (legacy) or Hybi-10 handshake, computes the matching security
//! digest and builds the response block. Flash cross-domain policy probes are
//! answered here too. Nothing in this module touches a socket.

use std::collections::HashMap;

use base64::prelude::*;
use md5::Md5;
use sha1::{Digest, Sha1};
use thiserror::Error;

/// GUID appended to `Sec-WebSocket-Key` before hashing (Hybi-10)
pub const HYBI_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Status line sent for both handshake variants
pub const STATUS_LINE: &str = "HTTP/1.1 101 Web Socket Protocol Handshake";

/// Length of the raw body (`key3`) trailing a Hixie-76 request
pub const KEY3_LEN: usize = 8;

/// Document served to Flash clients probing for socket access
pub const FLASH_POLICY: &str = concat!(
    "<?xml version=\"1.0\"?>\n",
    "<!DOCTYPE cross-domain-policy SYSTEM \"http://www.macromedia.com/xml/dtds/cross-domain-policy.dtd\">\n",
    "<cross-domain-policy>\n",
    "<allow-access-from domain=\"*\" to-ports=\"*\"/>\n",
    "</cross-domain-policy>\n",
);

const POLICY_REQUEST: &[u8] = b"<policy-file-request";
const HEAD_END: &[u8] = b"\r\n\r\n";

/// Errors that can occur while negotiating a handshake
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Incomplete handshake request")]
    Incomplete,

    #[error("Handshake headers are not valid UTF-8")]
    NotUtf8,

    #[error("Bad request line: {0}")]
    BadRequestLine(String),

    #[error("Missing required header: {0}")]
    MissingHeader(&'static str),

    #[error("Unknown application: {0}")]
    UnknownApplication(String),

    #[error("No Sec-WebSocket-Key or Sec-WebSocket-Key1 header")]
    MissingKey,

    #[error("Security key contains no spaces: {0:?}")]
    KeyWithoutSpaces(String),

    #[error("Security key out of range: {0:?}")]
    KeyOutOfRange(String),

    #[error("Expected {KEY3_LEN} key3 bytes, got {0}")]
    MissingKey3(usize),
}

/// Result type for handshake operations
pub type HandshakeResult<T> = Result<T, HandshakeError>;

/// Handshake variant, selected by which key header the client sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVariant {
    /// draft-hixie-76: MD5 digest, `0x00 .. 0xFF` framing
    Legacy76,
    /// draft-ietf-hybi-10: SHA-1 accept key, binary masked framing
    Hybi10,
}

impl std::fmt::Display for ProtocolVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolVariant::Legacy76 => write!(f, "hixie-76"),
            ProtocolVariant::Hybi10 => write!(f, "hybi-10"),
        }
    }
}

/// Parsed upgrade request
///
/// Header names keep the case they were received with; a repeated header keeps
/// its last value.
#[derive(Debug, Clone)]
pub struct HandshakeRequest<'a> {
    pub path: &'a str,
    pub headers: HashMap<&'a str, &'a str>,
    /// Bytes following the blank line that ends the headers
    pub body: &'a [u8],
}

impl<'a> HandshakeRequest<'a> {
    /// Parse the request line and headers out of a raw request
    pub fn parse(data: &'a [u8]) -> HandshakeResult<Self> {
        let head_end = find(data, HEAD_END).ok_or(HandshakeError::Incomplete)?;
        let head = std::str::from_utf8(&data[..head_end]).map_err(|_| HandshakeError::NotUtf8)?;

        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or_default();
        let path = parse_request_line(request_line)
            .ok_or_else(|| HandshakeError::BadRequestLine(request_line.to_string()))?;

        let mut headers = HashMap::new();
        for line in lines {
            if let Some((name, value)) = parse_header_line(line) {
                headers.insert(name, value);
            }
        }

        Ok(Self {
            path,
            headers,
            body: &data[head_end + HEAD_END.len()..],
        })
    }

    /// Look up a header by its exact name
    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.headers.get(name).copied()
    }

    fn require(&self, name: &'static str) -> HandshakeResult<&'a str> {
        self.header(name).ok_or(HandshakeError::MissingHeader(name))
    }

    /// Application name addressed by the request path (`/echo` -> `echo`)
    pub fn application_name(&self) -> &'a str {
        self.path.strip_prefix('/').unwrap_or(self.path)
    }

    /// Which handshake variant the client is speaking
    pub fn variant(&self) -> HandshakeResult<ProtocolVariant> {
        if self.headers.contains_key("Sec-WebSocket-Key1") {
            Ok(ProtocolVariant::Legacy76)
        } else if self.headers.contains_key("Sec-WebSocket-Key") {
            Ok(ProtocolVariant::Hybi10)
        } else {
            Err(HandshakeError::MissingKey)
        }
    }
}

/// Accepted upgrade, ready to be written back to the client
#[derive(Debug)]
pub struct Upgrade<A> {
    pub variant: ProtocolVariant,
    pub path: String,
    pub application: A,
    /// Full response: headers, blank line and (Hixie-76 only) the digest body
    pub response: Vec<u8>,
    /// Bytes the client pipelined after the handshake
    pub trailing: Vec<u8>,
}

/// Outcome of a successful negotiation
#[derive(Debug)]
pub enum Negotiation<A> {
    /// Flash policy probe; write [`FLASH_POLICY`] and close
    PolicyFile,
    /// WebSocket upgrade accepted
    Upgrade(Upgrade<A>),
}

/// Negotiate a handshake from the first block of bytes received
///
/// `lookup` resolves an application name to the application it is bound to.
/// A request split across reads is reported as [`HandshakeError::Incomplete`].
pub fn negotiate<A, F>(data: &[u8], lookup: F) -> HandshakeResult<Negotiation<A>>
where
    F: FnOnce(&str) -> Option<A>,
{
    if is_policy_request(first_line(data)) {
        return Ok(Negotiation::PolicyFile);
    }

    let request = HandshakeRequest::parse(data)?;

    let host = request.require("Host")?;
    let origin = request
        .header("Sec-WebSocket-Origin")
        .or_else(|| request.header("Origin"))
        .ok_or(HandshakeError::MissingHeader("Origin"))?;

    let application = lookup(request.application_name())
        .ok_or_else(|| HandshakeError::UnknownApplication(request.path.to_string()))?;

    let variant = request.variant()?;
    let location = format!("ws://{}{}", host, request.path);

    let (response, trailing) = match variant {
        ProtocolVariant::Hybi10 => {
            let accept = hybi10_accept(request.require("Sec-WebSocket-Key")?);
            let headers = [
                ("WebSocket-Origin", origin),
                ("WebSocket-Location", location.as_str()),
                ("Sec-WebSocket-Accept", accept.as_str()),
            ];
            (response_head(&headers).into_bytes(), request.body.to_vec())
        }
        ProtocolVariant::Legacy76 => {
            let key1 = request.require("Sec-WebSocket-Key1")?;
            let key2 = request.require("Sec-WebSocket-Key2")?;
            if request.body.len() < KEY3_LEN {
                return Err(HandshakeError::MissingKey3(request.body.len()));
            }
            let (key3, rest) = request.body.split_at(KEY3_LEN);
            let digest = legacy76_digest(key1, key2, key3)?;

            let headers = [
                ("Sec-WebSocket-Origin", origin),
                ("Sec-WebSocket-Location", location.as_str()),
            ];
            let mut response = response_head(&headers).into_bytes();
            response.extend_from_slice(&digest);
            (response, rest.to_vec())
        }
    };

    Ok(Negotiation::Upgrade(Upgrade {
        variant,
        path: request.path.to_string(),
        application,
        response,
        trailing,
    }))
}

/// `Sec-WebSocket-Accept` value for a Hybi-10 key
pub fn hybi10_accept(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(HYBI_GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

/// Raw 16-byte MD5 challenge response for a Hixie-76 handshake
pub fn legacy76_digest(key1: &str, key2: &str, key3: &[u8]) -> HandshakeResult<[u8; 16]> {
    let mut md5 = Md5::new();
    md5.update(legacy76_key_number(key1)?.to_be_bytes());
    md5.update(legacy76_key_number(key2)?.to_be_bytes());
    md5.update(key3);

    let mut digest = [0u8; 16];
    digest.copy_from_slice(&md5.finalize());
    Ok(digest)
}

/// Digits of the key read as one integer, divided by the number of spaces
pub fn legacy76_key_number(key: &str) -> HandshakeResult<u32> {
    let spaces = key.bytes().filter(|b| *b == b' ').count() as u64;
    if spaces == 0 {
        return Err(HandshakeError::KeyWithoutSpaces(key.to_string()));
    }

    let number = key
        .bytes()
        .filter(u8::is_ascii_digit)
        .try_fold(0u64, |acc, digit| {
            acc.checked_mul(10)?.checked_add(u64::from(digit - b'0'))
        })
        .ok_or_else(|| HandshakeError::KeyOutOfRange(key.to_string()))?;

    u32::try_from(number / spaces).map_err(|_| HandshakeError::KeyOutOfRange(key.to_string()))
}

fn response_head(headers: &[(&str, &str)]) -> String {
    let mut head = format!("{STATUS_LINE}\r\nUpgrade: WebSocket\r\nConnection: Upgrade\r\n");
    for (name, value) in headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    head
}

/// `GET <path> HTTP/1.1`, where the path contains no whitespace
fn parse_request_line(line: &str) -> Option<&str> {
    let path = line.strip_prefix("GET ")?.strip_suffix(" HTTP/1.1")?;
    if path.is_empty() || path.chars().any(char::is_whitespace) {
        return None;
    }
    Some(path)
}

/// `Name: value`, where the name contains no whitespace
fn parse_header_line(line: &str) -> Option<(&str, &str)> {
    let (name, value) = line.split_once(": ")?;
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return None;
    }
    Some((name, value.trim_end()))
}

fn first_line(data: &[u8]) -> &[u8] {
    match find(data, b"\r\n") {
        Some(end) => &data[..end],
        None => data,
    }
}

/// `<policy-file-request ... >` anywhere on the line
fn is_policy_request(line: &[u8]) -> bool {
    find(line, POLICY_REQUEST)
        .map(|start| line[start + POLICY_REQUEST.len()..].contains(&b'>'))
        .unwrap_or(false)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
