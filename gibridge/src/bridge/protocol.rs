//! Line protocol spoken with the upstream process.
//!
//! Two directions:
//! - **Events** (bridge → upstream): `a:<addr>`, `c:<id>`, `d:<id>`, `r:<id>:<payload>`
//! - **Commands** (upstream → bridge): `<id>:<expr>`, write `expr` verbatim to connection `id`
//!
//! Fields are joined by `:` and every line ends with `\n`. Only the first
//! delimiter is significant when splitting, so payloads may contain `:`.

use std::fmt;
use std::net::SocketAddr;

use tokio_util::bytes::{BufMut, Bytes, BytesMut};

/// Field separator.
pub const DELIMITER: u8 = b':';

/// Line terminator.
pub const NEWLINE: u8 = b'\n';

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("line does not follow the syntax <id>:<expr>")]
    MissingDelimiter,
    #[error("empty connection identifier")]
    EmptyIdentifier,
    #[error("invalid connection identifier: {0:?}")]
    InvalidIdentifier(String),
    #[error("unknown event tag: {0:?}")]
    UnknownTag(String),
    #[error("field contains a raw newline")]
    NewlineInField,
}

/// Identifier of one accepted TCP connection.
///
/// Derived from the peer's remote port. Never contains the delimiter or a
/// line terminator, so it can always be embedded in an event line.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnId(String);

impl ConnId {
    pub fn from_peer(peer: &SocketAddr) -> Self {
        Self(peer.port().to_string())
    }

    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        if s.is_empty() {
            return Err(ProtocolError::EmptyIdentifier);
        }
        if s.bytes().any(|b| b == DELIMITER || b == NEWLINE || b == b'\r') {
            return Err(ProtocolError::InvalidIdentifier(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// Disambiguated variant used when the plain identifier is still registered.
    pub fn with_suffix(&self, n: usize) -> Self {
        Self(format!("{}-{}", self.0, n))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Address,
    Connect,
    Disconnect,
    Receive,
}

impl Tag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Address => "a",
            Self::Connect => "c",
            Self::Disconnect => "d",
            Self::Receive => "r",
        }
    }

    pub fn parse(raw: &[u8]) -> Result<Self, ProtocolError> {
        match raw {
            b"a" => Ok(Self::Address),
            b"c" => Ok(Self::Connect),
            b"d" => Ok(Self::Disconnect),
            b"r" => Ok(Self::Receive),
            other => Err(ProtocolError::UnknownTag(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }
}

/// Event written to upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Listener is bound and ready.
    Address(String),
    /// New connection accepted.
    Connect(ConnId),
    /// Connection closed.
    Disconnect(ConnId),
    /// One line received from a connection, terminator stripped.
    Receive { id: ConnId, payload: Bytes },
}

impl Event {
    pub fn address(addr: SocketAddr) -> Self {
        Self::Address(addr.to_string())
    }

    pub fn tag(&self) -> Tag {
        match self {
            Self::Address(_) => Tag::Address,
            Self::Connect(_) => Tag::Connect,
            Self::Disconnect(_) => Tag::Disconnect,
            Self::Receive { .. } => Tag::Receive,
        }
    }

    /// Append the encoded line, terminator included, to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let tag = self.tag();
        match self {
            Self::Address(addr) => encode(tag, &[addr.as_bytes()], dst),
            Self::Connect(id) | Self::Disconnect(id) => encode(tag, &[id.as_str().as_bytes()], dst),
            Self::Receive { id, payload } => encode(tag, &[id.as_str().as_bytes(), &payload[..]], dst),
        }
    }

    /// Parse one event line. A trailing terminator is tolerated.
    pub fn parse(line: &[u8]) -> Result<Self, ProtocolError> {
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        let (tag, rest) = decode(line)?;
        match Tag::parse(tag)? {
            Tag::Address => Ok(Self::Address(String::from_utf8_lossy(rest).into_owned())),
            Tag::Connect => Ok(Self::Connect(parse_id(rest)?)),
            Tag::Disconnect => Ok(Self::Disconnect(parse_id(rest)?)),
            Tag::Receive => {
                let (id, payload) = decode(rest)?;
                Ok(Self::Receive {
                    id: parse_id(id)?,
                    payload: Bytes::copy_from_slice(payload),
                })
            }
        }
    }
}

/// Command read from upstream: write `expr` to connection `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub id: ConnId,
    pub expr: Bytes,
}

impl Command {
    /// Parse a terminator-stripped command line. `expr` shares `line`'s buffer.
    pub fn parse(line: Bytes) -> Result<Self, ProtocolError> {
        let split = line
            .iter()
            .position(|&b| b == DELIMITER)
            .ok_or(ProtocolError::MissingDelimiter)?;
        let id = parse_id(&line[..split])?;
        let expr = line.slice(split + 1..);
        Ok(Self { id, expr })
    }
}

/// Join `tag` and `fields` with the delimiter and terminate with a newline.
pub fn encode(tag: Tag, fields: &[&[u8]], dst: &mut BytesMut) -> Result<(), ProtocolError> {
    if fields.iter().any(|f| f.contains(&NEWLINE)) {
        return Err(ProtocolError::NewlineInField);
    }
    let len = 1 + fields.iter().map(|f| f.len() + 1).sum::<usize>() + 1;
    dst.reserve(len);
    dst.put_slice(tag.as_str().as_bytes());
    for field in fields {
        dst.put_u8(DELIMITER);
        dst.put_slice(field);
    }
    dst.put_u8(NEWLINE);
    Ok(())
}

/// Split on the first delimiter only: `(first, remainder)`.
pub fn decode(line: &[u8]) -> Result<(&[u8], &[u8]), ProtocolError> {
    let split = line
        .iter()
        .position(|&b| b == DELIMITER)
        .ok_or(ProtocolError::MissingDelimiter)?;
    Ok((&line[..split], &line[split + 1..]))
}

fn parse_id(raw: &[u8]) -> Result<ConnId, ProtocolError> {
    let s = std::str::from_utf8(raw)
        .map_err(|_| ProtocolError::InvalidIdentifier(String::from_utf8_lossy(raw).into_owned()))?;
    ConnId::parse(s)
}
