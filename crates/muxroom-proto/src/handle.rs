//! Tunnel handles
//!
//! A handle names a room and a peer reachable through it:
//!
//! ```text
//! net:room.example.org:8008~shs:<room key>;tunnel:<room id>:<target id>~shs:<target key>
//! ```
//!
//! Everything before the `tunnel:` part is the room's own address, which the
//! transport layer uses to dial the room. The relay only needs the target id.

use crate::peer::PeerId;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const TUNNEL_PREFIX: &str = "tunnel:";
const SHS_PREFIX: &str = "shs:";

/// Handle parsing errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandleError {
    #[error("Handle has no tunnel address")]
    MissingTunnel,

    #[error("Malformed tunnel address: {0}")]
    Malformed(String),

    #[error("Invalid target key: {0}")]
    InvalidKey(String),
}

/// Parsed tunnel handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelHandle {
    /// How to reach the room itself, consumed by the transport layer
    pub room_address: Option<String>,
    pub room: PeerId,
    pub target: PeerId,
    /// Target's handshake key, if the handle carries one
    pub target_key: Option<Vec<u8>>,
}

impl TunnelHandle {
    pub fn new(room: PeerId, target: PeerId) -> Self {
        Self {
            room_address: None,
            room,
            target,
            target_key: None,
        }
    }

    pub fn with_room_address(mut self, address: impl Into<String>) -> Self {
        self.room_address = Some(address.into());
        self
    }

    fn parse_tunnel(part: &str) -> Result<(PeerId, PeerId, Option<Vec<u8>>), HandleError> {
        let rest = &part[TUNNEL_PREFIX.len()..];
        let (ids, transform) = match rest.split_once('~') {
            Some((ids, transform)) => (ids, Some(transform)),
            None => (rest, None),
        };

        let mut ids = ids.split(':');
        let (room, target) = match (ids.next(), ids.next(), ids.next()) {
            (Some(room), Some(target), None) if !room.is_empty() && !target.is_empty() => {
                (PeerId::from(room), PeerId::from(target))
            }
            _ => return Err(HandleError::Malformed(part.to_string())),
        };

        let key = match transform {
            None => None,
            Some(transform) => {
                let encoded = transform
                    .strip_prefix(SHS_PREFIX)
                    .ok_or_else(|| HandleError::Malformed(part.to_string()))?;
                let key = STANDARD
                    .decode(encoded)
                    .map_err(|e| HandleError::InvalidKey(e.to_string()))?;
                if key.len() != 32 {
                    return Err(HandleError::InvalidKey(format!(
                        "expected 32 bytes, got {}",
                        key.len()
                    )));
                }
                Some(key)
            }
        };

        Ok((room, target, key))
    }
}

impl FromStr for TunnelHandle {
    type Err = HandleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut tunnel = None;
        let mut others = Vec::new();

        for part in s.split(';') {
            if part.starts_with(TUNNEL_PREFIX) && tunnel.is_none() {
                tunnel = Some(part);
            } else if !part.is_empty() {
                others.push(part);
            }
        }

        let tunnel = tunnel.ok_or(HandleError::MissingTunnel)?;
        let (room, target, target_key) = Self::parse_tunnel(tunnel)?;

        Ok(Self {
            room_address: (!others.is_empty()).then(|| others.join(";")),
            room,
            target,
            target_key,
        })
    }
}

impl fmt::Display for TunnelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(address) = &self.room_address {
            write!(f, "{};", address)?;
        }
        write!(f, "{}{}:{}", TUNNEL_PREFIX, self.room, self.target)?;
        if let Some(key) = &self.target_key {
            write!(f, "~{}{}", SHS_PREFIX, STANDARD.encode(key))?;
        }
        Ok(())
    }
}
