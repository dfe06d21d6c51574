//! RPC error kinds and their wire representation

use muxroom_proto::ErrorBody;
use thiserror::Error;

const LEGACY_NOT_ALLOWED: &str = " is not in list of allowed methods";

/// Failure of a call, a stream or a whole connection
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Kind mismatch: {0}")]
    KindMismatch(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Transport error: {0}")]
    Transport(String),

    /// Application error raised by the remote handler
    #[error("{name}: {message}")]
    Remote { name: String, message: String },
}

impl RpcError {
    pub fn remote(name: impl Into<String>, message: impl Into<String>) -> Self {
        RpcError::Remote {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Encode as the `{name, message}` body of an error frame.
    pub fn to_error_body(&self) -> ErrorBody {
        match self {
            RpcError::Protocol(msg) => ErrorBody::new("ProtocolError", msg.clone()),
            RpcError::MethodNotFound(method) => ErrorBody::new(
                "MethodNotFound",
                format!("method:{}{}", method, LEGACY_NOT_ALLOWED),
            ),
            RpcError::KindMismatch(msg) => ErrorBody::new("KindMismatch", msg.clone()),
            RpcError::PermissionDenied(msg) => ErrorBody::new("PermissionDenied", msg.clone()),
            RpcError::PeerNotFound(peer) => ErrorBody::new("PeerNotFound", peer.clone()),
            RpcError::ConnectionClosed => ErrorBody::new("ConnectionClosed", "connection closed"),
            RpcError::Transport(msg) => ErrorBody::new("TransportError", msg.clone()),
            RpcError::Remote { name, message } => ErrorBody::new(name.clone(), message.clone()),
        }
    }

    /// Decode an error frame body, mapping known names back onto kinds.
    pub fn from_error_body(body: ErrorBody) -> Self {
        if let Some(method) = legacy_method_not_found(&body.message) {
            return RpcError::MethodNotFound(method);
        }

        match body.name.as_str() {
            "ProtocolError" => RpcError::Protocol(body.message),
            "MethodNotFound" => RpcError::MethodNotFound(body.message),
            "KindMismatch" => RpcError::KindMismatch(body.message),
            "PermissionDenied" => RpcError::PermissionDenied(body.message),
            "PeerNotFound" => RpcError::PeerNotFound(body.message),
            "ConnectionClosed" => RpcError::ConnectionClosed,
            "TransportError" => RpcError::Transport(body.message),
            _ => RpcError::Remote {
                name: body.name,
                message: body.message,
            },
        }
    }
}

/// `method:tunnel.isRoom is not in list of allowed methods` is what legacy
/// peers answer for methods they don't expose.
fn legacy_method_not_found(message: &str) -> Option<String> {
    message
        .strip_prefix("method:")
        .and_then(|rest| rest.strip_suffix(LEGACY_NOT_ALLOWED))
        .map(str::to_string)
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Transport(err.to_string())
    }
}

/// Extract the RPC error wrapped inside an `io::Error` returned by a tunnel stream.
pub fn rpc_error(err: &std::io::Error) -> Option<&RpcError> {
    err.get_ref().and_then(|inner| inner.downcast_ref::<RpcError>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_survive_the_wire() {
        for err in [
            RpcError::MethodNotFound("tunnel.isRoom".into()),
            RpcError::PeerNotFound("@q.ed25519".into()),
            RpcError::KindMismatch("tunnel.ping is sync, called as source".into()),
            RpcError::ConnectionClosed,
            RpcError::remote("Error", "boom"),
        ] {
            assert_eq!(RpcError::from_error_body(err.to_error_body()), err);
        }
    }

    #[test]
    fn test_legacy_method_not_found() {
        let body = ErrorBody::new(
            "Error",
            "method:tunnel.isRoom is not in list of allowed methods",
        );
        assert_eq!(
            RpcError::from_error_body(body),
            RpcError::MethodNotFound("tunnel.isRoom".into())
        );
    }

    #[test]
    fn test_rpc_error_through_io_error() {
        let io = std::io::Error::other(RpcError::PeerNotFound("@q".into()));
        assert_eq!(rpc_error(&io), Some(&RpcError::PeerNotFound("@q".into())));
    }
}
