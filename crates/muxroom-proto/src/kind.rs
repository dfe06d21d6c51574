use serde::{Deserialize, Serialize};
use std::fmt;

/// How a method is called and what it returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    /// Answered immediately by the callee; travels as `async` on the wire.
    Sync,
    /// A single response value.
    Async,
    /// The callee streams values to the caller.
    Source,
    /// The caller streams values to the callee.
    Sink,
    /// Both sides stream.
    Duplex,
}

impl CallKind {
    /// The kind as it appears in a request's `type` field.
    pub fn wire(self) -> CallKind {
        match self {
            CallKind::Sync => CallKind::Async,
            other => other,
        }
    }

    /// Whether frames of this call carry the stream flag.
    pub fn is_stream(self) -> bool {
        matches!(self, CallKind::Source | CallKind::Sink | CallKind::Duplex)
    }

    /// Whether a request declaring `requested` may be served by a method of this kind.
    pub fn accepts(self, requested: CallKind) -> bool {
        self.wire() == requested.wire()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallKind::Sync => "sync",
            CallKind::Async => "async",
            CallKind::Source => "source",
            CallKind::Sink => "sink",
            CallKind::Duplex => "duplex",
        }
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_travels_as_async() {
        assert_eq!(CallKind::Sync.wire(), CallKind::Async);
        assert!(CallKind::Sync.accepts(CallKind::Async));
        assert!(CallKind::Async.accepts(CallKind::Sync));
        assert!(!CallKind::Source.accepts(CallKind::Duplex));
    }

    #[test]
    fn test_serde_names() {
        let kind: CallKind = serde_json::from_str("\"duplex\"").unwrap();
        assert_eq!(kind, CallKind::Duplex);
        assert_eq!(serde_json::to_string(&CallKind::Source).unwrap(), "\"source\"");
    }
}
