use serde::{Deserialize, Serialize};

/// Per-connection buffering and limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Frames queued for the writer before senders wait
    pub outgoing_queue: usize,
    /// Frames buffered per inbound stream before the reader waits
    pub stream_queue: usize,
    /// Largest frame body accepted or produced
    pub max_frame_size: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outgoing_queue: 64,
            stream_queue: 32,
            max_frame_size: muxroom_proto::MAX_FRAME_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ConnectionConfig = serde_json::from_str(r#"{"stream_queue": 4}"#).unwrap();
        assert_eq!(config.stream_queue, 4);
        assert_eq!(config.outgoing_queue, 64);
        assert_eq!(config.max_frame_size, muxroom_proto::MAX_FRAME_SIZE);
    }
}
