use muxroom_proto::PeerId;
use muxroom_rpc::ManifestError;
use thiserror::Error;

/// Room server errors
#[derive(Debug, Error)]
pub enum RoomError {
    #[error("Access restricted to members: {0}")]
    NotMember(PeerId),

    #[error("Failed to build room manifest: {0}")]
    Manifest(#[from] ManifestError),
}
