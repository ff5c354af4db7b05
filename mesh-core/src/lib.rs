//! Mesh sync protocol core.
//! Host-driven: no network I/O; the host passes in messages and the current time.

pub mod auth;
pub mod catalog;
pub mod datagram;
pub mod document;
pub mod integrity;
pub mod merge;
pub mod peers;
pub mod protocol;
pub mod store;
pub mod transfer;
pub mod value;
pub mod wire;

pub use auth::{AuthError, MeshCredentials, MAX_CLOCK_SKEW_SECS};
pub use catalog::{
    CapabilityCatalog, CatalogEntry, CatalogGossip, ModelInfo, PeerModelInfo, TransferEndpoints,
};
pub use datagram::{Announcement, Datagram};
pub use document::{Document, VersionVector};
pub use merge::MergeOutcome;
pub use peers::{PeerRecord, PeerTable, Sighting};
pub use protocol::Message;
pub use store::{ChangeEvent, ChangeOrigin, DocumentStore, StoreError, Subscription, SubscriptionId};
pub use transfer::{ModelLayout, ModelSidecar, TransferProgress, TransferState};
pub use value::{Fields, Value};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError, MAX_FRAME_LEN};

/// Current unix time in whole seconds; 0 if the clock is before the epoch.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
