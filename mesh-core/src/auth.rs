//! Handshake authentication: HMAC-SHA256 over `"{peer_id}:{timestamp}"` with a mesh-wide shared secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::protocol::Message;

type HmacSha256 = Hmac<Sha256>;

/// Accepted clock difference between the two ends of a handshake.
pub const MAX_CLOCK_SKEW_SECS: u64 = 300;

/// Why a handshake was refused. Only ever logged locally; the peer just sees the socket close.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("expected {expected}, got {got}")]
    UnexpectedMessage {
        expected: &'static str,
        got: &'static str,
    },
    #[error("application id mismatch")]
    AppMismatch,
    #[error("mesh id mismatch")]
    MeshMismatch,
    #[error("auth hash mismatch")]
    BadHash,
    #[error("timestamp outside the allowed window")]
    StaleTimestamp,
    #[error("invalid shared secret")]
    InvalidKey,
}

fn mac_for(secret: &[u8], peer_id: &str, timestamp: u64) -> Result<HmacSha256, AuthError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| AuthError::InvalidKey)?;
    mac.update(format!("{peer_id}:{timestamp}").as_bytes());
    Ok(mac)
}

/// Hex-encoded HMAC-SHA256 of `"{peer_id}:{timestamp}"`.
pub fn compute_auth_hash(secret: &[u8], peer_id: &str, timestamp: u64) -> Result<String, AuthError> {
    let mac = mac_for(secret, peer_id, timestamp)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Local identity plus the secret shared by every member of the mesh.
#[derive(Clone)]
pub struct MeshCredentials {
    peer_id: String,
    app_id: String,
    mesh_id: String,
    shared_secret: Vec<u8>,
}

impl std::fmt::Debug for MeshCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshCredentials")
            .field("peer_id", &self.peer_id)
            .field("app_id", &self.app_id)
            .field("mesh_id", &self.mesh_id)
            .finish_non_exhaustive()
    }
}

impl MeshCredentials {
    pub fn new(
        peer_id: impl Into<String>,
        app_id: impl Into<String>,
        mesh_id: impl Into<String>,
        shared_secret: impl AsRef<[u8]>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            app_id: app_id.into(),
            mesh_id: mesh_id.into(),
            shared_secret: shared_secret.as_ref().to_vec(),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn mesh_id(&self) -> &str {
        &self.mesh_id
    }

    /// Build the initiator's `hello` for unix time `now`.
    pub fn hello(&self, now: u64) -> Result<Message, AuthError> {
        Ok(Message::Hello {
            peer_id: self.peer_id.clone(),
            app_id: self.app_id.clone(),
            mesh_id: self.mesh_id.clone(),
            auth_hash: compute_auth_hash(&self.shared_secret, &self.peer_id, now)?,
            timestamp: now,
        })
    }

    pub fn hello_ack(&self) -> Message {
        Message::HelloAck {
            peer_id: self.peer_id.clone(),
            app_id: self.app_id.clone(),
        }
    }

    /// Acceptor side. Checks type, app id, mesh id, hash (constant time), then freshness.
    /// Returns the authenticated peer id.
    pub fn verify_hello(&self, msg: &Message, now: u64) -> Result<String, AuthError> {
        let Message::Hello {
            peer_id,
            app_id,
            mesh_id,
            auth_hash,
            timestamp,
        } = msg
        else {
            return Err(AuthError::UnexpectedMessage {
                expected: "hello",
                got: msg.kind(),
            });
        };
        if *app_id != self.app_id {
            return Err(AuthError::AppMismatch);
        }
        if *mesh_id != self.mesh_id {
            return Err(AuthError::MeshMismatch);
        }
        let claimed = hex::decode(auth_hash).map_err(|_| AuthError::BadHash)?;
        mac_for(&self.shared_secret, peer_id, *timestamp)?
            .verify_slice(&claimed)
            .map_err(|_| AuthError::BadHash)?;
        if now.abs_diff(*timestamp) > MAX_CLOCK_SKEW_SECS {
            return Err(AuthError::StaleTimestamp);
        }
        Ok(peer_id.clone())
    }

    /// Initiator side: the reply must be a `hello_ack` for our application.
    pub fn verify_ack(&self, msg: &Message) -> Result<String, AuthError> {
        match msg {
            Message::HelloAck { peer_id, app_id } if *app_id == self.app_id => Ok(peer_id.clone()),
            Message::HelloAck { .. } => Err(AuthError::AppMismatch),
            other => Err(AuthError::UnexpectedMessage {
                expected: "hello_ack",
                got: other.kind(),
            }),
        }
    }
}
