//! UDP datagrams: 4-byte magic marker + UTF-8 JSON body.
//! `MSH1` carries discovery announcements, `MCT1` carries catalog gossip.

use serde::{Deserialize, Serialize};

use crate::catalog::{CatalogGossip, GossipMessage};

pub const DISCOVERY_MAGIC: [u8; 4] = *b"MSH1";
pub const CATALOG_MAGIC: [u8; 4] = *b"MCT1";

/// Presence beacon: who we are and where our sync listener is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub peer_id: String,
    pub app_id: String,
    pub tcp_port: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Datagram {
    Discovery(Announcement),
    Catalog(CatalogGossip),
}

#[derive(Debug, thiserror::Error)]
pub enum DatagramError {
    #[error("datagram shorter than magic marker")]
    Truncated,
    #[error("unknown magic marker")]
    BadMagic,
    #[error("malformed body: {0}")]
    Body(#[from] serde_json::Error),
}

pub fn encode_announcement(a: &Announcement) -> Result<Vec<u8>, serde_json::Error> {
    encode_with(DISCOVERY_MAGIC, a)
}

pub fn encode_catalog(g: &CatalogGossip) -> Result<Vec<u8>, serde_json::Error> {
    encode_with(CATALOG_MAGIC, &GossipMessage::ModelCatalog(g.clone()))
}

fn encode_with<T: Serialize>(magic: [u8; 4], body: &T) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(body)?;
    let mut out = Vec::with_capacity(magic.len() + json.len());
    out.extend_from_slice(&magic);
    out.extend_from_slice(&json);
    Ok(out)
}

pub fn decode_datagram(bytes: &[u8]) -> Result<Datagram, DatagramError> {
    if bytes.len() < 4 {
        return Err(DatagramError::Truncated);
    }
    let (magic, body) = bytes.split_at(4);
    if magic == DISCOVERY_MAGIC {
        Ok(Datagram::Discovery(serde_json::from_slice(body)?))
    } else if magic == CATALOG_MAGIC {
        let msg: GossipMessage = serde_json::from_slice(body)?;
        let GossipMessage::ModelCatalog(g) = msg;
        Ok(Datagram::Catalog(g))
    } else {
        Err(DatagramError::BadMagic)
    }
}

/// Discovery filter: same application, not ourselves.
pub fn accepts(a: &Announcement, local_peer: &str, app_id: &str) -> bool {
    a.app_id == app_id && a.peer_id != local_peer
}
