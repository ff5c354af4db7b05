//! Document merge: per-peer max on the version vector, wholesale snapshot overwrite.
//!
//! When any remote counter is ahead of the local one, the local field map is
//! replaced by the remote field map in full. Fields are not merged one by one:
//! concurrent edits to different fields by two peers do not both survive, the
//! snapshot observed last wins. Version vectors always converge; field maps
//! converge for causally ordered histories.

use crate::document::{Document, VersionVector};
use crate::value::Fields;

/// What a merge did to the local document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The document did not exist locally and was created from the remote snapshot.
    Created,
    /// A remote counter advanced; the snapshot was adopted.
    Updated,
    /// No remote counter was ahead; nothing changed.
    Unchanged,
}

impl MergeOutcome {
    pub fn changed(self) -> bool {
        !matches!(self, MergeOutcome::Unchanged)
    }
}

/// Merge a remote snapshot into `local` in place.
pub fn merge_into(
    local: &mut Document,
    remote_fields: &Fields,
    remote_version: &VersionVector,
) -> MergeOutcome {
    let mut advanced = false;
    for (peer, counter) in remote_version.iter() {
        if counter > local.version.get(peer) {
            local.version.observe(peer, counter);
            advanced = true;
        }
    }
    if advanced {
        local.fields = remote_fields.clone();
        MergeOutcome::Updated
    } else {
        MergeOutcome::Unchanged
    }
}

/// Pure form: `local` merged with `remote`.
pub fn merged(local: &Document, remote: &Document) -> Document {
    let mut out = local.clone();
    merge_into(&mut out, &remote.fields, &remote.version);
    out
}
