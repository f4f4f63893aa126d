//! Runtime event stream payloads.

/// Events emitted from the single-writer runtime loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditorEvent {
    /// A verb changed the working copy or the ledger.
    Changed {
        /// Pending ledger entries.
        pending: usize,
        /// Whether anything differs from the loaded document.
        unsaved: bool,
    },
    /// The session was saved and ended.
    Saved {
        /// Remote files whose deletion failed.
        orphaned: usize,
    },
    /// A save attempt failed; the session is usable again.
    SaveFailed {
        /// Rendered error.
        reason: String,
    },
    /// The session was discarded and ended.
    Discarded,
}
