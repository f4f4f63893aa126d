//! In-memory session state: temporary files and the pending-operation ledger.

/// Pending operation ledger and commit/rollback engine.
pub mod ledger;
/// Temporary file store for picked, not-yet-uploaded files.
pub mod temp_store;
