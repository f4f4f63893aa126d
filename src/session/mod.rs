//! Medical-history edit session: user verbs plus the save/discard protocol.

/// Blocking confirmation prompts.
pub mod confirm;
/// Editor session and its state machine.
pub mod editor;
/// Single in-flight operation guard.
pub mod guard;

pub use confirm::{AlwaysConfirm, Confirm, ConfirmPrompt, NeverConfirm};
pub use editor::{DiscardOutcome, EditorSession, RemoveRecordOutcome, SaveReport, SessionError, SessionState};
pub use guard::{InFlight, InFlightGuard};
