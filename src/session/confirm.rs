use std::fmt;

/// What the user is asked to confirm, with the number of affected file
/// operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmPrompt {
    /// Removing a history record and its attachments.
    RemoveRecord {
        /// Position of the record.
        record_index: usize,
        /// Attachments that will be deleted on save.
        documents: usize,
    },
    /// Abandoning every unsaved edit.
    Discard {
        /// Pending file operations that will be undone.
        pending_operations: usize,
    },
    /// Leaving while edits are pending.
    Unload {
        /// Pending file operations that would be lost.
        pending_operations: usize,
    },
}

impl fmt::Display for ConfirmPrompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemoveRecord { documents, .. } => write!(
                f,
                "Remove this record? {documents} attached document(s) will be deleted when you save."
            ),
            Self::Discard { pending_operations } => write!(
                f,
                "Discard all changes? {pending_operations} pending file operation(s) will be undone."
            ),
            Self::Unload { pending_operations } => write!(
                f,
                "Leave without saving? {pending_operations} pending file operation(s) will be lost."
            ),
        }
    }
}

/// Host-provided blocking confirmation.
pub trait Confirm: Send + Sync {
    /// Returns true when the user accepts.
    fn confirm(&self, prompt: &ConfirmPrompt) -> bool;
}

impl<F> Confirm for F
where
    F: Fn(&ConfirmPrompt) -> bool + Send + Sync,
{
    fn confirm(&self, prompt: &ConfirmPrompt) -> bool {
        self(prompt)
    }
}

/// Accepts every prompt.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysConfirm;

impl Confirm for AlwaysConfirm {
    fn confirm(&self, _prompt: &ConfirmPrompt) -> bool {
        true
    }
}

/// Refuses every prompt.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverConfirm;

impl Confirm for NeverConfirm {
    fn confirm(&self, _prompt: &ConfirmPrompt) -> bool {
        false
    }
}
