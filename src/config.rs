//! Session configuration

use std::time::Duration;

/// What happens to answers already entered under an item that becomes
/// disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetentionPolicy {
    /// Drop the answers; re-enabling restores nothing
    #[default]
    Discard,
    /// Keep the answers in the store (still excluded from the exported
    /// response) and restore them on re-enable
    Retain,
}

/// Tunable behavior of a form session
#[derive(Debug, Clone)]
pub struct FormConfig {
    /// How long free-text edits coalesce before recomputation; discrete
    /// edits (boolean, choice) bypass the window entirely
    pub debounce_window: Duration,
    /// Disabled-answer retention policy
    pub retention: RetentionPolicy,
    /// Upper bound on recomputation passes per update cycle; the second
    /// pass absorbs writes made by the first, and passes are idempotent
    /// beyond that
    pub max_passes: u8,
}

impl Default for FormConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_millis(300),
            retention: RetentionPolicy::Discard,
            max_passes: 2,
        }
    }
}
