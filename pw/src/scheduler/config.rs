//! Scheduler policy knobs

/// Per-run scheduler configuration
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    /// Demote SUCCESS to PARTIAL when a non-required stage fails
    ///
    /// Off by default: optional failures never demote a run.
    pub demote_on_optional_failure: bool,

    /// Worktree metadata stamped onto StageStart events, when the caller
    /// runs stages against an isolated checkout
    pub worktree: Option<String>,

    /// Branch metadata stamped onto StageStart events
    pub branch: Option<String>,
}
