//! Diagnostics and run results
//!
//! Every defect found by the checker or the journal replay goes through a
//! [`Reporter`], which decides whether the repair happens (from the run
//! mode or by asking) and keeps the record that ends up in the
//! [`RunReport`].

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;

use crate::cache::CacheStats;
use crate::config::RunMode;
use crate::confirm::Confirm;
use crate::modules::checker::CheckStats;
use crate::modules::journaling::ReplayStats;

/// Stage of the run a diagnostic belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Setup,
    Journal,
    Phase1,
    Phase1b,
    Phase2,
    Phase3,
    Phase4,
    Phase5,
}

impl Phase {
    /// Log prefix
    pub fn tag(self) -> &'static str {
        match self {
            Phase::Setup => "SETUP",
            Phase::Journal => "SUJ",
            Phase::Phase1 => "PASS1",
            Phase::Phase1b => "PASS1B",
            Phase::Phase2 => "PASS2",
            Phase::Phase3 => "PASS3",
            Phase::Phase4 => "PASS4",
            Phase::Phase5 => "PASS5",
        }
    }

    /// Banner printed when the phase starts
    pub fn banner(self) -> &'static str {
        match self {
            Phase::Setup => "** Checking superblock",
            Phase::Journal => "** SU+J Recovering",
            Phase::Phase1 => "** Phase 1 - Check Blocks and Sizes",
            Phase::Phase1b => "** Phase 1b - Rescan For More DUPS",
            Phase::Phase2 => "** Phase 2 - Check Pathnames",
            Phase::Phase3 => "** Phase 3 - Check Connectivity",
            Phase::Phase4 => "** Phase 4 - Check Reference Counts",
            Phase::Phase5 => "** Phase 5 - Check Cyl groups",
        }
    }
}

/// What happened to a defect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Repaired
    Fixed,
    /// Repair refused or impossible in this mode
    Declined,
    /// Informational; nothing to repair
    Noted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub phase: Phase,
    pub ino: Option<u32>,
    pub message: String,
    pub action: Action,
}

/// Overall outcome of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Nothing was wrong
    Clean,
    /// Defects were found and all of them repaired
    Repaired,
    /// Some defects were left in place; the volume was not marked clean
    Unresolved,
    /// The run was cut short and must be repeated
    Rerun,
    /// The volume could not be checked at all
    Unrecoverable,
}

impl RunStatus {
    /// Conventional checker exit status
    pub fn exit_code(self) -> i32 {
        match self {
            RunStatus::Clean | RunStatus::Repaired => 0,
            RunStatus::Rerun => 4,
            RunStatus::Unresolved => 8,
            RunStatus::Unrecoverable => 16,
        }
    }
}

/// Routes repair questions and records their outcome
pub struct Reporter {
    mode: RunMode,
    confirm: Box<dyn Confirm>,
    phase: Phase,
    diagnostics: Vec<Diagnostic>,
    unresolved: bool,
    fixed: u64,
}

impl Reporter {
    pub fn new(mode: RunMode, confirm: Box<dyn Confirm>) -> Self {
        Self {
            mode,
            confirm,
            phase: Phase::Setup,
            diagnostics: Vec::new(),
            unresolved: false,
            fixed: 0,
        }
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
        info!("{}", phase.banner());
    }

    /// Report a defect and decide whether to repair it. `question` is the
    /// repair verb, e.g. "CLEAR" or "RECONNECT". Read-only modes always
    /// answer no and mark the run unresolved.
    pub fn reply(&mut self, ino: Option<u32>, message: impl Into<String>, question: &str) -> bool {
        let message = message.into();
        let yes = match self.mode {
            RunMode::ReadOnly | RunMode::Background => false,
            RunMode::Preen => true,
            RunMode::Interactive => self.confirm.confirm(&format!("{}\n{}?", message, question)),
        };
        let (action, verdict) = if yes {
            self.fixed += 1;
            (Action::Fixed, question.to_string())
        } else {
            self.unresolved = true;
            (Action::Declined, format!("NO {}", question))
        };
        warn!("{}: {} ({})", self.phase.tag(), message, verdict);
        self.diagnostics.push(Diagnostic {
            phase: self.phase,
            ino,
            message,
            action,
        });
        yes
    }

    /// Record a repair made without asking
    pub fn fixed(&mut self, ino: Option<u32>, message: impl Into<String>) {
        let message = message.into();
        info!("{}: {}", self.phase.tag(), message);
        self.fixed += 1;
        self.diagnostics.push(Diagnostic {
            phase: self.phase,
            ino,
            message,
            action: Action::Fixed,
        });
    }

    /// Record a defect that cannot be repaired here
    pub fn unresolved(&mut self, ino: Option<u32>, message: impl Into<String>) {
        let message = message.into();
        warn!("{}: {}", self.phase.tag(), message);
        self.unresolved = true;
        self.diagnostics.push(Diagnostic {
            phase: self.phase,
            ino,
            message,
            action: Action::Declined,
        });
    }

    /// Record something worth knowing that needs no repair
    pub fn note(&mut self, ino: Option<u32>, message: impl Into<String>) {
        let message = message.into();
        info!("{}: {}", self.phase.tag(), message);
        self.diagnostics.push(Diagnostic {
            phase: self.phase,
            ino,
            message,
            action: Action::Noted,
        });
    }

    pub fn is_unresolved(&self) -> bool {
        self.unresolved
    }

    /// Number of repairs made so far
    pub fn fixes(&self) -> u64 {
        self.fixed
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Forget everything recorded since `mark` diagnostics, used when a
    /// strategy is abandoned and its writes thrown away
    pub fn rollback(&mut self, mark: usize) {
        let dropped = self.diagnostics.split_off(mark.min(self.diagnostics.len()));
        let fixed = dropped.iter().filter(|d| d.action == Action::Fixed).count() as u64;
        self.fixed = self.fixed.saturating_sub(fixed);
        self.unresolved = self.diagnostics.iter().any(|d| d.action == Action::Declined);
    }

    pub fn into_diagnostics(self) -> Vec<Diagnostic> {
        self.diagnostics
    }
}

/// Summary of the volume after the run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub files: u64,
    pub dirs: u64,
    pub used_frags: u64,
    pub free_blocks: u64,
    pub free_frags: u64,
}

/// Everything a run produced
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub device: String,
    pub mode: RunMode,
    pub status: RunStatus,
    /// The volume was written to
    pub modified: bool,
    /// Journal replay replaced the full check
    pub journal_replayed: bool,
    pub journal: Option<ReplayStats>,
    pub checker: Option<CheckStats>,
    pub usage: Usage,
    pub diagnostics: Vec<Diagnostic>,
    pub cache: CacheStats,
    /// Error that ended the run early
    pub error: Option<String>,
    pub started: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl RunReport {
    /// Diagnostics of one phase
    pub fn in_phase(&self, phase: Phase) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(move |d| d.phase == phase)
    }

    /// Whether some diagnostic message contains `needle`
    pub fn mentions(&self, needle: &str) -> bool {
        self.diagnostics.iter().any(|d| d.message.contains(needle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirm::{AlwaysYes, Scripted};

    #[test]
    fn test_reply_by_mode() {
        let mut r = Reporter::new(RunMode::ReadOnly, Box::new(AlwaysYes));
        assert!(!r.reply(Some(5), "UNREF FILE I=5", "CLEAR"));
        assert!(r.is_unresolved());
        assert_eq!(r.diagnostics()[0].action, Action::Declined);

        let mut r = Reporter::new(RunMode::Preen, Box::new(Scripted::new([], false)));
        assert!(r.reply(None, "FREE BLK COUNT(S) WRONG IN SUPERBLK", "SALVAGE"));
        assert!(!r.is_unresolved());
        assert_eq!(r.fixes(), 1);

        let mut r = Reporter::new(RunMode::Interactive, Box::new(Scripted::new([false, true], false)));
        assert!(!r.reply(Some(7), "A", "FIX"));
        assert!(r.reply(Some(7), "B", "FIX"));
        assert!(r.is_unresolved());
    }

    #[test]
    fn test_rollback_forgets_abandoned_work() {
        let mut r = Reporter::new(RunMode::Preen, Box::new(AlwaysYes));
        r.note(None, "kept");
        let mark = r.diagnostics().len();
        r.fixed(Some(3), "dropped");
        r.unresolved(None, "also dropped");
        r.rollback(mark);
        assert_eq!(r.diagnostics().len(), 1);
        assert_eq!(r.fixes(), 0);
        assert!(!r.is_unresolved());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(RunStatus::Clean.exit_code(), 0);
        assert_eq!(RunStatus::Repaired.exit_code(), 0);
        assert_eq!(RunStatus::Rerun.exit_code(), 4);
        assert_eq!(RunStatus::Unresolved.exit_code(), 8);
        assert_eq!(RunStatus::Unrecoverable.exit_code(), 16);
    }
}
