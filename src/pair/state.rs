//! Replication state derived from destination-side properties.

use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Uninitialized,
    Synchronized,
    Inconsistent(Inconsistency),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inconsistency {
    /// The destination carries another pair's fingerprint.
    MismatchedFingerprint,
    /// A last snapshot is recorded but the fingerprint is missing.
    MissingFingerprint,
    /// The fingerprint matches but the recorded snapshot is absent.
    MissingLastSnapshot,
}

impl State {
    pub fn is_synchronized(&self) -> bool {
        matches!(self, State::Synchronized)
    }

    pub fn label(&self) -> &'static str {
        match self {
            State::Uninitialized => "Uninitialized",
            State::Synchronized => "Synchronized",
            State::Inconsistent(_) => "Inconsistent!",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl fmt::Display for Inconsistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Inconsistency::MismatchedFingerprint => "mismatched fingerprint",
            Inconsistency::MissingFingerprint => "missing fingerprint",
            Inconsistency::MissingLastSnapshot => "missing last snapshot",
        })
    }
}

/// Operational status, orthogonal to [`State`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    Running,
    Initializing,
}

impl Status {
    /// Running while live; otherwise Initializing until synchronized.
    pub fn derive(live: bool, state: State) -> Self {
        match (live, state.is_synchronized()) {
            (true, _) => Status::Running,
            (false, false) => Status::Initializing,
            (false, true) => Status::Idle,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Idle => "Idle",
            Status::Running => "Running",
            Status::Initializing => "Initializing",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LagLevel {
    Ok,
    Warning,
    Critical,
}

impl LagLevel {
    /// Thresholds are inclusive. A zero threshold is treated as unset.
    pub fn classify(lag: Duration, wlag: Duration, clag: Duration) -> Self {
        if !clag.is_zero() && lag >= clag {
            LagLevel::Critical
        } else if !wlag.is_zero() && lag >= wlag {
            LagLevel::Warning
        } else {
            LagLevel::Ok
        }
    }
}

/// What the destination currently says about the pair. Read once per run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Observation {
    pub exists: bool,
    pub fingerprint: Option<String>,
    pub last_snapshot: Option<String>,
    pub last_snapshot_exists: bool,
}

impl Observation {
    pub fn state(&self, fingerprint: &str) -> State {
        if !self.exists {
            return State::Uninitialized;
        }
        match (self.fingerprint.as_deref(), self.last_snapshot.is_some()) {
            (None, false) => State::Uninitialized,
            (None, true) => State::Inconsistent(Inconsistency::MissingFingerprint),
            (Some(found), _) if found != fingerprint => {
                State::Inconsistent(Inconsistency::MismatchedFingerprint)
            }
            (Some(_), true) if self.last_snapshot_exists => State::Synchronized,
            (Some(_), _) => State::Inconsistent(Inconsistency::MissingLastSnapshot),
        }
    }
}
