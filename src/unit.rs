//! Data-unit registration records.
//!
//! A unit is a named, instanced, versioned producer/consumer of one
//! self-contained data block in the saved-state file.  Registration hands
//! the engine up to nine optional callbacks grouped into live/save/load
//! triples; owners are captured inside the callback closures, with the
//! caller kind kept as a diagnostic tag.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::err::{LiveExecFlow, SsmResult, Vote};
use crate::handle::SsmHandle;

/// Which kind of caller owns a unit.  Purely diagnostic in this engine;
/// the callback shapes are identical across kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnitKind {
    Device,
    Driver,
    Usb,
    #[default]
    Internal,
    External,
}

/// Prepare/done-style callback.
pub type PrepFn = Box<dyn FnMut(&mut SsmHandle) -> SsmResult<()> + Send>;
/// Save-exec callback: issues puts.
pub type SaveExecFn = Box<dyn FnMut(&mut SsmHandle) -> SsmResult<()> + Send>;
/// Load-exec callback: receives the stored unit version and the pass.
pub type LoadExecFn = Box<dyn FnMut(&mut SsmHandle, u32, u32) -> SsmResult<()> + Send>;
/// Live-exec callback: receives the pass; may ask not to be called again.
pub type LiveExecFn = Box<dyn FnMut(&mut SsmHandle, u32) -> SsmResult<LiveExecFlow> + Send>;
/// Live-vote callback: receives the pass; votes on convergence.
pub type LiveVoteFn = Box<dyn FnMut(&mut SsmHandle, u32) -> SsmResult<Vote> + Send>;

/// The nine optional callbacks of a unit.
#[derive(Default)]
pub struct UnitOps {
    pub live_prep: Option<PrepFn>,
    pub live_exec: Option<LiveExecFn>,
    pub live_vote: Option<LiveVoteFn>,
    pub save_prep: Option<PrepFn>,
    pub save_exec: Option<SaveExecFn>,
    pub save_done: Option<PrepFn>,
    pub load_prep: Option<PrepFn>,
    pub load_exec: Option<LoadExecFn>,
    pub load_done: Option<PrepFn>,
}

/// Registration parameters for one unit.
pub struct UnitConfig {
    pub name: String,
    pub instance: u32,
    /// Written on save, handed back to `load_exec`.
    pub version: u32,
    pub kind: UnitKind,
    /// Rough data-size guess; only scales progress reporting.
    pub guessed_size: u64,
    /// Optional scope guard entered around every callback.
    pub crit_sect: Option<Arc<Mutex<()>>>,
    /// Insert before the first unit with this name instead of appending.
    pub before: Option<String>,
    pub ops: UnitOps,
}

impl UnitConfig {
    pub fn new(name: impl Into<String>, instance: u32, version: u32, kind: UnitKind) -> UnitConfig {
        UnitConfig {
            name: name.into(),
            instance,
            version,
            kind,
            guessed_size: 0,
            crit_sect: None,
            before: None,
            ops: UnitOps::default(),
        }
    }
}

/// A registered unit plus its per-operation transient state.
pub(crate) struct Unit {
    pub name: String,
    pub instance: u32,
    pub version: u32,
    #[allow(dead_code)] // diagnostic tag, reported on registration/teardown
    pub kind: UnitKind,
    pub ops: UnitOps,
    pub crit_sect: Option<Arc<Mutex<()>>>,
    pub cb_guess: u64,
    /// Took part in the current operation (drives the done phase).
    pub called: bool,
    /// Finished its live part (stops live exec/vote polling).
    pub done_live: bool,
    /// Stream offset of this unit's (most recent) header; feeds the
    /// directory.  Zero means no header was emitted.
    pub off_stream: u64,
}

impl Unit {
    pub fn from_config(cfg: UnitConfig) -> Unit {
        Unit {
            name: cfg.name,
            instance: cfg.instance,
            version: cfg.version,
            kind: cfg.kind,
            ops: cfg.ops,
            crit_sect: cfg.crit_sect,
            cb_guess: cfg.guessed_size,
            called: false,
            done_live: false,
            off_stream: 0,
        }
    }

    /// Reset the transient per-operation state.
    pub fn reset_op_state(&mut self) {
        self.called = false;
        self.done_live = false;
        self.off_stream = 0;
    }

    /// Clone the scope guard for entry around a callback.  The guard must
    /// be dropped before the callback's return value is inspected.
    pub fn scope_guard(&self) -> Option<Arc<Mutex<()>>> {
        self.crit_sect.clone()
    }
}

/// Enter a unit's optional critical section.
pub(crate) fn enter_guard(cs: &Option<Arc<Mutex<()>>>) -> Option<MutexGuard<'_, ()>> {
    cs.as_ref()
        .map(|c| c.lock().unwrap_or_else(PoisonError::into_inner))
}
