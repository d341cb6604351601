// Saved-state manager: streaming VM snapshot engine.

pub mod data;
pub mod err;
pub mod fmt;
pub mod handle;
pub mod load;
pub mod lzf;
pub mod mgr;
pub mod rec;
pub mod save;
pub mod strm;
pub mod unit;

// ─────────────────────────────────────────────────────────────────────────────
// Top-level convenience re-exports for the most common API entry points.
// ─────────────────────────────────────────────────────────────────────────────

/// The saved-state manager: unit registry plus save/load/cancel.
pub use mgr::Ssm;
/// A live save in flight (step 1 / step 2 driver).
pub use save::LiveSave;
/// A file opened for directory-based inspection.
pub use load::SavedState;
/// Operation context handed to every unit callback.
pub use handle::SsmHandle;

/// Status codes and result alias.
pub use err::{LiveExecFlow, SsmError, SsmResult, Vote};

/// Registration surface.
pub use unit::{
    LiveExecFn, LiveVoteFn, LoadExecFn, PrepFn, SaveExecFn, UnitConfig, UnitKind, UnitOps,
};

/// Operation parameters and host description.
pub use handle::{HostCfg, ProgressFn, SsmAfter, SsmOp};

/// Backend seam: local file, in-memory, or bring your own.
pub use strm::{FileBackend, MemBackend, SeekMethod, StrmBackend};

/// Struct-transform descriptors.
pub use data::{
    FieldAccess, FieldXfer, FieldXferFn, SsmField, STRUCT_DONT_IGNORE, STRUCT_FULL_STRUCT,
    STRUCT_NO_LEAD_MARKER, STRUCT_NO_MARKERS, STRUCT_NO_TAIL_MARKER,
};

/// On-disk constants callers may need (final-pass marker, magics).
pub use fmt::SSM_PASS_FINAL;

// ─────────────────────────────────────────────────────────────────────────────
// Build identity
// ─────────────────────────────────────────────────────────────────────────────

/// Version triple of this crate, stamped into every file header.
pub fn build_version() -> (u16, u16, u32) {
    let major = env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0);
    let minor = env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0);
    let patch = env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0);
    (major, minor, patch)
}

#[cfg(test)]
mod tests {
    #[test]
    fn build_version_matches_manifest() {
        let (major, minor, _patch) = super::build_version();
        assert_eq!(major, 2);
        assert_eq!(minor, 0);
    }
}
