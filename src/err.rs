//! Status codes surfaced across the saved-state engine boundary.
//!
//! Everything in this crate is status-code driven: callbacks, the stream
//! layer and the orchestrator all return [`SsmResult`], failures stick to
//! the owning handle, and no panic is ever used as control flow.
//!
//! Informational callback outcomes (live-save votes, "don't call me again")
//! are *not* errors; they travel as `Ok` payloads: see [`Vote`] and
//! [`LiveExecFlow`].

use thiserror::Error;

/// Result alias used throughout the crate.
pub type SsmResult<T> = Result<T, SsmError>;

// ─────────────────────────────────────────────────────────────────────────────
// Error codes
// ─────────────────────────────────────────────────────────────────────────────

/// Saved-state engine error codes.
///
/// The names are contract: callers match on them, and the integrity
/// variants identify exactly which layer of the file rejected the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum SsmError {
    /// The operation was cancelled from another thread.
    #[error("operation cancelled")]
    Cancelled,
    /// The operation has already been cancelled once.
    #[error("operation already cancelled")]
    AlreadyCancelled,
    /// Cancel was requested while no save/load operation is in progress.
    #[error("no pending save or load operation")]
    NoPendingOperation,

    /// A data unit in the file has no registered counterpart.
    #[error("data unit not found in the registry")]
    UnitNotFound,
    /// A unit with the same name and instance is already registered.
    #[error("data unit already registered")]
    UnitExists,
    /// The registered unit has no load-exec callback but the file contains data for it.
    #[error("data unit has no load-exec callback")]
    NoLoadExec,
    /// The unit version in the file is not supported by the registered unit.
    #[error("unsupported data unit version")]
    UnsupportedDataUnitVersion,
    /// The saved state does not match the current configuration.
    #[error("saved state is incompatible with the current configuration")]
    LoadConfigMismatch,
    /// A load callback read past the end of its unit data.
    #[error("unit read past its end of data")]
    LoadedTooMuch,
    /// A load callback left unread bytes in its unit data.
    #[error("unit finished with unread data left")]
    LoadedTooLittle,

    // ── Integrity (always fatal, never recovered) ────────────────────────────
    /// Bad file magic.
    #[error("integrity: bad file magic")]
    IntegrityMagic,
    /// Unsupported or malformed format version.
    #[error("integrity: bad format version")]
    IntegrityVersion,
    /// Malformed file header.
    #[error("integrity: bad file header")]
    IntegrityHeader,
    /// CRC-32 mismatch.
    #[error("integrity: CRC mismatch")]
    IntegrityCrc,
    /// Bad unit-header magic.
    #[error("integrity: bad unit magic")]
    IntegrityUnitMagic,
    /// Malformed unit header.
    #[error("integrity: bad unit header")]
    IntegrityUnit,
    /// Bad directory magic.
    #[error("integrity: bad directory magic")]
    IntegrityDirMagic,
    /// Malformed directory.
    #[error("integrity: bad directory")]
    IntegrityDir,
    /// Malformed record header.
    #[error("integrity: bad record header")]
    IntegrityRecHdr,
    /// Malformed termination record.
    #[error("integrity: bad termination record")]
    IntegrityRecTerm,
    /// Termination-record stream CRC mismatch.
    #[error("integrity: termination record CRC mismatch")]
    IntegrityRecTermCrc,
    /// A compressed record failed to decompress to its declared size.
    #[error("integrity: decompression failure")]
    IntegrityDecompression,
    /// Malformed saved-binary version words in a header.
    #[error("integrity: bad saved-binary version")]
    IntegrityBuildVersion,
    /// A size field is out of range.
    #[error("integrity: size out of range")]
    IntegritySize,
    /// Malformed or missing footer.
    #[error("integrity: bad footer")]
    IntegrityFooter,

    // ── Struct-field transformer ─────────────────────────────────────────────
    /// A field descriptor reaches outside the struct.
    #[error("struct field out of bounds")]
    FieldOutOfBounds,
    /// Field descriptors leave a gap although full coverage was requested.
    #[error("struct fields are not consecutive")]
    FieldNotConsecutive,
    /// A field descriptor's size does not fit its transformation.
    #[error("struct field has an invalid size")]
    FieldInvalidSize,
    /// A field value cannot be represented on the wire.
    #[error("struct field has an invalid value")]
    FieldInvalidValue,
    /// A padding descriptor's sizes are inconsistent.
    #[error("struct field has an invalid padding size")]
    FieldInvalidPaddingSize,
    /// A custom-processing field was passed to the simple struct API.
    #[error("struct field requires custom processing")]
    FieldComplex,
    /// A load-only field transformation was used on the save path.
    #[error("struct field transformation is load-only")]
    FieldLoadOnlyTransformation,
    /// A field callback misbehaved.
    #[error("struct field callback is invalid")]
    FieldInvalidCallback,

    // ── Width adaptation ─────────────────────────────────────────────────────
    /// A saved guest-physical address does not fit the host width.
    #[error("guest-physical address overflows the host width")]
    GcPhysOverflow,
    /// A saved guest pointer does not fit the host width.
    #[error("guest pointer overflows the host width")]
    GcPtrOverflow,

    // ── Live save ────────────────────────────────────────────────────────────
    /// The live stream exceeded its growth limit.
    #[error("live saved state grew too big")]
    StateGrewTooBig,
    /// The live pass counter hit its cap without convergence.
    #[error("too many live passes")]
    TooManyPasses,
    /// A live-vote callback asked to abandon the live save.
    #[error("live vote asked for giving up")]
    VoteForGivingUp,

    // ── Stream / misc ────────────────────────────────────────────────────────
    /// The target volume has less than the required free space.
    #[error("low on disk space")]
    LowOnDiskSpace,
    /// Generic stream failure (sticky; see the stream's first error).
    #[error("stream error")]
    StreamError,
    /// A skip request went backwards.
    #[error("cannot skip backwards")]
    SkipBackwards,
    /// An argument failed validation.
    #[error("invalid parameter")]
    InvalidParameter,
    /// Backend I/O failure.
    #[error("i/o error: {0:?}")]
    Io(std::io::ErrorKind),
}

impl From<std::io::Error> for SsmError {
    fn from(e: std::io::Error) -> Self {
        SsmError::Io(e.kind())
    }
}

impl SsmError {
    /// True for the always-fatal integrity tier.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            SsmError::IntegrityMagic
                | SsmError::IntegrityVersion
                | SsmError::IntegrityHeader
                | SsmError::IntegrityCrc
                | SsmError::IntegrityUnitMagic
                | SsmError::IntegrityUnit
                | SsmError::IntegrityDirMagic
                | SsmError::IntegrityDir
                | SsmError::IntegrityRecHdr
                | SsmError::IntegrityRecTerm
                | SsmError::IntegrityRecTermCrc
                | SsmError::IntegrityDecompression
                | SsmError::IntegrityBuildVersion
                | SsmError::IntegritySize
                | SsmError::IntegrityFooter
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Informational callback outcomes
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of a live-exec callback round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LiveExecFlow {
    /// Call this unit again in the next pass.
    #[default]
    CallAgain,
    /// The unit has transferred everything it intends to transfer live.
    DontCallAgain,
}

/// Outcome of a live-vote callback round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Vote {
    /// The unit is ready for the final stop-the-world step.
    #[default]
    Ready,
    /// The unit wants at least one more pre-copy pass.
    AnotherPass,
    /// Ready, and the unit's vote callback need not be polled again.
    DoneDontCallAgain,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrity_tier_is_closed() {
        assert!(SsmError::IntegrityMagic.is_integrity());
        assert!(SsmError::IntegrityFooter.is_integrity());
        assert!(!SsmError::Cancelled.is_integrity());
        assert!(!SsmError::GcPhysOverflow.is_integrity());
        assert!(!SsmError::Io(std::io::ErrorKind::UnexpectedEof).is_integrity());
    }

    #[test]
    fn io_error_conversion_keeps_kind() {
        let e: SsmError = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert_eq!(e, SsmError::Io(std::io::ErrorKind::NotFound));
    }
}
