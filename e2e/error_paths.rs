//! E2E: failure taxonomy on the load path.
//!
//! Corruption at every layer must surface the specific integrity code,
//! registry mismatches their lookup codes, and sloppy callbacks the
//! "too much"/"too little" pair, with the debug-it disposition downgrading
//! only the unknown-unit case.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ssm::{MemBackend, Ssm, SsmAfter, SsmError, UnitConfig, UnitKind, UnitOps};

/// A file with one unit holding two u32 values.
fn sample_file() -> Vec<u8> {
    let ssm = Ssm::new();
    let mut cfg = UnitConfig::new("pair", 0, 1, UnitKind::Internal);
    let mut ops = UnitOps::default();
    ops.save_exec = Some(Box::new(|h| {
        h.put_u32(0x1111)?;
        h.put_u32(0x2222)
    }));
    cfg.ops = ops;
    ssm.register(cfg).unwrap();
    let be = MemBackend::new();
    ssm.save(Box::new(be.clone()), SsmAfter::Continue, None).unwrap();
    be.to_vec()
}

fn load_with(
    wire: Vec<u8>,
    after: SsmAfter,
    reader: impl Fn(&mut ssm::SsmHandle) -> ssm::SsmResult<()> + Send + 'static,
) -> ssm::SsmResult<()> {
    let ssm = Ssm::new();
    let mut cfg = UnitConfig::new("pair", 0, 1, UnitKind::Internal);
    let mut ops = UnitOps::default();
    ops.load_exec = Some(Box::new(move |h, _v, _p| reader(h)));
    cfg.ops = ops;
    ssm.register(cfg).unwrap();
    ssm.load(Box::new(MemBackend::from_bytes(wire)), after, None)
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: header-level corruption
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn bad_magic_and_bad_header_crc() {
    let wire = sample_file();

    let mut bad = wire.clone();
    bad[3] = b'X';
    assert_eq!(
        load_with(bad, SsmAfter::Resume, |_| Ok(())),
        Err(SsmError::IntegrityMagic)
    );

    let mut bad = wire;
    bad[50] ^= 0x01; // inside the unit-count field, under the header CRC
    assert_eq!(
        load_with(bad, SsmAfter::Resume, |_| Ok(())),
        Err(SsmError::IntegrityCrc)
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: unit-header corruption
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn corrupt_unit_header() {
    let wire = sample_file();
    // First unit header follows the 64-byte file header ("SSM" unit).
    let mut bad = wire.clone();
    bad[64] = b'X';
    assert_eq!(
        load_with(bad, SsmAfter::Resume, |_| Ok(())),
        Err(SsmError::IntegrityUnitMagic)
    );

    // Flip a field under the unit-header CRC (the version word).
    let mut bad = wire;
    bad[64 + 24] ^= 0xff;
    assert_eq!(
        load_with(bad, SsmAfter::Resume, |_| Ok(())),
        Err(SsmError::IntegrityUnit)
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: registry mismatches
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn unknown_unit_is_fatal_except_in_debug_mode() {
    let wire = sample_file();

    // Fresh registry without "pair".
    let ssm = Ssm::new();
    assert_eq!(
        ssm.load(
            Box::new(MemBackend::from_bytes(wire.clone())),
            SsmAfter::Resume,
            None
        ),
        Err(SsmError::UnitNotFound)
    );

    // Debug-it skips the unknown payload and succeeds.
    let ssm = Ssm::new();
    ssm.load(Box::new(MemBackend::from_bytes(wire.clone())), SsmAfter::Debug, None)
        .unwrap();

    // A unit with no load-exec is its own error.
    let ssm = Ssm::new();
    let cfg = UnitConfig::new("pair", 0, 1, UnitKind::Internal);
    ssm.register(cfg).unwrap();
    assert_eq!(
        ssm.load(Box::new(MemBackend::from_bytes(wire)), SsmAfter::Resume, None),
        Err(SsmError::NoLoadExec)
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: too much / too little
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn loaded_too_much_and_too_little() {
    let wire = sample_file();

    assert_eq!(
        load_with(wire.clone(), SsmAfter::Resume, |h| {
            h.get_u32()?;
            h.get_u32()?;
            h.get_u32()?; // one too many
            Ok(())
        }),
        Err(SsmError::LoadedTooMuch)
    );

    assert_eq!(
        load_with(wire.clone(), SsmAfter::Resume, |h| {
            h.get_u32()?; // one too few
            Ok(())
        }),
        Err(SsmError::LoadedTooLittle)
    );

    // skip() bridges the gap.
    load_with(wire, SsmAfter::Resume, |h| {
        h.get_u32()?;
        h.skip(4)
    })
    .unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 5: footer/tail corruption
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn corrupt_tail_is_detected() {
    let wire = sample_file();

    // Footer CRC.
    let mut bad = wire.clone();
    let n = bad.len();
    bad[n - 12] ^= 0x01; // directory-entry-count field of the footer
    assert_eq!(
        load_with(bad, SsmAfter::Resume, |h| {
            h.get_u32()?;
            h.get_u32()?;
            Ok(())
        }),
        Err(SsmError::IntegrityFooter)
    );

    // Directory CRC.
    let mut bad = wire.clone();
    let n = bad.len();
    // Last directory entry's name-CRC field sits just before the footer.
    bad[n - 36] ^= 0x01;
    assert_eq!(
        load_with(bad, SsmAfter::Resume, |h| {
            h.get_u32()?;
            h.get_u32()?;
            Ok(())
        }),
        Err(SsmError::IntegrityDir)
    );

    // Truncated file: the sequential reader runs off the end.
    let mut bad = wire;
    bad.truncate(bad.len() - 40);
    let res = load_with(bad, SsmAfter::Resume, |h| {
        h.get_u32()?;
        h.get_u32()?;
        Ok(())
    });
    assert!(res.is_err(), "truncation must fail the load: {res:?}");
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 6: callback errors keep their message and still run the done phase
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn callback_config_error_is_reported_and_done_runs() {
    let wire = sample_file();
    let done_ran = Arc::new(AtomicBool::new(false));

    let ssm = Ssm::new();
    let mut cfg = UnitConfig::new("pair", 0, 1, UnitKind::Internal);
    let mut ops = UnitOps::default();
    ops.load_exec = Some(Box::new(|h, _v, _p| {
        let first = h.get_u32()?;
        if first != 0x9999 {
            return Err(h.set_config_error("expected RAM size 0x9999"));
        }
        Ok(())
    }));
    let done2 = Arc::clone(&done_ran);
    ops.load_done = Some(Box::new(move |_h| {
        done2.fetch_or(true, Ordering::SeqCst);
        Ok(())
    }));
    cfg.ops = ops;
    ssm.register(cfg).unwrap();

    assert_eq!(
        ssm.load(Box::new(MemBackend::from_bytes(wire)), SsmAfter::Resume, None),
        Err(SsmError::LoadConfigMismatch)
    );
    assert!(done_ran.load(Ordering::SeqCst), "done phase runs after failure");
}
