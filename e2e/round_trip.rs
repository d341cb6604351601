//! E2E: whole-file save/load round trips.
//!
//! Exercises the full stack (registry, orchestration, record codec,
//! stream, on-disk layout) through the public API only.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use ssm::{
    MemBackend, Ssm, SsmAfter, SsmError, UnitConfig, UnitKind, UnitOps, SSM_PASS_FINAL,
};

fn unit_cfg(name: &str, version: u32, ops: UnitOps) -> UnitConfig {
    let mut cfg = UnitConfig::new(name, 0, version, UnitKind::Internal);
    cfg.ops = ops;
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: empty unit, exact file geometry
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn empty_unit_file_geometry() {
    let ssm = Ssm::new();
    let mut ops = UnitOps::default();
    ops.save_exec = Some(Box::new(|_h| Ok(())));
    ssm.register(unit_cfg("U", 1, ops)).unwrap();

    let be = MemBackend::new();
    ssm.save(Box::new(be.clone()), SsmAfter::Continue, None).unwrap();
    let wire = be.to_vec();

    // File header.
    assert_eq!(&wire[..5], b"\x7fVirt");
    assert_eq!(&wire[..32], b"\x7fVirtualBox SavedState V2.0\n\0\0\0\0");

    // The built-in "SSM" unit writes its string table; "U" writes nothing;
    // "SSMLiveControl" has no save-exec and is skipped entirely.
    let os = format!("{}.{}", std::env::consts::OS, std::env::consts::ARCH);
    let ssm_payload = 4 + (4 + 13) + (4 + os.len()); // count + key + value
    let ssm_unit = (44 + 4) + 2 + ssm_payload + 16; // hdr + RAW rec + term
    let u_unit = (44 + 2) + 16; // hdr + term only
    let tail = 44 + (16 + 2 * 16) + 32; // END hdr + 2-entry dir + footer
    assert_eq!(wire.len(), 64 + ssm_unit + u_unit + tail);

    // Footer magic sits exactly 32 bytes from the end.
    assert_eq!(&wire[wire.len() - 32..wire.len() - 24], b"\nFooter\0");

    // Load it back: the callback sees its registered version and an
    // immediate end of data.
    let ssm2 = Ssm::new();
    let seen = Arc::new(Mutex::new(None));
    let seen2 = Arc::clone(&seen);
    let mut ops = UnitOps::default();
    ops.load_exec = Some(Box::new(move |h, version, pass| {
        *seen2.lock().unwrap() = Some((version, pass));
        // The unit is empty: the very first get must say so.
        assert_eq!(h.get_u8(), Err(SsmError::LoadedTooMuch));
        Err(SsmError::LoadedTooMuch)
    }));
    let cfg = unit_cfg("U", 1, ops);
    ssm2.register(cfg).unwrap();
    let res = ssm2.load(
        Box::new(MemBackend::from_bytes(wire.clone())),
        SsmAfter::Resume,
        None,
    );
    assert_eq!(res, Err(SsmError::LoadedTooMuch));
    assert_eq!(*seen.lock().unwrap(), Some((1, SSM_PASS_FINAL)));

    // And the clean variant: a load-exec that reads nothing succeeds.
    let ssm3 = Ssm::new();
    let mut ops = UnitOps::default();
    ops.load_exec = Some(Box::new(|_h, version, _pass| {
        assert_eq!(version, 1);
        Ok(())
    }));
    ssm3.register(unit_cfg("U", 1, ops)).unwrap();
    ssm3.load(Box::new(MemBackend::from_bytes(wire)), SsmAfter::Resume, None)
        .unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: every scalar type round-trips
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn scalar_round_trip() {
    let ssm = Ssm::new();
    let mut ops = UnitOps::default();
    ops.save_exec = Some(Box::new(|h| {
        h.put_u8(0xab)?;
        h.put_i8(-5)?;
        h.put_u16(0xbeef)?;
        h.put_i16(-12345)?;
        h.put_u32(0xdead_beef)?;
        h.put_i32(i32::MIN)?;
        h.put_u64(u64::MAX - 1)?;
        h.put_i64(i64::MIN)?;
        h.put_u128(u128::MAX / 3)?;
        h.put_i128(-1)?;
        h.put_bool(true)?;
        h.put_bool(false)?;
        h.put_io_port(0x3f8)?;
        h.put_sel(0x28)?;
        h.put_rc_ptr(0x8000_0000)?;
        h.put_gc_phys(0xfedc_ba98_7654_3210)?;
        h.put_gc_ptr(0x0000_7fff_1234_5678)?;
        h.put_strz("unit data")?;
        h.put_strz("")?;
        h.put_mem(&[1, 2, 3, 4, 5])
    }));
    ssm.register(unit_cfg("scalars", 7, ops)).unwrap();

    let be = MemBackend::new();
    ssm.save(Box::new(be.clone()), SsmAfter::Continue, None).unwrap();

    let ssm2 = Ssm::new();
    let mut ops = UnitOps::default();
    ops.load_exec = Some(Box::new(|h, version, _pass| {
        assert_eq!(version, 7);
        assert_eq!(h.get_u8()?, 0xab);
        assert_eq!(h.get_i8()?, -5);
        assert_eq!(h.get_u16()?, 0xbeef);
        assert_eq!(h.get_i16()?, -12345);
        assert_eq!(h.get_u32()?, 0xdead_beef);
        assert_eq!(h.get_i32()?, i32::MIN);
        assert_eq!(h.get_u64()?, u64::MAX - 1);
        assert_eq!(h.get_i64()?, i64::MIN);
        assert_eq!(h.get_u128()?, u128::MAX / 3);
        assert_eq!(h.get_i128()?, -1);
        assert!(h.get_bool()?);
        assert!(!h.get_bool()?);
        assert_eq!(h.get_io_port()?, 0x3f8);
        assert_eq!(h.get_sel()?, 0x28);
        assert_eq!(h.get_rc_ptr()?, 0x8000_0000);
        assert_eq!(h.get_gc_phys()?, 0xfedc_ba98_7654_3210);
        assert_eq!(h.get_gc_ptr()?, 0x0000_7fff_1234_5678);
        assert_eq!(h.get_strz(64)?, "unit data");
        assert_eq!(h.get_strz(64)?, "");
        let mut m = [0u8; 5];
        h.get_mem(&mut m)?;
        assert_eq!(m, [1, 2, 3, 4, 5]);
        Ok(())
    }));
    ssm2.register(unit_cfg("scalars", 7, ops)).unwrap();
    ssm2.load(Box::new(MemBackend::from_bytes(be.to_vec())), SsmAfter::Resume, None)
        .unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: multi-unit ordering and per-unit isolation
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn units_are_saved_in_registration_order() {
    let ssm = Ssm::new();
    let order = Arc::new(Mutex::new(Vec::new()));
    for name in ["alpha", "bravo", "charlie"] {
        let order2 = Arc::clone(&order);
        let mut ops = UnitOps::default();
        ops.save_exec = Some(Box::new(move |h| {
            order2.lock().unwrap().push(name);
            h.put_strz(name)
        }));
        ssm.register(unit_cfg(name, 1, ops)).unwrap();
    }

    let be = MemBackend::new();
    ssm.save(Box::new(be.clone()), SsmAfter::Continue, None).unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["alpha", "bravo", "charlie"]);

    let loaded = Arc::new(Mutex::new(Vec::new()));
    let ssm2 = Ssm::new();
    for name in ["alpha", "bravo", "charlie"] {
        let loaded2 = Arc::clone(&loaded);
        let mut ops = UnitOps::default();
        ops.load_exec = Some(Box::new(move |h, _v, _p| {
            assert_eq!(h.get_strz(32)?, name);
            loaded2.lock().unwrap().push(name);
            Ok(())
        }));
        ssm2.register(unit_cfg(name, 1, ops)).unwrap();
    }
    ssm2.load(Box::new(MemBackend::from_bytes(be.to_vec())), SsmAfter::Resume, None)
        .unwrap();
    assert_eq!(*loaded.lock().unwrap(), vec!["alpha", "bravo", "charlie"]);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: file-backed round trip with prep/done bookkeeping
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn file_backed_round_trip_runs_all_phases() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("state.sav");

    let phases = Arc::new(AtomicU32::new(0));
    const PREP: u32 = 1;
    const EXEC: u32 = 2;
    const DONE: u32 = 4;

    let ssm = Ssm::new();
    let mut ops = UnitOps::default();
    let p1 = Arc::clone(&phases);
    ops.save_prep = Some(Box::new(move |_h| {
        p1.fetch_or(PREP, Ordering::SeqCst);
        Ok(())
    }));
    let p2 = Arc::clone(&phases);
    ops.save_exec = Some(Box::new(move |h| {
        p2.fetch_or(EXEC, Ordering::SeqCst);
        h.put_u64(42)
    }));
    let p3 = Arc::clone(&phases);
    ops.save_done = Some(Box::new(move |_h| {
        p3.fetch_or(DONE, Ordering::SeqCst);
        Ok(())
    }));
    ssm.register(unit_cfg("disk", 1, ops)).unwrap();

    let percents = Arc::new(Mutex::new(Vec::new()));
    let percents2 = Arc::clone(&percents);
    ssm.save_path(
        &path,
        SsmAfter::Continue,
        Some(Box::new(move |p| percents2.lock().unwrap().push(p))),
    )
    .unwrap();
    assert_eq!(phases.load(Ordering::SeqCst), PREP | EXEC | DONE);

    // Progress ended at 100 and never went backwards.
    let ps = percents.lock().unwrap().clone();
    assert_eq!(*ps.last().unwrap(), 100);
    assert!(ps.windows(2).all(|w| w[0] < w[1]));

    let ssm2 = Ssm::new();
    let mut ops = UnitOps::default();
    ops.load_exec = Some(Box::new(|h, _v, _p| {
        assert_eq!(h.get_u64()?, 42);
        Ok(())
    }));
    ssm2.register(unit_cfg("disk", 1, ops)).unwrap();
    ssm2.load_path(&path, SsmAfter::Resume, None).unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 5: directory-based open and unit seek
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn open_read_seeks_units_via_directory() {
    let ssm = Ssm::new();
    for (name, value) in [("first", 0x11u32), ("second", 0x22u32)] {
        let mut ops = UnitOps::default();
        ops.save_exec = Some(Box::new(move |h| h.put_u32(value)));
        ssm.register(unit_cfg(name, 3, ops)).unwrap();
    }
    let be = MemBackend::new();
    ssm.save(Box::new(be.clone()), SsmAfter::Continue, None).unwrap();

    let mut state = ssm::SavedState::open(Box::new(MemBackend::from_bytes(be.to_vec()))).unwrap();
    // Directory: "SSM" + the two user units.
    assert_eq!(state.unit_count(), 3);
    assert_eq!(state.saved_version().0, 2);

    // Seek out of order on purpose.
    let (version, pass) = state.seek_unit("second", 0).unwrap();
    assert_eq!((version, pass), (3, SSM_PASS_FINAL));
    assert_eq!(state.handle().get_u32().unwrap(), 0x22);

    let (version, _pass) = state.seek_unit("first", 0).unwrap();
    assert_eq!(version, 3);
    assert_eq!(state.handle().get_u32().unwrap(), 0x11);

    assert_eq!(
        state.seek_unit("missing", 0),
        Err(SsmError::UnitNotFound)
    );
    state.close().unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 6: instance numbering keeps same-named units apart
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn instances_round_trip_independently() {
    let ssm = Ssm::new();
    for instance in 0..3u32 {
        let mut cfg = UnitConfig::new("nic", instance, 1, UnitKind::Device);
        let mut ops = UnitOps::default();
        ops.save_exec = Some(Box::new(move |h| h.put_u32(instance * 1000)));
        cfg.ops = ops;
        ssm.register(cfg).unwrap();
    }
    let be = MemBackend::new();
    ssm.save(Box::new(be.clone()), SsmAfter::Continue, None).unwrap();

    let ssm2 = Ssm::new();
    for instance in 0..3u32 {
        let mut cfg = UnitConfig::new("nic", instance, 1, UnitKind::Device);
        let mut ops = UnitOps::default();
        ops.load_exec = Some(Box::new(move |h, _v, _p| {
            assert_eq!(h.get_u32()?, instance * 1000);
            Ok(())
        }));
        cfg.ops = ops;
        ssm2.register(cfg).unwrap();
    }
    ssm2.load(Box::new(MemBackend::from_bytes(be.to_vec())), SsmAfter::Resume, None)
        .unwrap();
}
