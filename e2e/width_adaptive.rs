//! E2E: width-adaptive integer types across host configurations.
//!
//! Saves are made with one host description and loaded with another; the
//! engine must widen, narrow-with-check, or fail with the overflow codes;
//! never silently truncate.

use ssm::{HostCfg, MemBackend, Ssm, SsmAfter, SsmError, UnitConfig, UnitKind, UnitOps};

fn host64() -> HostCfg {
    HostCfg {
        bits: 64,
        cb_gc_phys: 8,
        cb_gc_ptr: 8,
        ..HostCfg::default()
    }
}

fn host32() -> HostCfg {
    HostCfg {
        bits: 32,
        cb_gc_phys: 4,
        cb_gc_ptr: 4,
        ..HostCfg::default()
    }
}

fn save_gc_values(host: HostCfg, phys: u64, ptr: u64) -> Vec<u8> {
    let ssm = Ssm::with_host(host);
    let mut cfg = UnitConfig::new("mmu", 0, 1, UnitKind::Internal);
    let mut ops = UnitOps::default();
    ops.save_exec = Some(Box::new(move |h| {
        h.put_gc_phys(phys)?;
        h.put_gc_ptr(ptr)
    }));
    cfg.ops = ops;
    ssm.register(cfg).unwrap();
    let be = MemBackend::new();
    ssm.save(Box::new(be.clone()), SsmAfter::Continue, None).unwrap();
    be.to_vec()
}

fn load_gc_values(
    host: HostCfg,
    wire: Vec<u8>,
    check: impl Fn(&mut ssm::SsmHandle) -> ssm::SsmResult<()> + Send + 'static,
) -> ssm::SsmResult<()> {
    let ssm = Ssm::with_host(host);
    let mut cfg = UnitConfig::new("mmu", 0, 1, UnitKind::Internal);
    let mut ops = UnitOps::default();
    ops.load_exec = Some(Box::new(move |h, _v, _p| check(h)));
    cfg.ops = ops;
    ssm.register(cfg).unwrap();
    ssm.load(Box::new(MemBackend::from_bytes(wire)), SsmAfter::Resume, None)
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: wide value saved on 64-bit, loaded on 32-bit → overflow
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn wide_gc_phys_overflows_on_narrow_host() {
    let wire = save_gc_values(host64(), 0x1_0000_0000_0000, 0);
    let res = load_gc_values(host32(), wire, |h| {
        h.get_gc_phys()?;
        Ok(())
    });
    assert_eq!(res, Err(SsmError::GcPhysOverflow));
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: narrow value saved on 64-bit loads fine on 32-bit
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn narrow_gc_phys_loads_on_narrow_host() {
    let wire = save_gc_values(host64(), 0xdead_beef, 0x00ca_fe00);
    load_gc_values(host32(), wire, |h| {
        assert_eq!(h.get_gc_phys()?, 0xdead_beef);
        assert_eq!(h.get_gc_ptr()?, 0x00ca_fe00);
        Ok(())
    })
    .unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: 32-bit saves widen on 64-bit hosts
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn narrow_save_widens_on_wide_host() {
    let wire = save_gc_values(host32(), 0xffff_ffff, 0x8000_0001);
    load_gc_values(host64(), wire, |h| {
        assert_eq!(h.get_gc_phys()?, 0xffff_ffff);
        assert_eq!(h.get_gc_ptr()?, 0x8000_0001);
        Ok(())
    })
    .unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: gc-ptr overflow is distinct from gc-phys overflow
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn wide_gc_ptr_overflows_with_its_own_code() {
    let wire = save_gc_values(host64(), 0, 0x7fff_0000_0000);
    let res = load_gc_values(host32(), wire, |h| {
        h.get_gc_phys()?;
        h.get_gc_ptr()?;
        Ok(())
    });
    assert_eq!(res, Err(SsmError::GcPtrOverflow));
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 5: saving a wide value on a narrow host is refused at put time
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn narrow_host_refuses_wide_put() {
    let ssm = Ssm::with_host(host32());
    let mut cfg = UnitConfig::new("mmu", 0, 1, UnitKind::Internal);
    let mut ops = UnitOps::default();
    ops.save_exec = Some(Box::new(|h| h.put_gc_phys(0x1_0000_0000)));
    cfg.ops = ops;
    ssm.register(cfg).unwrap();
    let res = ssm.save(Box::new(MemBackend::new()), SsmAfter::Continue, None);
    assert_eq!(res, Err(SsmError::GcPhysOverflow));
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 6: header advertises the saving host's widths
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn header_records_host_widths() {
    let wire = save_gc_values(host32(), 1, 1);
    // Offsets 44..47: host bits, GC-phys size, GC-ptr size.
    assert_eq!(wire[44], 32);
    assert_eq!(wire[45], 4);
    assert_eq!(wire[46], 4);

    let wire = save_gc_values(host64(), 1, 1);
    assert_eq!(wire[44], 64);
    assert_eq!(wire[45], 8);
    assert_eq!(wire[46], 8);
}
