//! E2E: struct descriptors through full save/load operations.
//!
//! The version-gating scenario: a unit registered at version 3 saves a
//! struct whose newest field only exists from version 4 on; loading the
//! version-3 file must leave that field untouched, while a version-4
//! save/load moves both.

use std::sync::{Arc, Mutex};

use ssm::{
    FieldXfer, MemBackend, Ssm, SsmAfter, SsmField, UnitConfig, UnitKind, UnitOps,
    STRUCT_FULL_STRUCT,
};

// The device state under test, laid out as raw bytes:
//   0..4   u32 foo   (present since unit version 2)
//   4..8   u32 bar   (present since unit version 4)
const CB_STATE: usize = 8;

fn fields() -> Vec<SsmField> {
    vec![
        SsmField::since(FieldXfer::Copy, 0, 4, 2, "foo"),
        SsmField::since(FieldXfer::Copy, 4, 4, 4, "bar"),
    ]
}

fn save_state(version: u32, state: [u8; CB_STATE]) -> Vec<u8> {
    let ssm = Ssm::new();
    let mut cfg = UnitConfig::new("dev", 0, version, UnitKind::Device);
    let mut ops = UnitOps::default();
    ops.save_exec = Some(Box::new(move |h| h.put_struct_ext(&state, &fields(), 0)));
    cfg.ops = ops;
    ssm.register(cfg).unwrap();
    let be = MemBackend::new();
    ssm.save(Box::new(be.clone()), SsmAfter::Continue, None).unwrap();
    be.to_vec()
}

fn load_state(version: u32, wire: Vec<u8>) -> [u8; CB_STATE] {
    let out = Arc::new(Mutex::new([0xffu8; CB_STATE]));
    let out2 = Arc::clone(&out);
    let ssm = Ssm::new();
    let mut cfg = UnitConfig::new("dev", 0, version, UnitKind::Device);
    let mut ops = UnitOps::default();
    ops.load_exec = Some(Box::new(move |h, _v, _p| {
        let mut state = *out2.lock().unwrap();
        h.get_struct_ext(&mut state, &fields(), 0)?;
        *out2.lock().unwrap() = state;
        Ok(())
    }));
    cfg.ops = ops;
    ssm.register(cfg).unwrap();
    ssm.load(Box::new(MemBackend::from_bytes(wire)), SsmAfter::Resume, None)
        .unwrap();
    let result = *out.lock().unwrap();
    result
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: version-3 file: foo travels, bar stays untouched
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn version_3_skips_younger_field() {
    let mut state = [0u8; CB_STATE];
    state[0..4].copy_from_slice(&0x1111_1111u32.to_le_bytes());
    state[4..8].copy_from_slice(&0x2222_2222u32.to_le_bytes());

    let wire = save_state(3, state);
    let loaded = load_state(3, wire);
    assert_eq!(&loaded[0..4], &0x1111_1111u32.to_le_bytes());
    // bar was neither saved nor loaded; memory keeps its prior contents.
    assert_eq!(&loaded[4..8], &[0xff; 4]);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: version-4 file: both fields travel
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn version_4_moves_both_fields() {
    let mut state = [0u8; CB_STATE];
    state[0..4].copy_from_slice(&0x1111_1111u32.to_le_bytes());
    state[4..8].copy_from_slice(&0x2222_2222u32.to_le_bytes());

    let wire = save_state(4, state);
    let loaded = load_state(4, wire);
    assert_eq!(loaded, state);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: full transform mix inside a real operation
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn transform_mix_round_trips() {
    // 0..8 counter, 8..16 gc_phys, 16..24 host ptr (scrubbed), 24..32 wide
    // (u32 on the wire), 32..40 ignored scratch.
    const CB: usize = 40;
    let ptr_cb = std::mem::size_of::<usize>();
    assert_eq!(ptr_cb, 8, "test layout assumes a 64-bit build");

    fn mix_fields() -> Vec<SsmField> {
        vec![
            SsmField::new(FieldXfer::Copy, 0, 8, "counter"),
            SsmField::new(FieldXfer::GCPhys, 8, 8, "base"),
            SsmField::new(FieldXfer::HCPtrNi, 16, 8, "owner"),
            SsmField::new(FieldXfer::U32ZxU64, 24, 8, "wide"),
            SsmField::new(FieldXfer::Ignore, 32, 8, "scratch"),
        ]
    }

    let mut state = [0u8; CB];
    state[0..8].copy_from_slice(&0x0102_0304_0506_0708u64.to_le_bytes());
    state[8..16].copy_from_slice(&0x0000_0000_9000_0000u64.to_le_bytes());
    state[16..24].copy_from_slice(&0x7f00_0000_0000_1234u64.to_le_bytes());
    state[24..32].copy_from_slice(&0x0000_0000_0abc_def0u64.to_le_bytes());
    state[32..40].copy_from_slice(&u64::MAX.to_le_bytes());

    let ssm = Ssm::new();
    let mut cfg = UnitConfig::new("mix", 0, 1, UnitKind::Device);
    let mut ops = UnitOps::default();
    ops.save_exec = Some(Box::new(move |h| {
        // U32ZxU64 cannot be saved; emit the wire form by hand between the
        // other descriptor-driven fields.
        let all = mix_fields();
        h.put_struct_ext(&state, &all[..3], ssm::STRUCT_NO_TAIL_MARKER)?;
        h.put_u32(0x0abc_def0)?;
        h.put_u32(ssm::data::STRUCT_MARKER_END)
    }));
    cfg.ops = ops;
    ssm.register(cfg).unwrap();
    let be = MemBackend::new();
    ssm.save(Box::new(be.clone()), SsmAfter::Continue, None).unwrap();

    let ssm2 = Ssm::new();
    let mut cfg = UnitConfig::new("mix", 0, 1, UnitKind::Device);
    let mut ops = UnitOps::default();
    ops.load_exec = Some(Box::new(move |h, _v, _p| {
        let mut loaded = [0x55u8; CB];
        h.get_struct_ext(&mut loaded, &mix_fields(), 0)?;
        assert_eq!(loaded[0..8], state[0..8]);
        assert_eq!(loaded[8..16], state[8..16]);
        assert_eq!(loaded[16..24], [0u8; 8], "pointer scrubbed");
        assert_eq!(loaded[24..32], state[24..32]);
        assert_eq!(loaded[32..40], [0x55; 8], "ignored field untouched");
        Ok(())
    }));
    cfg.ops = ops;
    ssm2.register(cfg).unwrap();
    ssm2.load(Box::new(MemBackend::from_bytes(be.to_vec())), SsmAfter::Resume, None)
        .unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: full-struct coverage enforcement inside an operation
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn full_struct_gap_fails_the_save() {
    let ssm = Ssm::new();
    let mut cfg = UnitConfig::new("gappy", 0, 1, UnitKind::Internal);
    let mut ops = UnitOps::default();
    ops.save_exec = Some(Box::new(|h| {
        let fields = [
            SsmField::new(FieldXfer::Copy, 0, 4, "a"),
            SsmField::new(FieldXfer::Copy, 8, 4, "b"),
        ];
        h.put_struct_ext(&[0u8; 12], &fields, STRUCT_FULL_STRUCT)
    }));
    cfg.ops = ops;
    ssm.register(cfg).unwrap();
    let res = ssm.save(Box::new(MemBackend::new()), SsmAfter::Continue, None);
    assert_eq!(res, Err(ssm::SsmError::FieldNotConsecutive));
}
