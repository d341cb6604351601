//! E2E: record-type selection on the wire.
//!
//! Walks the raw bytes of a saved file to assert that big puts are split
//! into 4 KiB blocks emitted as RAW_LZF / RAW_ZERO / RAW exactly as the
//! data dictates, and that loading reassembles them bit for bit.

use ssm::{MemBackend, Ssm, SsmAfter, UnitConfig, UnitKind, UnitOps};

const REC_TYPE_TERM: u8 = 1;
const REC_TYPE_RAW: u8 = 2;
const REC_TYPE_RAW_LZF: u8 = 3;
const REC_TYPE_RAW_ZERO: u8 = 4;

/// Decode one UTF-8-style size prefix; returns (value, bytes consumed).
fn decode_size(b: &[u8]) -> (usize, usize) {
    let b0 = b[0];
    let follow = match b0.leading_ones() {
        0 => 0,
        n => (n - 1) as usize,
    };
    let mut v = usize::from(b0 & (0x7f >> follow));
    for &x in &b[1..1 + follow] {
        assert_eq!(x & 0xc0, 0x80, "continuation tag");
        v = (v << 6) | usize::from(x & 0x3f);
    }
    (v, 1 + follow)
}

/// Walk a saved file; returns (unit name, record types) pairs in order.
fn walk_units(wire: &[u8]) -> Vec<(String, Vec<(u8, usize)>)> {
    let mut out = Vec::new();
    let mut off = 64; // file header
    loop {
        let magic = &wire[off..off + 8];
        if magic == b"\nTheEnd\0" {
            break;
        }
        assert_eq!(magic, b"\nUnit\n\0\0", "unit magic at {off}");
        let cb_name =
            u32::from_le_bytes(wire[off + 40..off + 44].try_into().unwrap()) as usize;
        let name =
            String::from_utf8(wire[off + 44..off + 44 + cb_name - 1].to_vec()).unwrap();
        off += 44 + cb_name;

        let mut recs = Vec::new();
        loop {
            let taf = wire[off];
            assert_ne!(taf & 0x80, 0, "record marker bit");
            let ty = taf & 0x0f;
            if ty == REC_TYPE_TERM {
                recs.push((ty, 14));
                off += 16;
                break;
            }
            let (cb, used) = decode_size(&wire[off + 1..]);
            recs.push((ty, cb));
            off += 1 + used + cb;
        }
        out.push((name, recs));
    }
    out
}

fn save_one_unit(payload: Vec<u8>) -> Vec<u8> {
    let ssm = Ssm::new();
    let mut cfg = UnitConfig::new("blob", 0, 1, UnitKind::Internal);
    let mut ops = UnitOps::default();
    ops.save_exec = Some(Box::new(move |h| h.put_mem(&payload)));
    cfg.ops = ops;
    ssm.register(cfg).unwrap();

    let be = MemBackend::new();
    ssm.save(Box::new(be.clone()), SsmAfter::Continue, None).unwrap();
    be.to_vec()
}

fn load_one_unit(wire: Vec<u8>, expected: Vec<u8>) {
    let ssm = Ssm::new();
    let mut cfg = UnitConfig::new("blob", 0, 1, UnitKind::Internal);
    let mut ops = UnitOps::default();
    ops.load_exec = Some(Box::new(move |h, _v, _p| {
        let mut out = vec![0u8; expected.len()];
        h.get_mem(&mut out)?;
        assert_eq!(out, expected);
        Ok(())
    }));
    cfg.ops = ops;
    ssm.register(cfg).unwrap();
    ssm.load(Box::new(MemBackend::from_bytes(wire)), SsmAfter::Resume, None)
        .unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: compressible half + zero half → one LZF record, one ZERO record
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn lzf_and_zero_selection() {
    let mut payload = vec![0u8; 8192];
    for (i, b) in payload[..4096].iter_mut().enumerate() {
        *b = (i % 256) as u8;
    }
    // Second half stays zero.
    let wire = save_one_unit(payload.clone());

    let units = walk_units(&wire);
    let (_, recs) = units.iter().find(|(n, _)| n == "blob").unwrap();
    assert_eq!(recs.len(), 3);
    let (ty0, cb0) = recs[0];
    assert_eq!(ty0, REC_TYPE_RAW_LZF);
    assert!(cb0 < 4096, "first half must have compressed");
    assert_eq!(recs[1], (REC_TYPE_RAW_ZERO, 1));
    assert_eq!(recs[2].0, REC_TYPE_TERM);

    load_one_unit(wire, payload);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: incompressible block falls back to RAW at full size
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn incompressible_block_stays_raw() {
    let mut payload = vec![0u8; 4096];
    let mut x: u32 = 0xc0ff_ee00;
    for b in payload.iter_mut() {
        x = x.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        *b = (x >> 24) as u8;
    }
    let wire = save_one_unit(payload.clone());

    let units = walk_units(&wire);
    let (_, recs) = units.iter().find(|(n, _)| n == "blob").unwrap();
    assert_eq!(recs[0], (REC_TYPE_RAW, 4096));

    load_one_unit(wire, payload);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: all-zero megabyte collapses to ZERO records only
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn zero_megabyte_collapses() {
    let payload = vec![0u8; 1024 * 1024];
    let wire = save_one_unit(payload.clone());

    let units = walk_units(&wire);
    let (_, recs) = units.iter().find(|(n, _)| n == "blob").unwrap();
    // 256 zero blocks plus the terminator.
    assert_eq!(recs.len(), 257);
    assert!(recs[..256].iter().all(|&(ty, cb)| ty == REC_TYPE_RAW_ZERO && cb == 1));

    // The whole unit costs ~3 bytes per 4 KiB block on the wire.
    assert!(wire.len() < 2048, "zero data must not inflate the file");

    load_one_unit(wire, payload);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: small puts coalesce; flush boundary produces plain RAW records
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn coalesced_small_puts_form_single_raw_record() {
    let ssm = Ssm::new();
    let mut cfg = UnitConfig::new("blob", 0, 1, UnitKind::Internal);
    let mut ops = UnitOps::default();
    ops.save_exec = Some(Box::new(|h| {
        for i in 0..200u32 {
            h.put_u32(i)?;
        }
        Ok(())
    }));
    cfg.ops = ops;
    ssm.register(cfg).unwrap();
    let be = MemBackend::new();
    ssm.save(Box::new(be.clone()), SsmAfter::Continue, None).unwrap();

    let wire = be.to_vec();
    let units = walk_units(&wire);
    let (_, recs) = units.iter().find(|(n, _)| n == "blob").unwrap();
    assert_eq!(recs.len(), 2);
    assert_eq!(recs[0], (REC_TYPE_RAW, 800));
    assert_eq!(recs[1].0, REC_TYPE_TERM);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 5: byte-mixed workload survives odd sizes across block boundaries
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn odd_sized_mixed_workload_round_trips() {
    let mut payload = Vec::new();
    for i in 0..30_000usize {
        payload.push((i % 89) as u8);
    }
    payload.extend(std::iter::repeat(0u8).take(9_999));
    for i in 0..5_000usize {
        payload.push((i * 31 % 256) as u8);
    }
    let wire = save_one_unit(payload.clone());
    load_one_unit(wire, payload);
}
