//! E2E: legacy v1.x load support.
//!
//! No writer exists for this generation, so the tests synthesize files
//! byte by byte: 64-byte header with a whole-file CRC and an all-zero
//! machine UUID, simple unit headers, LZF block streams, end marker.

use ssm::lzf::lzf_compress;
use ssm::{MemBackend, Ssm, SsmAfter, SsmError, UnitConfig, UnitKind, UnitOps};

const MAGIC_V1_1: &[u8; 32] = b"\x7fVirtualBox SavedState V1.1\n\0\0\0\0";
const MAGIC_V1_2: &[u8; 32] = b"\x7fVirtualBox SavedState V1.2\n\0\0\0\0";

/// Compose a legacy block stream from `payload`, compressing each block.
fn v1_blocks(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    for block in payload.chunks(4096) {
        let mut packed = vec![0u8; block.len() + block.len() / 2 + 16];
        match lzf_compress(block, &mut packed) {
            Ok(cb) if cb < block.len() => {
                out.push(1); // lzf
                out.extend_from_slice(&(cb as u16).to_le_bytes());
                out.extend_from_slice(&(block.len() as u16).to_le_bytes());
                out.extend_from_slice(&packed[..cb]);
            }
            _ => {
                out.push(0); // raw
                out.extend_from_slice(&(block.len() as u16).to_le_bytes());
                out.extend_from_slice(&(block.len() as u16).to_le_bytes());
                out.extend_from_slice(block);
            }
        }
    }
    out
}

fn v1_unit(name: &str, version: u32, instance: u32, blocks: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"\nUnit\n\0\0");
    out.extend_from_slice(&(blocks.len() as u64).to_le_bytes());
    out.extend_from_slice(&version.to_le_bytes());
    out.extend_from_slice(&instance.to_le_bytes());
    out.extend_from_slice(&((name.len() + 1) as u32).to_le_bytes());
    out.extend_from_slice(name.as_bytes());
    out.push(0);
    out.extend_from_slice(blocks);
    out
}

fn v1_end() -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"\nTheEnd\0");
    out.extend_from_slice(&0u64.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out
}

/// Assemble a complete v1 file: header + body, with the whole-file CRC
/// patched in (CRC field zeroed while hashing).
fn v1_file(magic: &[u8; 32], widths: Option<(u8, u8, u8)>, body: &[u8]) -> Vec<u8> {
    let mut hdr = [0u8; 64];
    hdr[..32].copy_from_slice(magic);
    // 32..36 crc (patched below), 36..40 reserved, 40..56 machine UUID.
    if let Some((bits, gc_phys, gc_ptr)) = widths {
        hdr[56] = bits;
        hdr[57] = gc_phys;
        hdr[58] = gc_ptr;
    }
    hdr[60..64].copy_from_slice(&7u32.to_le_bytes()); // build

    let mut file = Vec::with_capacity(64 + body.len());
    file.extend_from_slice(&hdr);
    file.extend_from_slice(body);
    let crc = crc32fast::hash(&file);
    file[32..36].copy_from_slice(&crc.to_le_bytes());
    file
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: v1.2 file with widths in the header loads cleanly
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn v1_2_file_loads() {
    let mut payload = Vec::new();
    payload.extend_from_slice(&0x1234_5678u32.to_le_bytes());
    payload.extend_from_slice(&[0xaau8; 6000]);
    payload.extend_from_slice(&0x9abc_def0u32.to_le_bytes());

    let body = [
        v1_unit("cpu", 5, 0, &v1_blocks(&payload)),
        v1_end(),
    ]
    .concat();
    let file = v1_file(MAGIC_V1_2, Some((32, 4, 4)), &body);

    let ssm = Ssm::new();
    let mut cfg = UnitConfig::new("cpu", 0, 5, UnitKind::Internal);
    let mut ops = UnitOps::default();
    ops.load_exec = Some(Box::new(|h, version, _pass| {
        assert_eq!(version, 5);
        assert_eq!(h.host_bits(), 32);
        assert_eq!(h.get_u32()?, 0x1234_5678);
        let mut bulk = [0u8; 6000];
        h.get_mem(&mut bulk)?;
        assert!(bulk.iter().all(|&b| b == 0xaa));
        assert_eq!(h.get_u32()?, 0x9abc_def0);
        Ok(())
    }));
    cfg.ops = ops;
    ssm.register(cfg).unwrap();
    ssm.load(Box::new(MemBackend::from_bytes(file)), SsmAfter::Resume, None)
        .unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: unread tail bytes are skipped with a warning, not an error
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn v1_unread_tail_is_tolerated() {
    let mut payload = Vec::new();
    payload.extend_from_slice(&0xfeedu32.to_le_bytes());
    // Two blocks' worth the loader never touches: the second block stays
    // compressed on the stream and must be skipped over.
    payload.extend_from_slice(&[1u8; 6000]);

    let body = [
        v1_unit("gfx", 1, 0, &v1_blocks(&payload)),
        v1_unit("snd", 2, 0, &v1_blocks(&3u32.to_le_bytes())),
        v1_end(),
    ]
    .concat();
    let file = v1_file(MAGIC_V1_1, None, &body);

    let ssm = Ssm::new();
    let mut cfg = UnitConfig::new("gfx", 0, 1, UnitKind::Internal);
    let mut ops = UnitOps::default();
    ops.load_exec = Some(Box::new(|h, _v, _p| {
        // Read only the first word; the rest of the unit stays unread.
        assert_eq!(h.get_u32()?, 0xfeed);
        Ok(())
    }));
    cfg.ops = ops;
    ssm.register(cfg).unwrap();

    // The next unit must still be found at the right place.
    let mut cfg = UnitConfig::new("snd", 0, 2, UnitKind::Internal);
    let mut ops = UnitOps::default();
    ops.load_exec = Some(Box::new(|h, _v, _p| {
        assert_eq!(h.get_u32()?, 3);
        Ok(())
    }));
    cfg.ops = ops;
    ssm.register(cfg).unwrap();

    ssm.load(Box::new(MemBackend::from_bytes(file)), SsmAfter::Resume, None)
        .unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: v1.1 guest-pointer width comes from the caller
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn v1_1_gc_ptr_width_is_caller_supplied() {
    let mut payload = Vec::new();
    payload.extend_from_slice(&0xdead_beef_cafe_f00du64.to_le_bytes()); // 8-byte GC ptr

    let body = [v1_unit("mmu", 1, 0, &v1_blocks(&payload)), v1_end()].concat();
    let file = v1_file(MAGIC_V1_1, None, &body);

    let ssm = Ssm::new();
    let mut cfg = UnitConfig::new("mmu", 0, 1, UnitKind::Internal);
    let mut ops = UnitOps::default();
    ops.load_prep = Some(Box::new(|h| h.set_gc_ptr_size(8)));
    ops.load_exec = Some(Box::new(|h, _v, _p| {
        assert_eq!(h.get_gc_ptr()?, 0xdead_beef_cafe_f00d);
        Ok(())
    }));
    cfg.ops = ops;
    ssm.register(cfg).unwrap();
    ssm.load(Box::new(MemBackend::from_bytes(file)), SsmAfter::Resume, None)
        .unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: integrity guards: CRC, machine UUID, bad magic
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn v1_integrity_guards() {
    let body = [v1_unit("u", 1, 0, &v1_blocks(&[9u8; 16])), v1_end()].concat();

    // Whole-file CRC mismatch.
    let mut file = v1_file(MAGIC_V1_2, Some((32, 4, 4)), &body);
    let n = file.len();
    file[n - 3] ^= 0x40;
    let ssm = Ssm::new();
    assert_eq!(
        ssm.load(Box::new(MemBackend::from_bytes(file)), SsmAfter::Resume, None),
        Err(SsmError::IntegrityCrc)
    );

    // Machine UUID must be all-zero.
    let mut file = v1_file(MAGIC_V1_1, None, &body);
    file[44] = 0x01;
    let crc_fixup = {
        let mut copy = file.clone();
        copy[32..36].copy_from_slice(&[0; 4]);
        crc32fast::hash(&copy)
    };
    file[32..36].copy_from_slice(&crc_fixup.to_le_bytes());
    let ssm = Ssm::new();
    assert_eq!(
        ssm.load(Box::new(MemBackend::from_bytes(file)), SsmAfter::Resume, None),
        Err(SsmError::IntegrityHeader)
    );

    // Unknown magic.
    let mut file = v1_file(MAGIC_V1_1, None, &body);
    file[25] = b'9';
    let ssm = Ssm::new();
    assert_eq!(
        ssm.load(Box::new(MemBackend::from_bytes(file)), SsmAfter::Resume, None),
        Err(SsmError::IntegrityMagic)
    );
}
