//! LZF block codec.
//!
//! Small, dependency-free LZF encoder/decoder used for the compressed
//! record payloads.  Blocks are at most [`LZF_BLOCK_SIZE`] bytes of
//! plaintext; the compressor gives up (rather than expanding) as soon as
//! the output would reach the caller's cap, and the decompressor is fully
//! bounds-checked and rejects any malformed stream.

pub mod compress;
pub mod decompress;

pub use compress::{lzf_compress, LzfCompressError};
pub use decompress::{lzf_decompress, LzfDecompressError};

/// Maximum plaintext block size handled by the record layer.
pub const LZF_BLOCK_SIZE: usize = 4096;

/// Minimum back-reference length the encoder will emit.
pub const LZF_MIN_MATCH: usize = 3;

/// Maximum back-reference distance representable in the wire format
/// (13 offset bits, biased by one).
pub const LZF_MAX_OFF: usize = 1 << 13;

/// Maximum literal-run length per control byte.
pub const LZF_MAX_LIT: usize = 32;

/// Maximum match length per control sequence (3-bit length field saturated
/// at 7, extension byte up to 255, implicit bias of two).
pub const LZF_MAX_REF: usize = (1 << 8) + (1 << 3);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_compressible_block() {
        let src: Vec<u8> = (0..4096u32).map(|i| (i % 64) as u8).collect();
        let mut packed = vec![0u8; 4096 - 256];
        let cb = lzf_compress(&src, &mut packed).expect("repetitive data must compress");
        assert!(cb < src.len());
        let mut out = vec![0u8; 4096];
        let cb_out = lzf_decompress(&packed[..cb], &mut out).unwrap();
        assert_eq!(cb_out, src.len());
        assert_eq!(out[..cb_out], src[..]);
    }

    #[test]
    fn incompressible_block_gives_up() {
        // A byte sequence with no 3-byte repeats anywhere: compression must
        // refuse once the output hits the cap instead of expanding past it.
        let mut src = [0u8; 1024];
        let mut x: u32 = 0x9e37_79b9;
        for b in src.iter_mut() {
            x = x.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            *b = (x >> 24) as u8;
        }
        let mut packed = vec![0u8; 512];
        assert_eq!(
            lzf_compress(&src, &mut packed),
            Err(LzfCompressError::OutputFull)
        );
    }

    #[test]
    fn roundtrip_all_block_sizes_near_boundaries() {
        for cb in [1usize, 2, 3, 31, 32, 33, 255, 256, 1024, 4095, 4096] {
            let src: Vec<u8> = (0..cb).map(|i| (i % 7) as u8).collect();
            let mut packed = vec![0u8; cb + cb / 2 + 16];
            if let Ok(c) = lzf_compress(&src, &mut packed) {
                let mut out = vec![0u8; cb];
                let n = lzf_decompress(&packed[..c], &mut out).unwrap();
                assert_eq!(n, cb, "block size {cb}");
                assert_eq!(out[..n], src[..], "block size {cb}");
            }
        }
    }
}
