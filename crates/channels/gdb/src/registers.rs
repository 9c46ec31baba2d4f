//! i386 `g` packet layout.
//!
//! The stub sends the general registers as sixteen little-endian 32-bit words
//! in [`REGISTER_NAMES`](probe_core::REGISTER_NAMES) order. The segment
//! registers occupy full words on the wire but only their low 16 bits are
//! architectural. Stubs append FPU/SSE state after the first 64 bytes; it is
//! ignored.

use probe_core::RegisterSet;

pub const REGISTER_BLOB_LEN: usize = 64;

/// Decode the fixed 64-byte prefix of a `g` reply. `None` if the blob is
/// shorter than that.
pub fn decode_registers(blob: &[u8]) -> Option<RegisterSet> {
    let words: Vec<u32> = blob
        .get(..REGISTER_BLOB_LEN)?
        .chunks_exact(4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .collect();
    let seg = |i: usize| (words[i] & 0xFFFF) as u16;

    Some(RegisterSet {
        eax: words[0],
        ecx: words[1],
        edx: words[2],
        ebx: words[3],
        esp: words[4],
        ebp: words[5],
        esi: words[6],
        edi: words[7],
        eip: words[8],
        eflags: words[9],
        cs: seg(10),
        ss: seg(11),
        ds: seg(12),
        es: seg(13),
        fs: seg(14),
        gs: seg(15),
    })
}

/// Wire form of `registers`, as a stub would send it.
pub fn encode_registers(registers: &RegisterSet) -> Vec<u8> {
    registers
        .values()
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use probe_core::REGISTER_NAMES;

    #[test]
    fn test_decode_documented_layout() {
        // Word i holds 0x1000_0000 + i, with garbage in the segment high halves
        let mut blob = Vec::new();
        for i in 0..16u32 {
            blob.extend_from_slice(&(0x1000_0000 + i).to_le_bytes());
        }
        let regs = decode_registers(&blob).unwrap();

        for (i, name) in REGISTER_NAMES.iter().enumerate() {
            let expected = if i < 10 {
                0x1000_0000 + i as u32
            } else {
                i as u32
            };
            assert_eq!(regs.get(name), Some(expected), "register {}", name);
        }
    }

    #[test]
    fn test_segment_high_bits_are_discarded() {
        let mut blob = vec![0u8; 64];
        blob[40..44].copy_from_slice(&0xDEAD_1A00u32.to_le_bytes()); // cs
        blob[60..64].copy_from_slice(&0xFFFF_0040u32.to_le_bytes()); // gs
        blob[32..36].copy_from_slice(&0x0001_A3F0u32.to_le_bytes()); // eip
        let regs = decode_registers(&blob).unwrap();
        assert_eq!(regs.cs, 0x1A00);
        assert_eq!(regs.gs, 0x0040);
        assert_eq!(regs.eip, 0x0001_A3F0);
    }

    #[test]
    fn test_trailing_state_ignored_and_short_blob_rejected() {
        let mut blob = vec![0u8; 64 + 108];
        blob[0] = 0x42;
        assert_eq!(decode_registers(&blob).unwrap().eax, 0x42);
        assert!(decode_registers(&[0u8; 63]).is_none());
    }

    #[test]
    fn test_encode_matches_decode() {
        let regs = RegisterSet {
            eax: 1,
            esp: 0xFFFE,
            eip: 0x1A3F0,
            eflags: 0x202,
            cs: 0x1A00,
            ss: 0x2000,
            ..Default::default()
        };
        let blob = encode_registers(&regs);
        assert_eq!(blob.len(), REGISTER_BLOB_LEN);
        assert_eq!(decode_registers(&blob), Some(regs));
    }
}
