//! Byte window → [`Instruction`] decode (spec.md §2, §4.1).

mod thumb16;
mod thumb32;

use crate::arch::{Architecture, Instruction};
use crate::emulator::ReturnCode;

/// Thumb-2 escape values for the first halfword's top 5 bits (spec.md §2):
/// `0b11101`, `0b11110`, `0b11111` mean the instruction is 4 bytes.
fn halfword_top5(first_halfword: u16) -> u16 {
    first_halfword >> 11
}

/// Returns 2 or 4, the size in bytes of the instruction whose first
/// halfword is `first_halfword` (spec.md §2, §4.1).
pub fn instruction_size(first_halfword: u16) -> u8 {
    match halfword_top5(first_halfword) {
        0b11101 | 0b11110 | 0b11111 => 4,
        _ => 2,
    }
}

/// Decode the instruction at `address` out of `bytes` (exactly `size`
/// bytes, little-endian halfwords). `in_it`/`last_in_it` describe whether
/// this decode happens inside an IT block and whether it is the block's
/// last instruction, since a handful of encodings are UNPREDICTABLE
/// depending on IT-block position (spec.md §4.1).
pub fn decode(
    arch: Architecture,
    address: u32,
    bytes: &[u8],
    in_it: bool,
    last_in_it: bool,
) -> Result<Instruction, ReturnCode> {
    if bytes.len() < 2 {
        return Err(ReturnCode::IncompleteData);
    }
    let hw0 = u16::from_le_bytes([bytes[0], bytes[1]]);
    let size = instruction_size(hw0);
    if size == 4 {
        if !arch.supports_thumb2() {
            return Err(ReturnCode::Undefined);
        }
        if bytes.len() < 4 {
            return Err(ReturnCode::IncompleteData);
        }
        let hw1 = u16::from_le_bytes([bytes[2], bytes[3]]);
        thumb32::decode(address, hw0, hw1, in_it, last_in_it)
    } else {
        thumb16::decode(address, hw0, in_it, last_in_it)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sixteen_bit_escape_values_select_four_bytes() {
        assert_eq!(instruction_size(0b1110_1_0000000000), 4);
        assert_eq!(instruction_size(0b1111_0_0000000000), 4);
        assert_eq!(instruction_size(0b1111_1_0000000000), 4);
    }

    #[test]
    fn other_top_bits_select_two_bytes() {
        assert_eq!(instruction_size(0b1011_00000_0000000), 2); // push/pop range
        assert_eq!(instruction_size(0), 2);
    }

    #[test]
    fn decode_never_partially_parses() {
        // Either a concrete instruction comes back, or a well-defined error.
        // 0xbf00 is NOP T1.
        let bytes = 0xbf00u16.to_le_bytes();
        let result = decode(Architecture::ARMv7M, 0x0800_0000, &bytes, false, false);
        assert!(result.is_ok());
    }
}
