use std::fmt;

/// ARM shift/rotate kinds (spec.md §3 `Instruction.shift_type`, §4.1
/// `shift_c`/`shift`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShiftType {
    Lsl,
    Lsr,
    Asr,
    Ror,
    Rrx,
}

impl fmt::Display for ShiftType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShiftType::Lsl => "lsl",
            ShiftType::Lsr => "lsr",
            ShiftType::Asr => "asr",
            ShiftType::Ror => "ror",
            ShiftType::Rrx => "rrx",
        };
        write!(f, "{s}")
    }
}

/// Decode the 2-bit shift-type field used by Thumb-2 data-processing
/// encodings into a `ShiftType` + whether it is really an RRX (encoded as
/// ROR with a zero amount).
pub fn decode_imm_shift(type_bits: u8, imm5: u8) -> (ShiftType, u32) {
    match type_bits & 0b11 {
        0b00 => (ShiftType::Lsl, imm5 as u32),
        0b01 => (ShiftType::Lsr, if imm5 == 0 { 32 } else { imm5 as u32 }),
        0b10 => (ShiftType::Asr, if imm5 == 0 { 32 } else { imm5 as u32 }),
        _ => {
            if imm5 == 0 {
                (ShiftType::Rrx, 1)
            } else {
                (ShiftType::Ror, imm5 as u32)
            }
        }
    }
}
