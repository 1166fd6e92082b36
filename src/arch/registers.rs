use std::fmt;

/// Index into the 17-entry register file: R0..R12, SP, LR, PC, PSR
/// (spec.md §3). Kept as a `#[repr(u8)]` enum rather than a raw index so
/// that "invalid register" is unrepresentable by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Register {
    R0 = 0,
    R1 = 1,
    R2 = 2,
    R3 = 3,
    R4 = 4,
    R5 = 5,
    R6 = 6,
    R7 = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    SP = 13,
    LR = 14,
    PC = 15,
    PSR = 16,
}

pub const REGISTER_COUNT: usize = 17;

/// Every general-purpose-and-special register, in index order. Used by the
/// explorer's permanent register-fault enumeration (spec.md §4.6) and by
/// the snapshot's full-register-list tests.
pub const ALL_REGISTERS: [Register; REGISTER_COUNT] = [
    Register::R0,
    Register::R1,
    Register::R2,
    Register::R3,
    Register::R4,
    Register::R5,
    Register::R6,
    Register::R7,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::SP,
    Register::LR,
    Register::PC,
    Register::PSR,
];

impl Register {
    pub const fn index(self) -> usize {
        self as u8 as usize
    }

    pub fn from_index(index: usize) -> Option<Register> {
        ALL_REGISTERS.get(index).copied()
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Register::SP => write!(f, "sp"),
            Register::LR => write!(f, "lr"),
            Register::PC => write!(f, "pc"),
            Register::PSR => write!(f, "xpsr"),
            Register::R9 => write!(f, "sb"),
            Register::R10 => write!(f, "sl"),
            Register::R11 => write!(f, "fp"),
            Register::R12 => write!(f, "ip"),
            _ => write!(f, "r{}", self.index()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_index() {
        for r in ALL_REGISTERS {
            assert_eq!(Register::from_index(r.index()), Some(r));
        }
    }

    #[test]
    fn named_registers_display_aliases() {
        assert_eq!(Register::SP.to_string(), "sp");
        assert_eq!(Register::LR.to_string(), "lr");
        assert_eq!(Register::PC.to_string(), "pc");
        assert_eq!(Register::PSR.to_string(), "xpsr");
        assert_eq!(Register::R0.to_string(), "r0");
    }

    #[test]
    fn out_of_range_index_is_none() {
        assert_eq!(Register::from_index(17), None);
    }
}
