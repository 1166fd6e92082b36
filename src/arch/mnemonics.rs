use std::fmt;

/// Instruction mnemonics decoded and executed by this simulator
/// (spec.md §4.1, SPEC_FULL.md §3 "Covered instruction subset").
///
/// This is intentionally not exhaustive of the Thumb/Thumb-2 ISA: the
/// decoder accepts and sizes every 16/32-bit encoding so that the
/// faultable-instruction table (spec.md §4.4 step 3) stays complete, but
/// execution of a recognized-but-unimplemented encoding yields
/// `ReturnCode::Unsupported` rather than a panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mnemonic {
    Nop,
    MovImm,
    MovReg,
    MvnReg,
    AddImm,
    AddReg,
    AddSpImm,
    SubImm,
    SubReg,
    SubSpImm,
    CmpImm,
    CmpReg,
    CmnReg,
    AndReg,
    OrrReg,
    EorReg,
    BicReg,
    TstReg,
    LslImm,
    LslReg,
    LsrImm,
    LsrReg,
    AsrImm,
    AsrReg,
    RorReg,
    B,
    Bl,
    Bx,
    Blx,
    Ldr,
    LdrLiteral,
    Str,
    Ldrb,
    Strb,
    Ldrh,
    Strh,
    Push,
    Pop,
    Ldm,
    Stm,
    Ldrex,
    Strex,
    Ldrexb,
    Strexb,
    It,
    Svc,
    Udf,
    /// Recognized (sized) but not executed by this simulator.
    Unsupported,
}

impl fmt::Display for Mnemonic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}
