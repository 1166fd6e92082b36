//! Fault models and fault combinations (spec.md §3, §4.3).

mod combination;
mod model;

pub use combination::FaultCombination;
pub use model::{
    instruction_bit_flip_model, register_bit_flip_model, register_zero_model,
    skip_instruction_model, InstructionFault, InstructionFaultLifetime, InstructionFaultModel,
    RegisterFault, RegisterFaultLifetime, RegisterFaultModel,
};

/// The tagged sum spec.md §9 asks for in place of the original's
/// polymorphic `FaultModel` base class: dispatch by `match`, not vtable.
pub enum FaultModel {
    Instruction(InstructionFaultModel),
    Register(RegisterFaultModel),
}

impl FaultModel {
    pub fn name(&self) -> &str {
        match self {
            FaultModel::Instruction(m) => &m.name,
            FaultModel::Register(m) => &m.name,
        }
    }
}
