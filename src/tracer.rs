//! Single-threaded fault-combination replay for verification and
//! diagnostic logging (spec.md §6 `FaultTracer`), grounded on
//! `examples/original_source/subprojects/armory/src/fault_simulator.cpp`'s
//! `verify`/`trace` entry points.
//!
//! Deliberately diverges from [`crate::explorer`] in one place, per
//! spec.md §9's open question: halting-point lookup here is a linear scan
//! over the caller-supplied list, not the explorer's sorted binary search.
//! Both are kept rather than unified, preserving the source's documented
//! behavioral split.

use crate::emulator::{Emulator, ReturnCode};
use crate::explorer::{Context, Verdict};
use crate::fault::{
    FaultCombination, FaultModel, InstructionFault, InstructionFaultLifetime, RegisterFault,
    RegisterFaultLifetime,
};
use tracing::debug;

/// One fault from a [`FaultCombination`], re-tagged with its kind so the
/// replay loop can merge instruction and register faults into a single
/// chronological sequence. The combination stores the two kinds in
/// separate vectors; `time` is what recovers their true relative order.
enum ReplayFault {
    Instruction(InstructionFault),
    Register(RegisterFault),
}

impl ReplayFault {
    fn time(&self) -> u64 {
        match self {
            ReplayFault::Instruction(f) => f.time,
            ReplayFault::Register(f) => f.time,
        }
    }
}

fn merged_by_time(combination: &FaultCombination) -> Vec<ReplayFault> {
    let mut faults: Vec<ReplayFault> = Vec::new();
    faults.extend(combination.instruction_faults().iter().copied().map(ReplayFault::Instruction));
    faults.extend(combination.register_faults().iter().copied().map(ReplayFault::Register));
    faults.sort_by_key(|f| f.time());
    faults
}

/// Replays a single, already-known [`FaultCombination`] against a fresh
/// emulator. Needs the same model list the combination's `model_index`
/// fields were produced against — since [`Context`] carries no model list
/// of its own, it is threaded through the constructor explicitly, the same
/// way [`crate::explorer::FaultSimulator::simulate_faults`] takes its model
/// list as an argument rather than storing it on `Context`.
pub struct FaultTracer<'m> {
    context: Context,
    models: &'m [FaultModel],
}

impl<'m> FaultTracer<'m> {
    pub fn new(context: Context, models: &'m [FaultModel]) -> FaultTracer<'m> {
        FaultTracer { context, models }
    }

    /// Replay `combination` and report only whether the oracle called it
    /// exploitable, with no logging (spec.md §6 `verify`).
    pub fn verify(&self, emulator: &mut Emulator, combination: &FaultCombination) -> bool {
        self.trace(emulator, combination, false, false)
    }

    /// Replay `combination`, optionally logging each step's CPU state
    /// (spec.md §6 `trace`). `start_after_first_fault` suppresses logging
    /// for the instructions executed before the combination's first fault
    /// fires, so a trace of a deep combination isn't dominated by
    /// uneventful warm-up steps.
    pub fn trace(&self, emulator: &mut Emulator, combination: &FaultCombination, start_after_first_fault: bool, log_cpu_state: bool) -> bool {
        let faults = merged_by_time(combination);
        let mut logging = !start_after_first_fault;

        for fault in &faults {
            let target_time = fault.time();
            while emulator.instructions_executed() < target_time {
                if logging && log_cpu_state {
                    debug!(pc = emulator.pc(), registers = ?emulator.cpu.registers, "tracer: step");
                }
                if emulator.step() != ReturnCode::Ok {
                    return false;
                }
            }
            logging = true;

            let applied = match fault {
                ReplayFault::Instruction(f) => self.apply_instruction_fault(emulator, f),
                ReplayFault::Register(f) => {
                    self.apply_register_fault(emulator, f);
                    true
                }
            };
            if !applied {
                return false;
            }
        }

        loop {
            let pc = emulator.pc();
            if self.is_halting_point(pc) {
                match self.context.exploitability_model.as_ref() {
                    Some(model) => match model.evaluate(emulator, pc) {
                        Verdict::Exploitable => return true,
                        Verdict::NotExploitable => return false,
                        Verdict::ContinueSimulation => {}
                    },
                    None => return true,
                }
            }
            if emulator.instructions_executed() >= self.context.emulation_timeout {
                return false;
            }
            if log_cpu_state {
                debug!(pc, registers = ?emulator.cpu.registers, "tracer: step");
            }
            if emulator.step() != ReturnCode::Ok {
                return false;
            }
        }
    }

    /// Linear scan over the caller's (possibly unsorted) list, kept
    /// deliberately distinct from the explorer's sorted binary search
    /// rather than unified (spec.md §9 open question).
    fn is_halting_point(&self, pc: u32) -> bool {
        self.context.halting_points.iter().any(|&p| p == pc)
    }

    fn apply_instruction_fault(&self, emulator: &mut Emulator, fault: &InstructionFault) -> bool {
        let model = match &self.models[fault.model_index] {
            FaultModel::Instruction(m) => m,
            FaultModel::Register(_) => return false,
        };
        let size = if emulator.flash.contains(fault.address, 4) { 4 } else { 2 };
        let original = match emulator.read_memory(fault.address, size) {
            Ok(b) => b,
            Err(_) => return false,
        };
        let mut manipulated = original.clone();
        (model.inject)(fault, &mut manipulated);
        if manipulated == original {
            return true;
        }
        emulator.flash.load(fault.address, &manipulated).expect("fault address is within flash");
        let code = emulator.step();
        if !matches!(model.lifetime, InstructionFaultLifetime::Permanent) {
            emulator.flash.load(fault.address, &original).expect("fault address is within flash");
        }
        code == ReturnCode::Ok
    }

    /// Transient faults get a one-shot revert after the next instruction,
    /// mirroring the explorer's `run_with_one_shot_register_revert`
    /// inline rather than through a hook, since the tracer runs
    /// single-threaded and has no need for the indirection. `UntilOverwrite`
    /// is treated like `Permanent` here (single write, no watch on the
    /// register) — the same simplification the explorer's permanent-register
    /// path makes, since nothing in this crate's `Hooks` can reapply or
    /// watch a write after the fact.
    fn apply_register_fault(&self, emulator: &mut Emulator, fault: &RegisterFault) {
        let model = match &self.models[fault.model_index] {
            FaultModel::Register(m) => m,
            FaultModel::Instruction(_) => return,
        };
        let original = emulator.cpu.registers.read(fault.reg);
        let manipulated = (model.inject)(fault, original);
        emulator.cpu.registers.write(fault.reg, manipulated);
        if matches!(model.lifetime, RegisterFaultLifetime::Transient) && emulator.step() == ReturnCode::Ok {
            emulator.cpu.registers.write(fault.reg, original);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{Architecture, Register};
    use crate::emulator::MemoryRegion;
    use crate::fault::skip_instruction_model;

    fn emulator_with(code: &[u8]) -> Emulator {
        let mut flash = MemoryRegion::flash(0x0800_0000, 0x100);
        flash.load(0x0800_0000, code).unwrap();
        let ram = MemoryRegion::ram(0x2000_0000, 0x1000);
        let mut e = Emulator::new(Architecture::ARMv7M, flash, ram);
        e.cpu.registers.set_pc_raw(0x0800_0000);
        e.cpu.registers.write(Register::SP, 0x2000_1000);
        e
    }

    #[test]
    fn verify_without_any_faults_reaches_the_halting_point() {
        // NOP; NOP; BX LR
        let mut e = emulator_with(&[0x00, 0xbf, 0x00, 0xbf, 0x70, 0x47]);
        e.cpu.registers.write(Register::LR, 0xFFFF_FFFE);
        let ctx = Context::new(vec![0xFFFF_FFFE], 10);
        let models = vec![FaultModel::Instruction(skip_instruction_model())];
        let tracer = FaultTracer::new(ctx, &models);
        let empty = FaultCombination::new();
        assert!(tracer.verify(&mut e, &empty));
    }

    #[test]
    fn replaying_a_skip_fault_lands_on_the_same_pc_the_explorer_would_record() {
        // NOP (faulted to stay NOP is a no-op test); BX LR
        let mut e = emulator_with(&[0x00, 0xbf, 0x70, 0x47]);
        e.cpu.registers.write(Register::LR, 0xFFFF_FFFE);
        let ctx = Context::new(vec![0xFFFF_FFFE], 10);
        let models = vec![FaultModel::Instruction(skip_instruction_model())];
        let tracer = FaultTracer::new(ctx, &models);
        let mut combo = FaultCombination::new();
        combo.push_instruction_fault(InstructionFault { time: 0, address: 0x0800_0000, fault_model_iteration: 0, model_index: 0 });
        assert!(tracer.verify(&mut e, &combo));
    }
}
