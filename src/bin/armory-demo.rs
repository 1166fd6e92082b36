//! A minimal demonstration binary: loads a tiny built-in firmware image and
//! runs [`FaultSimulator::simulate_faults`] against it with a single
//! instruction-skip model, printing the minimal exploitable fault
//! combinations found. Argument parsing and the disassembly/firmware
//! loading collaborators named in spec.md §1 are out of scope; this
//! binary's only job is to give the ambient logging/config stack a real
//! entry point (SPEC_FULL.md §0), matching the role `src/main.rs` plays
//! in the teacher.

use armory::arch::{Architecture, Register};
use armory::emulator::MemoryRegion;
use armory::explorer::{Context, FaultSimulator, ModelMultiplicity};
use armory::fault::{skip_instruction_model, FaultModel};
use armory::Emulator;
use tracing_subscriber::EnvFilter;

/// NOP; NOP; CMP R0, #0; BEQ +2; BX LR; BX LR (the second, "sink", BX LR
/// stands in for a security-relevant call a skipped branch would bypass).
const FIRMWARE: [u8; 10] = [0x00, 0xbf, 0x00, 0xbf, 0x00, 0x28, 0x00, 0xd0, 0x70, 0x47];

const FLASH_BASE: u32 = 0x0800_0000;
const RAM_BASE: u32 = 0x2000_0000;
const SINK_ADDRESS: u32 = FLASH_BASE + 8;

fn build_emulator() -> Emulator {
    let mut flash = MemoryRegion::flash(FLASH_BASE, 0x1000);
    flash.load(FLASH_BASE, &FIRMWARE).expect("firmware fits in flash");
    let ram = MemoryRegion::ram(RAM_BASE, 0x1000);
    let mut emulator = Emulator::new(Architecture::ARMv7M, flash, ram);
    emulator.cpu.registers.set_pc_raw(FLASH_BASE);
    emulator.cpu.registers.write(Register::SP, RAM_BASE + 0x800);
    emulator.cpu.registers.write(Register::LR, 0xFFFF_FFFE);
    emulator
}

fn main() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let emulator = build_emulator();
    let context = Context::new(vec![SINK_ADDRESS], 20);

    let mut simulator = FaultSimulator::new(context).unwrap();
    simulator.enable_progress_printing(true);

    let models = vec![ModelMultiplicity { model: FaultModel::Instruction(skip_instruction_model()), multiplicity: 1 }];
    let outcome = simulator.simulate_faults(&emulator, models, 1);

    println!("permutations explored: {}", outcome.permutations_explored);
    println!("minimal exploitable combinations: {}", outcome.combinations.len());
    for combination in &outcome.combinations {
        println!(
            "  instruction faults: {:?}",
            combination.instruction_faults().iter().map(|f| f.address).collect::<Vec<_>>()
        );
    }
}
