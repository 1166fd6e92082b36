//! Integration tests for the end-to-end seed scenarios (one `#[test]` per
//! scenario, the teacher's `emulator/tests.rs` style), exercised through
//! the public crate API rather than module-internal state.

use armory::arch::{Architecture, Register};
use armory::explorer::{Context, FaultSimulator, ModelMultiplicity};
use armory::fault::{skip_instruction_model, FaultModel, RegisterFaultLifetime, RegisterFaultModel};
use armory::{Emulator, ExploitabilityModel, MemoryRegion, ReturnCode, Snapshot, Verdict};
use std::sync::Arc;
use tracing_test::traced_test;

const FLASH_BASE: u32 = 0x0800_0000;
const RAM_BASE: u32 = 0x2000_0000;

fn basic_emulator(code: &[u8]) -> Emulator {
    let mut flash = MemoryRegion::flash(FLASH_BASE, 0x1000);
    flash.load(FLASH_BASE, code).unwrap();
    let ram = MemoryRegion::ram(RAM_BASE, 0x1000);
    let mut emulator = Emulator::new(Architecture::ARMv7M, flash, ram);
    emulator.cpu.registers.set_pc_raw(FLASH_BASE);
    emulator.cpu.registers.write(Register::SP, RAM_BASE + 0x800);
    emulator
}

#[traced_test]
#[test]
fn s1_identity_run_with_no_faults_reaches_end_address_in_three_steps() {
    // NOP; NOP; BX LR
    let mut emulator = basic_emulator(&[0x00, 0xbf, 0x00, 0xbf, 0x70, 0x47]);
    emulator.cpu.registers.write(Register::LR, 0xFFFF_FFFE);

    tracing::info!("running identity scenario with no faults injected");
    let result = emulator.emulate(0xFFFF_FFFE);

    assert_eq!(result, ReturnCode::EndAddressReached);
    assert_eq!(emulator.instructions_executed(), 3);
}

/// A conditional branch that, left alone, always jumps clear of a "sink"
/// address; skipping the branch instruction is the only single fault that
/// reaches the sink. `BNE`/`BEQ` choice and the Z flag are picked so that
/// skipping any *other* instruction is either a no-op or leaves the branch
/// outcome unchanged.
fn branch_over_sink_firmware() -> (Emulator, u32) {
    // BEQ +0 (skips the 2-byte sink); NOP (sink); NOP (safe landing)
    let mut emulator = basic_emulator(&[0x00, 0xd0, 0x00, 0xbf, 0x00, 0xbf]);
    emulator.cpu.registers.z = true; // condition holds, so the branch is taken
    let sink_address = FLASH_BASE + 2;
    (emulator, sink_address)
}

#[test]
fn s2_single_instruction_skip_exploit_finds_exactly_one_minimal_combination() {
    let (emulator, sink_address) = branch_over_sink_firmware();
    let context = Context::new(vec![sink_address], 10);

    let simulator = FaultSimulator::new(context).unwrap();
    let models = vec![ModelMultiplicity { model: FaultModel::Instruction(skip_instruction_model()), multiplicity: 1 }];
    let outcome = simulator.simulate_faults(&emulator, models, 1);

    assert_eq!(outcome.combinations.len(), 1);
    let combination = &outcome.combinations[0];
    assert_eq!(combination.instruction_faults().len(), 1);
    assert_eq!(combination.register_faults().len(), 0);
    assert_eq!(combination.instruction_faults()[0].address, FLASH_BASE);
}

fn sentinel_register_model(name: &str, value: u32) -> RegisterFaultModel {
    RegisterFaultModel {
        name: name.to_string(),
        lifetime: RegisterFaultLifetime::Permanent,
        iteration_count: Box::new(|_| 1),
        is_applicable: Box::new(|reg| reg != Register::PC),
        inject: Arc::new(move |_, _| value),
    }
}

#[test]
fn s3_permanent_register_clear_exploit_finds_the_guard_register() {
    // CMP R1, #0; BNE +0 (skip the sink when R1 != 0); NOP (sink); NOP (safe)
    let mut emulator = basic_emulator(&[0x00, 0x29, 0x00, 0xd1, 0x00, 0xbf, 0x00, 0xbf]);
    emulator.cpu.registers.write(Register::R1, 5); // nonzero: baseline never reaches the sink
    let sink_address = FLASH_BASE + 4;

    let context = Context::new(vec![sink_address], 10);
    let simulator = FaultSimulator::new(context).unwrap();
    let model = sentinel_register_model("register_clear", 0);
    let models = vec![ModelMultiplicity { model: FaultModel::Register(model), multiplicity: 1 }];
    let outcome = simulator.simulate_faults(&emulator, models, 1);

    assert_eq!(outcome.combinations.len(), 1);
    let combination = &outcome.combinations[0];
    assert_eq!(combination.register_faults().len(), 1);
    assert_eq!(combination.register_faults()[0].reg, Register::R1);
}

#[derive(Clone)]
struct SentinelOracle;

impl ExploitabilityModel for SentinelOracle {
    fn evaluate(&self, emulator: &Emulator, _pc: u32) -> Verdict {
        if emulator.cpu.registers.read(Register::R5) == 0xDEAD_BEEF {
            Verdict::Exploitable
        } else {
            Verdict::NotExploitable
        }
    }

    fn clone_box(&self) -> Box<dyn ExploitabilityModel> {
        Box::new(self.clone())
    }
}

#[traced_test]
#[test]
fn s4_redundancy_pruning_drops_supersets_of_a_known_exploitable_fault() {
    // A single NOP is enough: the halting point is the entry PC itself, so
    // the oracle is consulted before any instruction executes.
    let emulator = basic_emulator(&[0x00, 0xbf]);
    let mut context = Context::new(vec![FLASH_BASE], 5);
    context.exploitability_model = Some(Box::new(SentinelOracle));

    let simulator = FaultSimulator::new(context).unwrap();
    let models = vec![
        ModelMultiplicity { model: FaultModel::Register(sentinel_register_model("f1", 0xDEAD_BEEF)), multiplicity: 1 },
        ModelMultiplicity { model: FaultModel::Register(sentinel_register_model("f2", 0xCAFE_BABE)), multiplicity: 1 },
    ];

    tracing::info!("searching with an oracle that only approves combinations touching r5");
    let outcome = simulator.simulate_faults(&emulator, models, 2);

    assert_eq!(outcome.combinations.len(), 1, "F1-alone should make every {{F1, F2}} superset redundant");
    let combination = &outcome.combinations[0];
    assert_eq!(combination.register_faults().len(), 1);
    assert_eq!(combination.register_faults()[0].reg, Register::R5);
    assert_eq!(combination.register_faults()[0].model_index, 0);
}

/// `splitmix64`, used only to generate a reproducible pseudo-random byte
/// stream for S5 without pulling in a dependency the crate doesn't
/// otherwise need.
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[test]
fn s5_snapshot_round_trips_100_random_writes() {
    let flash = MemoryRegion::flash(FLASH_BASE, 0x100);
    let ram = MemoryRegion::ram(RAM_BASE, 0x400);
    let mut emulator = Emulator::new(Architecture::ARMv7M, flash, ram);
    emulator.cpu.registers.set_pc_raw(FLASH_BASE);
    emulator.cpu.registers.write(Register::SP, RAM_BASE + 0x200);

    let mut rng_state = 0x1234_5678_9abc_def0u64;
    for trial in 0..100u32 {
        let before = emulator.ram.raw().to_vec();
        {
            let mut snap = Snapshot::new(&mut emulator);
            snap.backup();
            let mut bytes = [0u8; 256];
            for b in bytes.iter_mut() {
                *b = (splitmix64(&mut rng_state) & 0xff) as u8;
            }
            let address = RAM_BASE + (trial % 4) * 0x100;
            snap.emulator_mut().write_memory(address, &bytes).unwrap();
            snap.restore();
        }
        assert_eq!(emulator.ram.raw(), before.as_slice(), "trial {trial} failed to round-trip");
    }
}

#[test]
fn s6_single_and_eight_threaded_runs_find_the_same_combinations() {
    let make_scenario = || branch_over_sink_firmware();
    let models = || vec![ModelMultiplicity { model: FaultModel::Instruction(skip_instruction_model()), multiplicity: 1 }];

    let (emulator1, sink1) = make_scenario();
    let mut simulator1 = FaultSimulator::new(Context::new(vec![sink1], 10)).unwrap();
    simulator1.set_number_of_threads(1);
    let outcome1 = simulator1.simulate_faults(&emulator1, models(), 1);

    let (emulator8, sink8) = make_scenario();
    let mut simulator8 = FaultSimulator::new(Context::new(vec![sink8], 10)).unwrap();
    simulator8.set_number_of_threads(8);
    let outcome8 = simulator8.simulate_faults(&emulator8, models(), 1);

    assert_eq!(outcome1.combinations.len(), outcome8.combinations.len());
    assert!(outcome1.combinations.iter().all(|c| outcome8.combinations.iter().any(|other| other == c)));
}
