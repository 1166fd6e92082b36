//! The four fault-injection procedures (spec.md §4.5, §4.6): transient and
//! permanent variants, each for instructions and for registers. Grounded on
//! `examples/original_source/subprojects/armory/src/fault_simulator.cpp`'s
//! `simulate_instruction_fault`/`simulate_register_fault`/permanent
//! counterparts.

use super::{Context, Verdict};
use crate::arch::{Register, ALL_REGISTERS};
use crate::decoder;
use crate::emulator::{Emulator, ReturnCode};
use crate::fault::{FaultCombination, FaultModel, InstructionFault, RegisterFault};
use crate::snapshot::Snapshot;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// One decoded, faultable flash address (spec.md §4.4 step 3).
#[derive(Debug, Clone, Copy)]
pub(super) struct FaultableSite {
    pub address: u32,
    pub size: u32,
}

/// Walk flash from its first address, decoding instruction sizes, skipping
/// erased (`0xFFFFFFFF`) words and anything in an ignore-memory range.
pub(super) fn faultable_instruction_table(emulator: &Emulator, ctx: &Context) -> Vec<FaultableSite> {
    let mut sites = Vec::new();
    let base = emulator.flash.base();
    let end = base + emulator.flash.len();
    let mut address = base;
    while address < end {
        let Ok(word) = emulator.flash.read_bytes(address, (end - address).min(4)) else { break };
        if word.len() == 4 && word == [0xFF, 0xFF, 0xFF, 0xFF] {
            address += 4;
            continue;
        }
        let first_hw = u16::from_le_bytes([word[0], word.get(1).copied().unwrap_or(0xFF)]);
        let size = decoder::instruction_size(first_hw) as u32;
        if address + size > end {
            break;
        }
        if !ctx.in_ignored_memory(address) {
            sites.push(FaultableSite { address, size });
        }
        address += size;
    }
    sites
}

/// One trial's bookkeeping: `order` is the position in the permutation
/// being explored, `remaining` the instructions left in this trial's
/// budget, `chain` the faults already committed at earlier positions.
pub(super) struct Trial<'m> {
    pub models: &'m [FaultModel],
    pub permutation: &'m [usize],
    pub ctx: &'m Context,
    pub sorted_halting_points: &'m [u32],
}

/// Run until a halting point is reached, the oracle decides, or the budget
/// is exhausted. Returns the emulate-loop's final [`ReturnCode`] alongside
/// the oracle's [`Verdict`] if a halting point was reached and evaluated.
fn run_until_halting_point(emulator: &mut Emulator, ctx: &Context, sorted_halting_points: &[u32], budget: u64) -> (ReturnCode, Option<Verdict>) {
    let deadline = emulator.instructions_executed().saturating_add(budget);
    loop {
        let pc = emulator.pc();
        if Context::is_halting_point_sorted(sorted_halting_points, pc) {
            let verdict = ctx.evaluate(emulator, pc);
            if verdict != Verdict::ContinueSimulation {
                return (ReturnCode::StopEmulationCalled, Some(verdict));
            }
        }
        if emulator.instructions_executed() >= deadline {
            return (ReturnCode::MaxInstructionsReached, None);
        }
        let code = emulator.step();
        if code != ReturnCode::Ok {
            return (code, None);
        }
    }
}

/// Step until `target` is reached, a fault return code is hit, or
/// `max_steps` instructions pass without reaching it (step 3a of §4.5:
/// "re-emulate to the PC of `sites[ci]`").
fn run_to_address(emulator: &mut Emulator, target: u32, max_steps: u64) -> (ReturnCode, u64) {
    let mut steps = 0;
    while emulator.pc() != target {
        if steps >= max_steps {
            return (ReturnCode::MaxInstructionsReached, steps);
        }
        let code = emulator.step();
        steps += 1;
        if code != ReturnCode::Ok {
            return (code, steps);
        }
    }
    (ReturnCode::Ok, steps)
}

/// Run to a halting point exactly like [`run_until_halting_point`], but with
/// an `instruction_executed` hook installed that reverts `reg` to `original`
/// once the instruction immediately following injection has executed
/// (spec.md §4.5 transient register fault: the original's
/// `revert_transient_fault` checks `emu.get_time() == fault->time` inside
/// the hook itself; our `instruction_executed_hooks` dispatch fires after
/// [`Emulator::step`] has already incremented its instruction counter, so
/// the equivalent check here is `instructions_executed() == fault.time + 1`
/// — i.e. "the first instruction to execute after the fault was injected
/// has just finished"). [`crate::emulator::hooks::Hooks`] callbacks carry
/// only their dispatched argument, not an emulator handle, so the hook
/// itself cannot perform the write; it flags a shared cell instead, and
/// this function applies the revert right after the `step()` call that set
/// the flag.
fn run_until_halting_point_with_register_revert(
    emulator: &mut Emulator,
    ctx: &Context,
    sorted_halting_points: &[u32],
    budget: u64,
    reg: Register,
    original: u32,
    fault_time: u64,
) -> (ReturnCode, Option<Verdict>) {
    let deadline = emulator.instructions_executed().saturating_add(budget);
    let fired = Rc::new(Cell::new(false));
    let hook_fired = fired.clone();
    let hook_id = emulator.instruction_executed_hooks.register(move |_address| hook_fired.set(true));

    let mut reverted = false;
    let outcome = loop {
        let pc = emulator.pc();
        if Context::is_halting_point_sorted(sorted_halting_points, pc) {
            let verdict = ctx.evaluate(emulator, pc);
            if verdict != Verdict::ContinueSimulation {
                break (ReturnCode::StopEmulationCalled, Some(verdict));
            }
        }
        if emulator.instructions_executed() >= deadline {
            break (ReturnCode::MaxInstructionsReached, None);
        }
        let code = emulator.step();
        if !reverted && fired.get() && emulator.instructions_executed() == fault_time + 1 {
            emulator.cpu.registers.write(reg, original);
            reverted = true;
        }
        if code != ReturnCode::Ok {
            break (code, None);
        }
    };
    emulator.instruction_executed_hooks.remove(hook_id);
    outcome
}

/// Advance exactly `n` steps, stopping early on the first non-`Ok` return
/// code (spec.md §4.5: the original's `emu.emulate(current_index -
/// last_index)` runs a fixed instruction count rather than to an address).
fn run_n_steps(emulator: &mut Emulator, n: u64) -> ReturnCode {
    let mut code = ReturnCode::Ok;
    for _ in 0..n {
        code = emulator.step();
        if code != ReturnCode::Ok {
            return code;
        }
    }
    code
}

/// Walk up to `budget` instructions forward from the current state,
/// recording which registers each executed instruction reads (spec.md §4.5:
/// the original's `add_new_registers_vector`/`collect_read_registers` hook
/// pair). Entry `i` is the sorted, deduplicated set of registers read by the
/// `i`-th instruction executed from the current state; an instruction
/// inside an ignored memory range or at an ignored time records as empty.
/// Does not stop early at halting points — like the original, this walk is
/// purely exploratory and the caller discards/restores the emulator state
/// before replaying against the recorded indices.
fn collect_read_registers_per_instruction(emulator: &mut Emulator, ctx: &Context, budget: u64) -> Vec<Vec<Register>> {
    let collection: Rc<RefCell<Vec<Vec<Register>>>> = Rc::new(RefCell::new(vec![Vec::new()]));
    let ignore_memory = ctx.ignore_memory_ranges.clone();
    let ignore_time = ctx.ignore_time_ranges.clone();
    let next_time = Rc::new(Cell::new(emulator.instructions_executed()));

    let read_collection = collection.clone();
    let read_hook = emulator.before_register_read_hooks.register(move |reg| {
        read_collection.borrow_mut().last_mut().unwrap().push(reg);
    });

    let exec_collection = collection.clone();
    let exec_next_time = next_time.clone();
    let exec_hook = emulator.instruction_executed_hooks.register(move |address| {
        let time = exec_next_time.get();
        let mut all = exec_collection.borrow_mut();
        let current = all.last_mut().unwrap();
        let ignored = ignore_memory.iter().any(|r| r.contains(&address)) || ignore_time.iter().any(|r| r.contains(&time));
        if ignored {
            current.clear();
        }
        if !current.is_empty() {
            current.sort();
            current.dedup();
        }
        all.push(Vec::new());
        exec_next_time.set(time + 1);
    });

    for _ in 0..budget {
        if emulator.step() != ReturnCode::Ok {
            break;
        }
    }

    emulator.before_register_read_hooks.remove(read_hook);
    emulator.instruction_executed_hooks.remove(exec_hook);

    let mut result = Rc::try_unwrap(collection).expect("hooks removed; sole owner").into_inner();
    result.pop(); // the trailing empty entry pushed after the last executed instruction
    result
}

fn record_if_exploitable(
    verdict: Option<Verdict>,
    new_chain: &FaultCombination,
    is_redundant: &mut impl FnMut(&FaultCombination) -> bool,
    out: &mut Vec<FaultCombination>,
) -> bool {
    if verdict == Some(Verdict::Exploitable) {
        if !is_redundant(new_chain) {
            out.push(new_chain.clone());
        }
        true
    } else {
        false
    }
}

/// Dispatch a single position `order` of `trial.permutation` by model
/// variant and permanence (spec.md §4.4 `simulate_fault`).
#[allow(clippy::too_many_arguments)]
pub(super) fn simulate_fault(
    emulator: &mut Emulator,
    trial: &Trial<'_>,
    order: usize,
    remaining: u64,
    chain: &FaultCombination,
    new_faults: &mut Vec<FaultCombination>,
    is_redundant: &mut impl FnMut(&FaultCombination) -> bool,
) {
    if order >= trial.permutation.len() || remaining == 0 {
        return;
    }
    let model_index = trial.permutation[order];
    match &trial.models[model_index] {
        FaultModel::Instruction(model) => match model.lifetime {
            crate::fault::InstructionFaultLifetime::Transient => {
                simulate_transient_instruction_fault(emulator, trial, model_index, order, remaining, chain, new_faults, is_redundant)
            }
            crate::fault::InstructionFaultLifetime::Permanent => {
                simulate_permanent_instruction_fault(emulator, trial, model_index, order, remaining, chain, new_faults, is_redundant)
            }
        },
        FaultModel::Register(model) => match model.lifetime {
            crate::fault::RegisterFaultLifetime::Permanent => {
                simulate_permanent_register_fault(emulator, trial, model_index, order, remaining, chain, new_faults, is_redundant)
            }
            _ => simulate_transient_register_fault(emulator, trial, model_index, order, remaining, chain, new_faults, is_redundant),
        },
    }
}

#[allow(clippy::too_many_arguments)]
fn simulate_transient_instruction_fault(
    emulator: &mut Emulator,
    trial: &Trial<'_>,
    model_index: usize,
    order: usize,
    mut remaining: u64,
    chain: &FaultCombination,
    new_faults: &mut Vec<FaultCombination>,
    is_redundant: &mut impl FnMut(&FaultCombination) -> bool,
) {
    let model = match &trial.models[model_index] {
        FaultModel::Instruction(m) => m,
        _ => return,
    };

    let mut snap = Snapshot::new(emulator);
    snap.reset();
    snap.backup();

    let sites = {
        let mut sites = Vec::new();
        loop {
            let pc = snap.emulator_mut().pc();
            if Context::is_halting_point_sorted(trial.sorted_halting_points, pc) {
                break;
            }
            if snap.emulator_mut().instructions_executed() >= remaining || trial.ctx.in_ignored_memory(pc) || trial.ctx.in_ignored_time(snap.emulator_mut().instructions_executed()) {
                // nothing faultable here; still step so the walk terminates
            } else {
                let len = if snap.emulator_mut().flash.contains(pc, 4) { 4 } else { 2 };
                sites.push(FaultableSite { address: pc, size: len });
            }
            if snap.emulator_mut().step() != ReturnCode::Ok {
                break;
            }
        }
        sites
    };

    for site in &sites {
        if chain.instruction_faults().iter().any(|f| f.address == site.address) {
            continue;
        }
        snap.restore();
        let (reach_code, steps_to_site) = run_to_address(snap.emulator_mut(), site.address, remaining);
        remaining = remaining.saturating_sub(steps_to_site);
        if reach_code != ReturnCode::Ok {
            // failed to reach the site cleanly (e.g. a prior fault altered
            // control flow, or the budget ran out); skip this site for
            // this chain.
            continue;
        }

        let template = InstructionFault { time: snap.emulator_mut().instructions_executed(), address: site.address, fault_model_iteration: 0, model_index };
        let iterations = (model.iteration_count)(&template);
        for iteration in 0..iterations {
            let fault = InstructionFault { time: snap.emulator_mut().instructions_executed(), address: site.address, fault_model_iteration: iteration, model_index };
            let instruction = match snap.emulator_mut().read_memory(site.address, site.size).ok().and_then(|bytes| {
                decoder::decode(
                    snap.emulator_mut().cpu.architecture,
                    site.address,
                    &bytes,
                    snap.emulator_mut().cpu.registers.in_it_block(),
                    snap.emulator_mut().cpu.registers.last_in_it_block(),
                )
                .ok()
            }) {
                Some(i) => i,
                None => continue,
            };
            if !(model.is_applicable)(&instruction) {
                continue;
            }
            let original = snap.emulator_mut().read_memory(site.address, site.size).unwrap();
            let mut manipulated = original.clone();
            (model.inject)(&fault, &mut manipulated);
            if manipulated == original {
                continue;
            }

            let mut new_chain = chain.clone();
            new_chain.push_instruction_fault(fault);
            if is_redundant(&new_chain) {
                continue;
            }

            snap.restore();
            snap.emulator_mut().flash.load(site.address, &manipulated).expect("site is within flash");
            let step_code = snap.emulator_mut().step();
            remaining = remaining.saturating_sub(1);
            snap.emulator_mut().flash.load(site.address, &original).expect("site is within flash");

            if step_code == ReturnCode::Ok && remaining > 0 {
                let (_, verdict) = run_until_halting_point(snap.emulator_mut(), trial.ctx, trial.sorted_halting_points, remaining);
                let exploited = record_if_exploitable(verdict, &new_chain, is_redundant, new_faults);
                if !exploited && order + 1 < trial.permutation.len() && remaining > 2 {
                    snap.restore();
                    snap.emulator_mut().flash.load(site.address, &manipulated).expect("site is within flash");
                    let _ = snap.emulator_mut().step();
                    snap.emulator_mut().flash.load(site.address, &original).expect("site is within flash");
                    simulate_fault(snap.emulator_mut(), trial, order + 1, remaining - 1, &new_chain, new_faults, is_redundant);
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn simulate_permanent_instruction_fault(
    emulator: &mut Emulator,
    trial: &Trial<'_>,
    model_index: usize,
    order: usize,
    remaining: u64,
    chain: &FaultCombination,
    new_faults: &mut Vec<FaultCombination>,
    is_redundant: &mut impl FnMut(&FaultCombination) -> bool,
) {
    let model = match &trial.models[model_index] {
        FaultModel::Instruction(m) => m,
        _ => return,
    };
    let sites = faultable_instruction_table(emulator, trial.ctx);

    for site in &sites {
        if chain.instruction_faults().iter().any(|f| f.address == site.address) {
            continue;
        }
        let original = emulator.flash.read_bytes(site.address, site.size).expect("site is within flash").to_vec();
        let template = InstructionFault { time: emulator.instructions_executed(), address: site.address, fault_model_iteration: 0, model_index };
        let iterations = (model.iteration_count)(&template);
        for iteration in 0..iterations {
            let fault = InstructionFault { time: emulator.instructions_executed(), address: site.address, fault_model_iteration: iteration, model_index };
            let mut manipulated = original.clone();
            (model.inject)(&fault, &mut manipulated);
            if manipulated == original {
                continue;
            }
            if decoder::decode(emulator.cpu.architecture, site.address, &manipulated, false, false).is_err() {
                continue;
            }

            let mut new_chain = chain.clone();
            new_chain.push_instruction_fault(fault);
            if is_redundant(&new_chain) {
                continue;
            }

            let mut snap = Snapshot::new(emulator);
            snap.backup();
            snap.emulator_mut().flash.load(site.address, &manipulated).expect("site is within flash");

            if order + 1 < trial.permutation.len() {
                simulate_fault(snap.emulator_mut(), trial, order + 1, remaining, &new_chain, new_faults, is_redundant);
            } else {
                let (_, verdict) = run_until_halting_point(snap.emulator_mut(), trial.ctx, trial.sorted_halting_points, remaining);
                record_if_exploitable(verdict, &new_chain, is_redundant, new_faults);
            }

            snap.emulator_mut().flash.load(site.address, &original).expect("site is within flash");
            snap.restore();
        }
    }
}

/// Whether a previously-chained register fault's own model is permanent,
/// looked up by the `model_index` the chain entry was recorded under
/// (spec.md §4.5 "already processed" check: `other.model->is_permanent()`).
fn register_fault_model_is_permanent(trial: &Trial<'_>, model_index: usize) -> bool {
    matches!(&trial.models[model_index], FaultModel::Register(m) if matches!(m.lifetime, crate::fault::RegisterFaultLifetime::Permanent))
}

#[allow(clippy::too_many_arguments)]
fn simulate_transient_register_fault(
    emulator: &mut Emulator,
    trial: &Trial<'_>,
    model_index: usize,
    order: usize,
    mut remaining: u64,
    chain: &FaultCombination,
    new_faults: &mut Vec<FaultCombination>,
    is_redundant: &mut impl FnMut(&FaultCombination) -> bool,
) {
    let model = match &trial.models[model_index] {
        FaultModel::Register(m) => m,
        _ => return,
    };
    let until_overwrite = matches!(model.lifetime, crate::fault::RegisterFaultLifetime::UntilOverwrite);

    let mut snap = Snapshot::new(emulator);
    snap.reset();
    snap.backup();

    // Walk the whole remaining budget once, recording which registers each
    // instruction reads, then replay only at the indices that read
    // anything (spec.md §4.5: "walk the program to record, per executed
    // instruction, the list of registers read by that instruction").
    let read_registers = collect_read_registers_per_instruction(snap.emulator_mut(), trial.ctx, remaining);
    let instruction_count = read_registers.len() as u64;
    let mut last_index: u64 = 0;

    for current_index in 0..instruction_count {
        if read_registers[current_index as usize].is_empty() {
            continue;
        }

        snap.restore();
        if last_index < current_index {
            let code = run_n_steps(snap.emulator_mut(), current_index - last_index);
            remaining = remaining.saturating_sub(current_index - last_index);
            last_index = current_index;
            if code != ReturnCode::Ok {
                return;
            }
        }
        if remaining == 0 {
            return;
        }
        snap.backup();

        let now = snap.emulator_mut().instructions_executed();

        for reg in read_registers[current_index as usize].iter().copied() {
            if reg == Register::PC || !(model.is_applicable)(reg) {
                continue;
            }
            let already_processed = chain
                .register_faults()
                .iter()
                .any(|f| f.reg == reg && (f.time == now || register_fault_model_is_permanent(trial, f.model_index)));
            if already_processed {
                continue;
            }

            snap.restore();
            let original = snap.emulator_mut().cpu.registers.read(reg);
            let template = RegisterFault { time: now, reg, fault_model_iteration: 0, model_index };
            let iterations = (model.iteration_count)(&template);

            for iteration in 0..iterations {
                let fault = RegisterFault { time: now, reg, fault_model_iteration: iteration, model_index };
                let manipulated = (model.inject)(&fault, original);
                if manipulated == original {
                    continue;
                }

                let mut new_chain = chain.clone();
                new_chain.push_register_fault(fault);
                if is_redundant(&new_chain) {
                    continue;
                }

                snap.restore();
                snap.emulator_mut().cpu.registers.write(reg, manipulated);
                if snap.emulator_mut().cpu.registers.read(reg) != manipulated && reg != Register::PSR {
                    continue;
                }

                let before_count = snap.emulator_mut().instructions_executed();
                let (_, verdict) = if until_overwrite {
                    run_until_halting_point(snap.emulator_mut(), trial.ctx, trial.sorted_halting_points, remaining)
                } else {
                    run_until_halting_point_with_register_revert(snap.emulator_mut(), trial.ctx, trial.sorted_halting_points, remaining, reg, original, now)
                };
                let after_count = snap.emulator_mut().instructions_executed();
                remaining = remaining.saturating_sub(after_count - before_count);

                let exploited = record_if_exploitable(verdict, &new_chain, is_redundant, new_faults);
                if !exploited && order + 1 < trial.permutation.len() && remaining > 0 {
                    snap.restore();
                    snap.emulator_mut().cpu.registers.write(reg, manipulated);
                    simulate_fault(snap.emulator_mut(), trial, order + 1, remaining, &new_chain, new_faults, is_redundant);
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn simulate_permanent_register_fault(
    emulator: &mut Emulator,
    trial: &Trial<'_>,
    model_index: usize,
    order: usize,
    remaining: u64,
    chain: &FaultCombination,
    new_faults: &mut Vec<FaultCombination>,
    is_redundant: &mut impl FnMut(&FaultCombination) -> bool,
) {
    let model = match &trial.models[model_index] {
        FaultModel::Register(m) => m,
        _ => return,
    };

    for reg in ALL_REGISTERS {
        if chain.register_faults().iter().any(|f| f.reg == reg) || !(model.is_applicable)(reg) {
            continue;
        }

        let mut snap = Snapshot::new(emulator);
        snap.backup();
        let original = snap.emulator_mut().cpu.registers.read(reg);
        let template = RegisterFault { time: snap.emulator_mut().instructions_executed(), reg, fault_model_iteration: 0, model_index };
        let iterations = (model.iteration_count)(&template);

        for iteration in 0..iterations {
            let fault = RegisterFault { time: snap.emulator_mut().instructions_executed(), reg, fault_model_iteration: iteration, model_index };
            let manipulated = (model.inject)(&fault, original);
            if manipulated == original {
                continue;
            }

            let mut new_chain = chain.clone();
            new_chain.push_register_fault(fault);
            if is_redundant(&new_chain) {
                continue;
            }

            snap.restore();
            snap.emulator_mut().cpu.registers.write(reg, manipulated);

            // Install an after-register-write hook that re-applies the
            // mutator whenever the program itself later overwrites `reg`
            // (spec.md §4.6, GLOSSARY "Permanent fault" — grounded on the
            // original's `handle_permanent_register_fault_overwrite`). The
            // hook cannot write through the emulator directly (it only
            // receives the written `(Register, u32)`, not a handle), so it
            // queues the corrected value on `Emulator`'s pending-override
            // queue; `Emulator::write_register` drains that queue itself
            // right after dispatching this very hook, applying the
            // correction without re-triggering it.
            let overrides = snap.emulator_mut().register_override_queue();
            let inject = model.inject.clone();
            let watched_reg = reg;
            let model_index_for_reapply = model_index;
            let hook_id = snap.emulator_mut().after_register_write_hooks.register(move |(written_reg, value)| {
                if written_reg == watched_reg {
                    let reapplied_fault = RegisterFault { time: fault.time, reg: watched_reg, fault_model_iteration: fault.fault_model_iteration, model_index: model_index_for_reapply };
                    let corrected = (inject)(&reapplied_fault, value);
                    if corrected != value {
                        overrides.borrow_mut().push((watched_reg, corrected));
                    }
                }
            });

            if order + 1 < trial.permutation.len() {
                simulate_fault(snap.emulator_mut(), trial, order + 1, remaining, &new_chain, new_faults, is_redundant);
            } else {
                let (_, verdict) = run_until_halting_point(snap.emulator_mut(), trial.ctx, trial.sorted_halting_points, remaining);
                record_if_exploitable(verdict, &new_chain, is_redundant, new_faults);
            }

            snap.emulator_mut().after_register_write_hooks.remove(hook_id);
        }
        snap.restore();
    }
}
