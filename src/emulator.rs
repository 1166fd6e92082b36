//! Cycle-stepped ARM Thumb/Thumb-2 execution core (spec.md §4.1).
//!
//! [`Emulator`] owns a flash region, a RAM region, the register file, and
//! the hook registries client code (the fault explorer, the tracer, demo
//! binaries) attaches to. Everything in here is pure state transition: no
//! fault-injection policy lives here, only the mechanism faults are
//! injected through (memory writes, register writes, `emulate` itself).

pub mod arith;
mod execute;
pub mod hooks;
pub mod memory;

pub use hooks::{HookId, Hooks};
pub use memory::{Access, MemoryRegion};

use crate::arch::{Architecture, Instruction, Register, REGISTER_COUNT};
use crate::decoder;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use tracing::{instrument, trace};

/// Outcome of an emulation run (spec.md §4.1). Not an error type: a fault
/// run that ends in `HardFault` succeeded at its job of exercising fault
/// behavior (spec.md §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Ok,
    MaxInstructionsReached,
    EndAddressReached,
    StopEmulationCalled,
    InvalidMemoryAccess,
    IncompleteData,
    HardFault,
    Undefined,
    Unpredictable,
    Unsupported,
    InvalidAlignment,
    InvalidShiftArgument,
    InvalidImmediate,
    InvalidRegister,
    Uninitialized,
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// The 17-entry register file plus condition flags and IT-block state
/// (spec.md §3 `Registers`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registers {
    values: [u32; REGISTER_COUNT],
    pub n: bool,
    pub z: bool,
    pub c: bool,
    pub v: bool,
    pub q: bool,
    /// ITSTATE (spec.md §4.1): the 8-bit IT-block condition/mask state.
    pub it_state: u8,
}

impl Registers {
    pub fn new() -> Registers {
        Registers {
            values: [0; REGISTER_COUNT],
            n: false,
            z: false,
            c: false,
            v: false,
            q: false,
            it_state: 0,
        }
    }

    /// Reading PC returns `stored_pc + 4`: the ARM pipeline convention
    /// where PC-relative arithmetic sees "address of this instruction + 4
    /// bytes" rather than the raw program counter (spec.md §3).
    pub fn read(&self, reg: Register) -> u32 {
        let raw = self.values[reg.index()];
        if reg == Register::PC {
            raw.wrapping_add(4)
        } else {
            raw
        }
    }

    /// The raw stored program counter, without the `+4` read-time bias.
    pub fn pc_raw(&self) -> u32 {
        self.values[Register::PC.index()]
    }

    /// Write a register. SP writes truncate the low 2 bits (spec.md §3):
    /// the stack pointer is always word-aligned by construction.
    pub fn write(&mut self, reg: Register, value: u32) {
        let value = if reg == Register::SP { value & !0b11 } else { value };
        self.values[reg.index()] = value;
    }

    pub fn set_pc_raw(&mut self, address: u32) {
        self.values[Register::PC.index()] = address;
    }

    pub fn in_it_block(&self) -> bool {
        self.it_state & 0b1111 != 0
    }

    pub fn last_in_it_block(&self) -> bool {
        self.it_state & 0b1111 == 0b1000
    }

    /// Advance ITSTATE by one instruction, per the ARM pseudocode
    /// `ITAdvance()`.
    pub fn it_advance(&mut self) {
        if self.it_state & 0b111 == 0 {
            self.it_state = 0;
        } else {
            let cond = self.it_state & 0b1110_0000;
            let rest = (self.it_state << 1) & 0b0001_1111;
            self.it_state = cond | rest;
        }
    }

    /// The condition the current instruction executes under, given
    /// ITSTATE (spec.md §4.1 `evaluate_condition`).
    pub fn current_condition_bits(&self) -> u8 {
        self.it_state >> 4
    }
}

impl Default for Registers {
    fn default() -> Registers {
        Registers::new()
    }
}

/// Architecture variant plus the live register file (spec.md §3 `CPUState`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuState {
    pub architecture: Architecture,
    pub registers: Registers,
}

impl CpuState {
    pub fn new(architecture: Architecture) -> CpuState {
        CpuState { architecture, registers: Registers::new() }
    }
}

/// Executable/mutable simulator state: one flash region, one RAM region,
/// a `CpuState`, and the hook registries fault injection and tracing hang
/// off of (spec.md §6 `Emulator`).
pub struct Emulator {
    pub flash: MemoryRegion,
    pub ram: MemoryRegion,
    pub cpu: CpuState,
    pub max_instructions: u64,
    instructions_executed: u64,
    /// The twelve named hook points of spec.md §2/§6, grounded 1:1 on
    /// `examples/original_source/subprojects/m-ulator/include/m-ulator/emulator.h`'s
    /// `CallbackHook<...>` members.
    pub before_fetch_hooks: Hooks<u32>,
    pub instruction_decoded_hooks: Hooks<u32>,
    pub instruction_executed_hooks: Hooks<u32>,
    pub before_memory_read_hooks: Hooks<(u32, u32)>,
    pub after_memory_read_hooks: Hooks<(u32, u32)>,
    pub before_memory_write_hooks: Hooks<(u32, u32)>,
    pub after_memory_write_hooks: Hooks<(u32, u32)>,
    pub before_register_read_hooks: Hooks<Register>,
    pub after_register_read_hooks: Hooks<Register>,
    pub before_register_write_hooks: Hooks<(Register, u32)>,
    pub after_register_write_hooks: Hooks<(Register, u32)>,
    /// Corrected `(register, value)` pairs queued by an
    /// `after_register_write_hooks` callback that wants to write back
    /// through the register file without re-triggering itself (spec.md
    /// §4.6 permanent register faults: the hook only receives the written
    /// register/value, not a handle to `self`, so it can't call
    /// `write_register` directly). Drained by `write_register` right after
    /// dispatching that same hook.
    pending_register_overrides: Rc<RefCell<Vec<(Register, u32)>>>,
    last_return_code: ReturnCode,
}

impl Emulator {
    pub fn new(architecture: Architecture, flash: MemoryRegion, ram: MemoryRegion) -> Emulator {
        Emulator {
            flash,
            ram,
            cpu: CpuState::new(architecture),
            max_instructions: u64::MAX,
            instructions_executed: 0,
            before_fetch_hooks: Hooks::new(),
            instruction_decoded_hooks: Hooks::new(),
            instruction_executed_hooks: Hooks::new(),
            before_memory_read_hooks: Hooks::new(),
            after_memory_read_hooks: Hooks::new(),
            before_memory_write_hooks: Hooks::new(),
            after_memory_write_hooks: Hooks::new(),
            before_register_read_hooks: Hooks::new(),
            after_register_read_hooks: Hooks::new(),
            before_register_write_hooks: Hooks::new(),
            after_register_write_hooks: Hooks::new(),
            pending_register_overrides: Rc::new(RefCell::new(Vec::new())),
            last_return_code: ReturnCode::Ok,
        }
    }

    /// A fresh `Emulator` with the same flash/RAM bytes and CPU state but
    /// empty hook registries (spec.md §4.1 "copy semantics" — hook
    /// callbacks are not `Clone`, so a fork starts hookless; callers that
    /// need hooks active in the fork re-register them, which is how every
    /// caller in this crate uses `fork`: the explorer and tracer always
    /// install their own snapshot/oracle hooks fresh per trial).
    pub fn fork(&self) -> Emulator {
        Emulator {
            flash: self.flash.clone(),
            ram: self.ram.clone(),
            cpu: self.cpu,
            max_instructions: self.max_instructions,
            instructions_executed: self.instructions_executed,
            before_fetch_hooks: Hooks::new(),
            instruction_decoded_hooks: Hooks::new(),
            instruction_executed_hooks: Hooks::new(),
            before_memory_read_hooks: Hooks::new(),
            after_memory_read_hooks: Hooks::new(),
            before_memory_write_hooks: Hooks::new(),
            after_memory_write_hooks: Hooks::new(),
            before_register_read_hooks: Hooks::new(),
            after_register_read_hooks: Hooks::new(),
            before_register_write_hooks: Hooks::new(),
            after_register_write_hooks: Hooks::new(),
            pending_register_overrides: Rc::new(RefCell::new(Vec::new())),
            last_return_code: self.last_return_code,
        }
    }

    /// Read a register with `before`/`after_register_read` hooks firing
    /// around the access (spec.md §2 hook points).
    pub fn read_register(&mut self, reg: Register) -> u32 {
        self.before_register_read_hooks.dispatch(reg);
        let value = self.cpu.registers.read(reg);
        self.after_register_read_hooks.dispatch(reg);
        value
    }

    /// Write a register with `before`/`after_register_write` hooks firing
    /// around the access (spec.md §2 hook points). Drains any corrected
    /// values an `after_register_write` callback queued via
    /// `register_override_queue` once the hook itself has returned.
    pub fn write_register(&mut self, reg: Register, value: u32) {
        self.before_register_write_hooks.dispatch((reg, value));
        self.cpu.registers.write(reg, value);
        self.after_register_write_hooks.dispatch((reg, value));
        let overrides: Vec<(Register, u32)> = self.pending_register_overrides.borrow_mut().drain(..).collect();
        for (overridden_reg, overridden_value) in overrides {
            self.cpu.registers.write(overridden_reg, overridden_value);
        }
    }

    /// A handle fault-injection code can queue `(register, value)`
    /// corrections into from inside an `after_register_write_hooks`
    /// callback (spec.md §4.6): the callback itself has no way to write
    /// through the register file, since hooks receive only their dispatched
    /// argument, not a handle to this `Emulator`.
    pub fn register_override_queue(&self) -> Rc<RefCell<Vec<(Register, u32)>>> {
        self.pending_register_overrides.clone()
    }

    pub fn instructions_executed(&self) -> u64 {
        self.instructions_executed
    }

    pub fn last_return_code(&self) -> ReturnCode {
        self.last_return_code
    }

    pub fn pc(&self) -> u32 {
        self.cpu.registers.pc_raw()
    }

    /// Read `len` bytes at `address` from whichever region contains them.
    pub fn read_memory(&mut self, address: u32, len: u32) -> Result<Vec<u8>, ReturnCode> {
        self.before_memory_read_hooks.dispatch((address, len));
        let result = if self.flash.contains(address, len) {
            self.flash.read_bytes(address, len).map(|b| b.to_vec()).map_err(|_| ReturnCode::InvalidMemoryAccess)
        } else if self.ram.contains(address, len) {
            self.ram.read_bytes(address, len).map(|b| b.to_vec()).map_err(|_| ReturnCode::InvalidMemoryAccess)
        } else {
            Err(ReturnCode::InvalidMemoryAccess)
        };
        if result.is_ok() {
            self.after_memory_read_hooks.dispatch((address, len));
        }
        result
    }

    pub fn read_u32(&self, address: u32) -> Result<u32, ReturnCode> {
        if self.flash.contains(address, 4) {
            return self.flash.read_u32(address).map_err(|_| ReturnCode::InvalidMemoryAccess);
        }
        self.ram.read_u32(address).map_err(|_| ReturnCode::InvalidMemoryAccess)
    }

    pub fn read_sized(&mut self, address: u32, size: u32) -> Result<u32, ReturnCode> {
        let bytes = self.read_memory(address, size)?;
        Ok(match size {
            1 => bytes[0] as u32,
            2 => u16::from_le_bytes([bytes[0], bytes[1]]) as u32,
            4 => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            _ => return Err(ReturnCode::InvalidAlignment),
        })
    }

    pub fn write_sized(&mut self, address: u32, value: u32, size: u32) -> Result<(), ReturnCode> {
        match size {
            1 => self.write_memory(address, &[value as u8]),
            2 => self.write_memory(address, &(value as u16).to_le_bytes()),
            4 => self.write_memory(address, &value.to_le_bytes()),
            _ => Err(ReturnCode::InvalidAlignment),
        }
    }

    pub fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), ReturnCode> {
        if !self.ram.contains(address, data.len() as u32) {
            return Err(ReturnCode::InvalidMemoryAccess);
        }
        self.before_memory_write_hooks.dispatch((address, data.len() as u32));
        self.ram.write_bytes(address, data).map_err(|_| ReturnCode::InvalidMemoryAccess)?;
        self.after_memory_write_hooks.dispatch((address, data.len() as u32));
        Ok(())
    }

    fn fetch(&mut self, address: u32) -> Result<Instruction, ReturnCode> {
        let max_len = if self.flash.contains(address, 4) { 4 } else { 2 };
        let bytes = self.read_memory(address, max_len)?;
        decoder::decode(
            self.cpu.architecture,
            address,
            &bytes,
            self.cpu.registers.in_it_block(),
            self.cpu.registers.last_in_it_block(),
        )
    }

    /// Execute exactly one instruction. Returns `Ok(return_code)` on a
    /// clean step (`return_code` is usually `ReturnCode::Ok`, unless this
    /// step halted execution) and `Err` only for decode failures that are
    /// themselves a `ReturnCode`.
    #[instrument(level = "trace", skip(self), fields(pc = self.pc()))]
    pub fn step(&mut self) -> ReturnCode {
        let pc = self.pc();
        self.before_fetch_hooks.dispatch(pc);
        let instruction = match self.fetch(pc) {
            Ok(i) => i,
            Err(code) => {
                self.last_return_code = code;
                return code;
            }
        };
        self.instruction_decoded_hooks.dispatch(instruction.address);
        self.cpu.registers.set_pc_raw(pc.wrapping_add(instruction.size as u32));
        let condition = if self.cpu.registers.in_it_block() {
            crate::arch::Condition::from_bits(self.cpu.registers.current_condition_bits())
        } else {
            instruction.condition
        };
        let n = self.cpu.registers.n;
        let z = self.cpu.registers.z;
        let c = self.cpu.registers.c;
        let v = self.cpu.registers.v;
        let code = if condition.holds(n, z, c, v) {
            execute::execute(self, &instruction)
        } else {
            trace!(mnemonic = %instruction.mnemonic, "skipped by IT condition");
            ReturnCode::Ok
        };
        self.cpu.registers.it_advance();
        self.instructions_executed += 1;
        self.last_return_code = code;
        self.instruction_executed_hooks.dispatch(instruction.address);
        code
    }

    /// Run until `end_address` is reached (spec.md §4.1): the contract the
    /// explorer leans on is that this returns exactly
    /// `ReturnCode::EndAddressReached` or `ReturnCode::MaxInstructionsReached`
    /// on any non-faulted run; anything else is a fault signal.
    pub fn emulate(&mut self, end_address: u32) -> ReturnCode {
        loop {
            if self.pc() == end_address {
                self.last_return_code = ReturnCode::EndAddressReached;
                return ReturnCode::EndAddressReached;
            }
            if self.instructions_executed >= self.max_instructions {
                self.last_return_code = ReturnCode::MaxInstructionsReached;
                return ReturnCode::MaxInstructionsReached;
            }
            let code = self.step();
            if code != ReturnCode::Ok {
                return code;
            }
        }
    }
}

impl fmt::Debug for Emulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emulator")
            .field("architecture", &self.cpu.architecture)
            .field("pc", &format_args!("{:#010x}", self.pc()))
            .field("instructions_executed", &self.instructions_executed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_emulator(code: &[u8]) -> Emulator {
        let mut flash = MemoryRegion::flash(0x0800_0000, 0x1000);
        flash.load(0x0800_0000, code).unwrap();
        let ram = MemoryRegion::ram(0x2000_0000, 0x1000);
        let mut emulator = Emulator::new(Architecture::ARMv7M, flash, ram);
        emulator.cpu.registers.set_pc_raw(0x0800_0000);
        emulator.cpu.registers.write(Register::SP, 0x2000_1000);
        emulator
    }

    #[test]
    fn two_nops_then_bx_lr_reaches_end_address() {
        // NOP; NOP; BX LR, matching the seeded S1 scenario bytes.
        let code = [0x00, 0xbf, 0x00, 0xbf, 0x70, 0x47];
        let mut emulator = make_emulator(&code);
        emulator.cpu.registers.write(Register::LR, 0x0800_0006);
        let result = emulator.emulate(0x0800_0006);
        assert_eq!(result, ReturnCode::EndAddressReached);
        assert_eq!(emulator.instructions_executed(), 3);
    }

    #[test]
    fn sp_writes_truncate_to_word_alignment() {
        let mut regs = Registers::new();
        regs.write(Register::SP, 0x2000_1003);
        assert_eq!(regs.read(Register::SP), 0x2000_1000);
    }

    #[test]
    fn pc_reads_four_ahead_of_stored_value() {
        let mut regs = Registers::new();
        regs.set_pc_raw(0x0800_0010);
        assert_eq!(regs.read(Register::PC), 0x0800_0014);
    }
}
