//! Instruction execution dispatch (spec.md §4.1 `execute`).

use super::arith::{add_with_carry, shift_c};
use super::{Emulator, ReturnCode};
use crate::arch::{Instruction, Mnemonic, Register, ShiftType};

fn reg(r: Option<Register>) -> Register {
    r.expect("operand shape guarantees this register is present")
}

fn set_nz(emulator: &mut Emulator, result: u32) {
    emulator.cpu.registers.n = (result >> 31) & 1 == 1;
    emulator.cpu.registers.z = result == 0;
}

fn low_reg_list(mask: u32) -> Vec<Register> {
    (0..8u32)
        .filter(|i| (mask >> i) & 1 == 1)
        .map(|i| Register::from_index(i as usize).unwrap())
        .collect()
}

pub fn execute(emulator: &mut Emulator, ins: &Instruction) -> ReturnCode {
    match ins.mnemonic {
        Mnemonic::Nop | Mnemonic::It => ReturnCode::Ok,

        Mnemonic::Udf => ReturnCode::Undefined,
        Mnemonic::Svc => ReturnCode::HardFault,

        Mnemonic::MovImm => {
            emulator.write_register(reg(ins.rd), ins.imm);
            if ins.flags.s {
                set_nz(emulator, ins.imm);
            }
            ReturnCode::Ok
        }
        Mnemonic::MovReg => {
            let value = emulator.read_register(reg(ins.rm));
            emulator.write_register(reg(ins.rd), value);
            if ins.flags.s {
                set_nz(emulator, value);
            }
            ReturnCode::Ok
        }
        Mnemonic::MvnReg => {
            let value = !emulator.read_register(reg(ins.rm));
            emulator.write_register(reg(ins.rd), value);
            if ins.flags.s {
                set_nz(emulator, value);
            }
            ReturnCode::Ok
        }

        Mnemonic::AddImm => {
            let rn = emulator.read_register(reg(ins.rn));
            let (result, carry, overflow) = add_with_carry(rn, ins.imm, false);
            emulator.write_register(reg(ins.rd), result);
            if ins.flags.s {
                set_nz(emulator, result);
                emulator.cpu.registers.c = carry;
                emulator.cpu.registers.v = overflow;
            }
            ReturnCode::Ok
        }
        Mnemonic::AddReg => {
            let rn = emulator.read_register(reg(ins.rn));
            let rm = emulator.read_register(reg(ins.rm));
            let (result, carry, overflow) = add_with_carry(rn, rm, false);
            emulator.write_register(reg(ins.rd), result);
            if ins.flags.s {
                set_nz(emulator, result);
                emulator.cpu.registers.c = carry;
                emulator.cpu.registers.v = overflow;
            }
            ReturnCode::Ok
        }
        Mnemonic::AddSpImm => {
            let sp = emulator.read_register(reg(ins.rn));
            let (result, _, _) = add_with_carry(sp, ins.imm, false);
            emulator.write_register(reg(ins.rd), result);
            ReturnCode::Ok
        }

        Mnemonic::SubImm => {
            let rn = emulator.read_register(reg(ins.rn));
            let (result, carry, overflow) = add_with_carry(rn, !ins.imm, true);
            emulator.write_register(reg(ins.rd), result);
            if ins.flags.s {
                set_nz(emulator, result);
                emulator.cpu.registers.c = carry;
                emulator.cpu.registers.v = overflow;
            }
            ReturnCode::Ok
        }
        Mnemonic::SubReg => {
            let rn = emulator.read_register(reg(ins.rn));
            let rm = emulator.read_register(reg(ins.rm));
            let (result, carry, overflow) = add_with_carry(rn, !rm, true);
            emulator.write_register(reg(ins.rd), result);
            if ins.flags.s {
                set_nz(emulator, result);
                emulator.cpu.registers.c = carry;
                emulator.cpu.registers.v = overflow;
            }
            ReturnCode::Ok
        }
        Mnemonic::SubSpImm => {
            let sp = emulator.read_register(Register::SP);
            let (result, _, _) = add_with_carry(sp, !ins.imm, true);
            emulator.write_register(Register::SP, result);
            ReturnCode::Ok
        }

        Mnemonic::CmpImm => {
            let rn = emulator.read_register(reg(ins.rn));
            let (result, carry, overflow) = add_with_carry(rn, !ins.imm, true);
            set_nz(emulator, result);
            emulator.cpu.registers.c = carry;
            emulator.cpu.registers.v = overflow;
            ReturnCode::Ok
        }
        Mnemonic::CmpReg => {
            let rn = emulator.read_register(reg(ins.rn));
            let rm = emulator.read_register(reg(ins.rm));
            let (result, carry, overflow) = add_with_carry(rn, !rm, true);
            set_nz(emulator, result);
            emulator.cpu.registers.c = carry;
            emulator.cpu.registers.v = overflow;
            ReturnCode::Ok
        }
        Mnemonic::CmnReg => {
            let rn = emulator.read_register(reg(ins.rn));
            let rm = emulator.read_register(reg(ins.rm));
            let (result, carry, overflow) = add_with_carry(rn, rm, false);
            set_nz(emulator, result);
            emulator.cpu.registers.c = carry;
            emulator.cpu.registers.v = overflow;
            ReturnCode::Ok
        }

        Mnemonic::AndReg => logical(emulator, ins, |a, b| a & b),
        Mnemonic::OrrReg => logical(emulator, ins, |a, b| a | b),
        Mnemonic::EorReg => logical(emulator, ins, |a, b| a ^ b),
        Mnemonic::BicReg => logical(emulator, ins, |a, b| a & !b),
        Mnemonic::TstReg => {
            let rn = emulator.read_register(reg(ins.rn));
            let rm = emulator.read_register(reg(ins.rm));
            set_nz(emulator, rn & rm);
            ReturnCode::Ok
        }

        Mnemonic::LslImm | Mnemonic::LsrImm | Mnemonic::AsrImm => {
            let rm = emulator.read_register(reg(ins.rm));
            let carry_in = emulator.cpu.registers.c;
            let (result, carry) = shift_c(rm, ins.shift_type, ins.shift_amount, carry_in);
            emulator.write_register(reg(ins.rd), result);
            if ins.flags.s {
                set_nz(emulator, result);
                emulator.cpu.registers.c = carry;
            }
            ReturnCode::Ok
        }
        Mnemonic::LslReg | Mnemonic::LsrReg | Mnemonic::AsrReg | Mnemonic::RorReg => {
            let shift_type = match ins.mnemonic {
                Mnemonic::LslReg => ShiftType::Lsl,
                Mnemonic::LsrReg => ShiftType::Lsr,
                Mnemonic::AsrReg => ShiftType::Asr,
                _ => ShiftType::Ror,
            };
            let rdn = emulator.read_register(reg(ins.rd));
            let amount = emulator.read_register(reg(ins.rm)) & 0xFF;
            let carry_in = emulator.cpu.registers.c;
            let (result, carry) = shift_c(rdn, shift_type, amount, carry_in);
            emulator.write_register(reg(ins.rd), result);
            if ins.flags.s {
                set_nz(emulator, result);
                emulator.cpu.registers.c = carry;
            }
            ReturnCode::Ok
        }

        Mnemonic::B => {
            let target = (emulator.pc().wrapping_add(4)).wrapping_add(ins.imm);
            emulator.cpu.registers.set_pc_raw(target);
            ReturnCode::Ok
        }
        Mnemonic::Bl => {
            let return_address = emulator.cpu.registers.pc_raw().wrapping_add(ins.size as u32);
            emulator.write_register(Register::LR, return_address | 1);
            let target = (emulator.pc().wrapping_add(4)).wrapping_add(ins.imm);
            emulator.cpu.registers.set_pc_raw(target);
            ReturnCode::Ok
        }
        Mnemonic::Bx => {
            let target = emulator.read_register(reg(ins.rm));
            emulator.cpu.registers.set_pc_raw(target & !1);
            ReturnCode::Ok
        }
        Mnemonic::Blx => {
            let target = emulator.read_register(reg(ins.rm));
            let return_address = emulator.cpu.registers.pc_raw().wrapping_add(ins.size as u32);
            emulator.write_register(Register::LR, return_address | 1);
            emulator.cpu.registers.set_pc_raw(target & !1);
            ReturnCode::Ok
        }

        Mnemonic::Ldr | Mnemonic::Ldrh | Mnemonic::Ldrb => {
            let size = size_of(ins.mnemonic);
            let address = match load_store_address(emulator, ins) {
                Ok(a) => a,
                Err(code) => return code,
            };
            match emulator.read_sized(address, size) {
                Ok(value) => {
                    emulator.write_register(reg(ins.rd), value);
                    ReturnCode::Ok
                }
                Err(code) => code,
            }
        }
        Mnemonic::LdrLiteral => {
            let base = (emulator.pc().wrapping_add(4)) & !0b11;
            let address = base.wrapping_add(ins.imm);
            match emulator.read_sized(address, 4) {
                Ok(value) => {
                    emulator.write_register(reg(ins.rd), value);
                    ReturnCode::Ok
                }
                Err(code) => code,
            }
        }
        Mnemonic::Str | Mnemonic::Strh | Mnemonic::Strb => {
            let size = size_of(ins.mnemonic);
            let address = match load_store_address(emulator, ins) {
                Ok(a) => a,
                Err(code) => return code,
            };
            let value = emulator.read_register(reg(ins.rd));
            match emulator.write_sized(address, value, size) {
                Ok(()) => ReturnCode::Ok,
                Err(code) => code,
            }
        }

        Mnemonic::Push => {
            let mut regs = low_reg_list(ins.imm);
            if ins.imm2 == 1 {
                regs.push(Register::LR);
            }
            let mut sp = emulator.read_register(Register::SP);
            sp = sp.wrapping_sub(4 * regs.len() as u32);
            let base = sp;
            emulator.write_register(Register::SP, sp);
            for (i, r) in regs.iter().enumerate() {
                let value = emulator.read_register(*r);
                if let Err(code) = emulator.write_sized(base.wrapping_add(4 * i as u32), value, 4) {
                    return code;
                }
            }
            ReturnCode::Ok
        }
        Mnemonic::Pop => {
            let regs = low_reg_list(ins.imm);
            let pc_popped = ins.imm2 == 1;
            let sp = emulator.read_register(Register::SP);
            let count = regs.len() + pc_popped as usize;
            for (i, r) in regs.iter().enumerate() {
                match emulator.read_sized(sp.wrapping_add(4 * i as u32), 4) {
                    Ok(value) => emulator.write_register(*r, value),
                    Err(code) => return code,
                }
            }
            if pc_popped {
                match emulator.read_sized(sp.wrapping_add(4 * regs.len() as u32), 4) {
                    Ok(value) => emulator.cpu.registers.set_pc_raw(value & !1),
                    Err(code) => return code,
                }
            }
            emulator.write_register(Register::SP, sp.wrapping_add(4 * count as u32));
            ReturnCode::Ok
        }

        Mnemonic::Stm => {
            let regs = low_reg_list(ins.imm);
            let rn = reg(ins.rn);
            let mut address = emulator.read_register(rn);
            for r in &regs {
                let value = emulator.read_register(*r);
                if let Err(code) = emulator.write_sized(address, value, 4) {
                    return code;
                }
                address = address.wrapping_add(4);
            }
            emulator.write_register(rn, address);
            ReturnCode::Ok
        }
        Mnemonic::Ldm => {
            let regs = low_reg_list(ins.imm);
            let rn = reg(ins.rn);
            let mut address = emulator.read_register(rn);
            let writeback = !regs.contains(&rn);
            for r in &regs {
                match emulator.read_sized(address, 4) {
                    Ok(value) => emulator.write_register(*r, value),
                    Err(code) => return code,
                }
                address = address.wrapping_add(4);
            }
            if writeback {
                emulator.write_register(rn, address);
            }
            ReturnCode::Ok
        }

        Mnemonic::Ldrex | Mnemonic::Ldrexb => {
            let rn = emulator.read_register(reg(ins.rn));
            let address = rn.wrapping_add(ins.imm);
            let size = if ins.mnemonic == Mnemonic::Ldrexb { 1 } else { 4 };
            match emulator.read_sized(address, size) {
                Ok(value) => {
                    emulator.write_register(reg(ins.rd), value);
                    ReturnCode::Ok
                }
                Err(code) => code,
            }
        }
        Mnemonic::Strex | Mnemonic::Strexb => {
            let rn = emulator.read_register(reg(ins.rn));
            let address = rn.wrapping_add(ins.imm);
            let size = if ins.mnemonic == Mnemonic::Strexb { 1 } else { 4 };
            let value = emulator.read_register(reg(ins.ra));
            match emulator.write_sized(address, value, size) {
                Ok(()) => {
                    emulator.write_register(reg(ins.rd), 0); // exclusive store always succeeds here
                    ReturnCode::Ok
                }
                Err(code) => code,
            }
        }

        Mnemonic::Unsupported => ReturnCode::Unsupported,
    }
}

fn logical(emulator: &mut Emulator, ins: &Instruction, op: impl Fn(u32, u32) -> u32) -> ReturnCode {
    let rn = emulator.read_register(reg(ins.rn));
    let rm = emulator.read_register(reg(ins.rm));
    let result = op(rn, rm);
    emulator.write_register(reg(ins.rd), result);
    if ins.flags.s {
        set_nz(emulator, result);
    }
    ReturnCode::Ok
}

fn size_of(mnemonic: Mnemonic) -> u32 {
    match mnemonic {
        Mnemonic::Ldrb | Mnemonic::Strb => 1,
        Mnemonic::Ldrh | Mnemonic::Strh => 2,
        _ => 4,
    }
}

fn load_store_address(emulator: &Emulator, ins: &Instruction) -> Result<u32, ReturnCode> {
    let base = emulator.read_register(reg(ins.rn));
    match ins.rm {
        Some(rm) => Ok(base.wrapping_add(emulator.read_register(rm))),
        None => Ok(base.wrapping_add(ins.imm)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Architecture;
    use crate::emulator::MemoryRegion;

    fn emulator() -> Emulator {
        let flash = MemoryRegion::flash(0x0800_0000, 0x100);
        let ram = MemoryRegion::ram(0x2000_0000, 0x100);
        Emulator::new(Architecture::ARMv7M, flash, ram)
    }

    #[test]
    fn add_imm_sets_carry_and_overflow() {
        let mut e = emulator();
        e.cpu.registers.write(Register::R0, 0xFFFF_FFFF);
        let mut ins = Instruction::blank(0, 2);
        ins.mnemonic = Mnemonic::AddImm;
        ins.rd = Some(Register::R0);
        ins.rn = Some(Register::R0);
        ins.imm = 1;
        ins.flags.s = true;
        execute(&mut e, &ins);
        assert_eq!(e.cpu.registers.read(Register::R0), 0);
        assert!(e.cpu.registers.c);
        assert!(e.cpu.registers.z);
    }

    #[test]
    fn str_then_ldr_round_trips_through_ram() {
        let mut e = emulator();
        e.cpu.registers.write(Register::R0, 0x2000_0010);
        e.cpu.registers.write(Register::R1, 0xdead_beef);
        let mut store = Instruction::blank(0, 2);
        store.mnemonic = Mnemonic::Str;
        store.rd = Some(Register::R1);
        store.rn = Some(Register::R0);
        execute(&mut e, &store);

        let mut load = Instruction::blank(2, 2);
        load.mnemonic = Mnemonic::Ldr;
        load.rd = Some(Register::R2);
        load.rn = Some(Register::R0);
        execute(&mut e, &load);
        assert_eq!(e.cpu.registers.read(Register::R2), 0xdead_beef);
    }

    #[test]
    fn push_then_pop_restores_registers() {
        let mut e = emulator();
        e.cpu.registers.write(Register::SP, 0x2000_0080);
        e.cpu.registers.write(Register::R0, 0x1234);
        let mut push = Instruction::blank(0, 2);
        push.mnemonic = Mnemonic::Push;
        push.imm = 0b0000_0001; // r0
        execute(&mut e, &push);
        assert_eq!(e.cpu.registers.read(Register::SP), 0x2000_007c);

        e.cpu.registers.write(Register::R0, 0);
        let mut pop = Instruction::blank(2, 2);
        pop.mnemonic = Mnemonic::Pop;
        pop.imm = 0b0000_0001;
        execute(&mut e, &pop);
        assert_eq!(e.cpu.registers.read(Register::R0), 0x1234);
        assert_eq!(e.cpu.registers.read(Register::SP), 0x2000_0080);
    }
}
