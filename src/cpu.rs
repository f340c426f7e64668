//! Fetch/decode/execute loop for the 16-bit instruction set, interrupt
//! dispatch, and the `ExecWait` context-switch primitive.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::bus::{Bus, MmioEffect, VfsCommand, VfsStatus};
use crate::vfs::VirtualDisk;

pub const RESET_SP: u16 = 0xFFFE;
pub const INTERRUPT_VECTOR: u16 = 0x0010;

#[derive(Clone, Copy, Debug, Default)]
pub struct Flags {
    pub z: bool,
    pub n: bool,
    pub c: bool,
    pub ie: bool,
}

/// A single CPU step either executed an instruction, dispatched an
/// interrupt, sat idle in WFI, or found the CPU halted.
#[derive(Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Executed,
    InterruptDispatched,
    Waiting,
    Halted,
}

pub struct Cpu {
    pub regs: [u16; 8],
    pub pc: u16,
    pub sp: u16,
    pub flags: Flags,
    pub waiting: bool,
    pub halted: bool,
    pub interrupt_pending: bool,
    pub call_depth: u32,
    pub bus: Bus,
    vfs: Arc<VirtualDisk>,
}

impl Cpu {
    pub fn new(vfs: Arc<VirtualDisk>) -> Self {
        Cpu {
            regs: [0; 8],
            pc: 0,
            sp: RESET_SP,
            flags: Flags::default(),
            waiting: false,
            halted: false,
            interrupt_pending: false,
            call_depth: 0,
            bus: Bus::new(),
            vfs,
        }
    }

    /// Loads `program` at address 0, leaving the rest of the CPU in its
    /// reset state.
    pub fn load(&mut self, program: &[u8]) {
        self.bus.write_block(0, program);
        self.pc = 0;
    }

    pub fn push_key(&mut self, code: u16) {
        self.bus.push_key(code);
    }

    /// The VFS backing this CPU's VFS command port, shared with a
    /// hibernation snapshot/restore and any background persistence
    /// ticker.
    pub fn vfs(&self) -> &Arc<VirtualDisk> {
        &self.vfs
    }

    /// Raises an external interrupt (e.g. a keypress). Delivery happens
    /// on the next `step` if interrupts are enabled.
    pub fn request_interrupt(&mut self) {
        self.interrupt_pending = true;
    }

    fn push_word(&mut self, value: u16) {
        self.sp = self.sp.wrapping_sub(2);
        self.bus.write16(self.sp, value);
    }

    fn pop_word(&mut self) -> u16 {
        let value = self.bus.read16(self.sp);
        self.sp = self.sp.wrapping_add(2);
        value
    }

    /// Executes one step: peripheral polling, then interrupt dispatch or
    /// instruction execution.
    pub fn step(&mut self) -> StepOutcome {
        if self.halted {
            return StepOutcome::Halted;
        }

        let mask_before = self.bus.peripheral_int_mask;
        let slot_count = self.bus.peripherals.len();
        let mut raised: u16 = 0;
        for slot in 0..slot_count {
            let mut bit_raised = false;
            {
                let peripheral = &mut self.bus.peripherals[slot];
                peripheral.step(&mut || bit_raised = true);
            }
            if bit_raised {
                raised |= 1 << slot;
            }
        }
        if raised != 0 {
            self.bus.peripheral_int_mask = mask_before | raised;
            self.interrupt_pending = true;
        }

        if self.interrupt_pending && self.flags.ie {
            self.interrupt_pending = false;
            self.flags.ie = false;
            self.waiting = false;
            self.push_word(self.pc);
            self.pc = INTERRUPT_VECTOR;
            return StepOutcome::InterruptDispatched;
        }

        if self.waiting {
            return StepOutcome::Waiting;
        }

        self.execute_one();
        StepOutcome::Executed
    }

    fn fetch16(&mut self) -> u16 {
        let word = self.bus.read16(self.pc);
        self.pc = self.pc.wrapping_add(2);
        word
    }

    fn execute_one(&mut self) {
        let instr = self.fetch16();
        let opcode = (instr >> 10) & 0x3F;
        let a = ((instr >> 7) & 0x7) as usize;
        let b = ((instr >> 4) & 0x7) as usize;
        let c = ((instr >> 1) & 0x7) as usize;

        match opcode {
            0x00 => self.op_hlt(),
            0x01 => {} // NOP
            0x02 => {
                let imm = self.fetch16();
                self.regs[a] = imm;
            }
            0x03 => self.regs[a] = self.regs[b],
            0x04 => self.regs[a] = self.bus.read16_effectful(self.regs[b]),
            0x05 => {
                let eff = self.bus.write16(self.regs[a], self.regs[b]);
                self.handle_effect(eff);
            }
            0x06 => self.op_add(a, b),
            0x07 => self.op_sub(a, b),
            0x08 => self.op_bitwise(a, b, |x, y| x & y),
            0x09 => self.op_bitwise(a, b, |x, y| x | y),
            0x0A => self.op_bitwise(a, b, |x, y| x ^ y),
            0x0B => {
                let result = !self.regs[a];
                self.regs[a] = result;
                self.flags.z = result == 0;
                self.flags.n = result & 0x8000 != 0;
            }
            0x0C => {
                let result = self.regs[a].wrapping_shl(self.regs[b] as u32 & 0xF);
                self.regs[a] = result;
                self.flags.z = result == 0;
                self.flags.n = result & 0x8000 != 0;
            }
            0x0D => {
                let result = self.regs[a].wrapping_shr(self.regs[b] as u32 & 0xF);
                self.regs[a] = result;
                self.flags.z = result == 0;
                self.flags.n = result & 0x8000 != 0;
            }
            0x0E => {
                let target = self.fetch16();
                self.pc = target;
            }
            0x0F => self.branch_if(self.flags.z),
            0x10 => self.branch_if(!self.flags.z),
            0x11 => self.branch_if(self.flags.n),
            0x12 => {
                self.sp = self.sp.wrapping_sub(2);
                self.bus.write16(self.sp, self.regs[a]);
            }
            0x13 => {
                self.regs[a] = self.bus.read16(self.sp);
                self.sp = self.sp.wrapping_add(2);
            }
            0x14 => {
                let target = self.fetch16();
                self.push_word(self.pc);
                self.pc = target;
            }
            0x15 => {
                let ret = self.pop_word();
                self.pc = ret;
            }
            0x16 => self.flags.ie = true,
            0x17 => self.flags.ie = false,
            0x18 => {
                let ret = self.pop_word();
                self.pc = ret;
                self.flags.ie = true;
            }
            0x19 => self.waiting = true,
            0x1A => self.regs[a] = self.sp,
            0x1B => self.sp = self.regs[a],
            0x1C => {
                let result = (self.regs[a] as u32).wrapping_mul(self.regs[b] as u32);
                self.regs[a] = result as u16;
                self.flags.z = self.regs[a] == 0;
                self.flags.n = self.regs[a] & 0x8000 != 0;
            }
            0x1D => {
                if self.regs[b] == 0 {
                    self.regs[a] = 0;
                    self.flags.z = true;
                } else {
                    self.regs[a] /= self.regs[b];
                    self.flags.z = self.regs[a] == 0;
                    self.flags.n = self.regs[a] & 0x8000 != 0;
                }
            }
            0x1E => self.op_fill(a, b, c),
            0x1F => self.op_copy(a, b, c),
            0x20 => self.regs[a] = self.bus.read_byte_effectful(self.regs[b]) as u16,
            0x21 => {
                let eff = self.bus.write_byte(self.regs[a], self.regs[b] as u8);
                self.handle_effect(eff);
            }
            0x22 => {
                let rb = self.regs[b] as i16;
                if rb == 0 {
                    self.regs[a] = 0;
                    self.flags.z = true;
                } else {
                    let result = (self.regs[a] as i16) / rb;
                    self.regs[a] = result as u16;
                    self.flags.z = result == 0;
                    self.flags.n = result < 0;
                }
            }
            0x23 => self.branch_if(self.flags.c),
            0x24 => self.branch_if(!self.flags.c),
            _ => {
                // Unused opcode encodings are defined as no-ops, and any
                // immediate word they might otherwise have consumed is
                // not fetched.
            }
        }
    }

    fn handle_effect(&mut self, effect: MmioEffect) {
        match effect {
            MmioEffect::None => {
                if let Some(cmd) = self.bus.take_pending_vfs_command() {
                    if cmd != VfsCommand::ExecWait {
                        self.run_vfs_command(cmd);
                    }
                }
            }
            MmioEffect::ExecWait => self.exec_wait(),
        }
    }

    fn run_vfs_command(&mut self, cmd: VfsCommand) {
        let name = self.bus.read_cstring(self.bus.vfs_name_ptr);
        match cmd {
            VfsCommand::Read => match self.vfs.read(&name) {
                Ok(data) => {
                    let len = data.len().min(self.bus.vfs_len as usize) as u16;
                    let ptr = self.bus.vfs_buf_ptr;
                    self.bus.write_block(ptr, &data[..len as usize]);
                    self.bus.vfs_len = len;
                    self.bus.set_vfs_status(VfsStatus::Ok);
                }
                Err(crate::error::VfsError::InvalidName(_)) => {
                    self.bus.set_vfs_status(VfsStatus::InvalidName)
                }
                Err(_) => self.bus.set_vfs_status(VfsStatus::NotFound),
            },
            VfsCommand::Write => {
                let data = self.bus.read_block(self.bus.vfs_buf_ptr, self.bus.vfs_len);
                match self.vfs.write(&name, data, Utc::now()) {
                    Ok(()) => self.bus.set_vfs_status(VfsStatus::Ok),
                    Err(crate::error::VfsError::InvalidName(_)) => {
                        self.bus.set_vfs_status(VfsStatus::InvalidName)
                    }
                    Err(crate::error::VfsError::QuotaExceeded { .. }) => {
                        self.bus.set_vfs_status(VfsStatus::Quota)
                    }
                    Err(_) => self.bus.set_vfs_status(VfsStatus::NotFound),
                }
            }
            VfsCommand::Size => match self.vfs.size(&name) {
                Ok(size) => {
                    self.bus.vfs_len = size as u16;
                    self.bus.set_vfs_status(VfsStatus::Ok);
                }
                Err(crate::error::VfsError::InvalidName(_)) => {
                    self.bus.set_vfs_status(VfsStatus::InvalidName)
                }
                Err(_) => self.bus.set_vfs_status(VfsStatus::NotFound),
            },
            VfsCommand::Delete => match self.vfs.delete(&name) {
                Ok(()) => self.bus.set_vfs_status(VfsStatus::Ok),
                Err(crate::error::VfsError::InvalidName(_)) => {
                    self.bus.set_vfs_status(VfsStatus::InvalidName)
                }
                Err(_) => self.bus.set_vfs_status(VfsStatus::NotFound),
            },
            VfsCommand::ListNext => match self.vfs.list_next() {
                Some(entry) => {
                    let ptr = self.bus.vfs_buf_ptr;
                    let bytes = entry.as_bytes();
                    let len = bytes.len().min(self.bus.vfs_len as usize);
                    self.bus.write_block(ptr, &bytes[..len]);
                    self.bus.write_byte(ptr.wrapping_add(len as u16), 0);
                    self.bus.set_vfs_status(VfsStatus::Ok);
                }
                None => {
                    self.vfs.list_reset();
                    self.bus.set_vfs_status(VfsStatus::DirEnd);
                }
            },
            VfsCommand::FreeSpace => {
                self.bus.vfs_free = self.vfs.free_space() as u16;
                self.bus.set_vfs_status(VfsStatus::Ok);
            }
            VfsCommand::GetMeta => match self.vfs.meta(&name) {
                Ok(_) => self.bus.set_vfs_status(VfsStatus::Ok),
                Err(crate::error::VfsError::InvalidName(_)) => {
                    self.bus.set_vfs_status(VfsStatus::InvalidName)
                }
                Err(_) => self.bus.set_vfs_status(VfsStatus::NotFound),
            },
            VfsCommand::ExecWait => unreachable!("handled by handle_effect"),
        }
    }

    fn exec_wait(&mut self) {
        let name = self.bus.read_cstring(self.bus.vfs_name_ptr);
        let program = match self.vfs.read(&name) {
            Ok(bytes) => bytes,
            Err(_) => {
                self.bus.set_vfs_status(VfsStatus::NotFound);
                return;
            }
        };

        let snapshot = self.snapshot();
        let swap_name = format!(".swap_{}.sys", self.call_depth);
        if let Ok(bytes) = serde_json::to_vec(&snapshot) {
            let _ = self.vfs.write(&swap_name, bytes, Utc::now());
        }

        self.call_depth += 1;
        self.bus = Bus::new();
        self.regs = [0; 8];
        self.sp = RESET_SP;
        self.flags = Flags::default();
        self.waiting = false;
        self.halted = false;
        self.interrupt_pending = false;
        self.load(&program);
    }

    fn op_hlt(&mut self) {
        if self.call_depth > 0 {
            self.call_depth -= 1;
            let swap_name = format!(".swap_{}.sys", self.call_depth);
            if let Ok(bytes) = self.vfs.read(&swap_name) {
                if let Ok(snapshot) = serde_json::from_slice::<CpuSnapshot>(&bytes) {
                    self.restore(snapshot);
                }
                let _ = self.vfs.delete(&swap_name);
            }
            self.halted = false;
        } else {
            self.halted = true;
        }
    }

    fn branch_if(&mut self, cond: bool) {
        let target = self.fetch16();
        if cond {
            self.pc = target;
        }
    }

    fn op_add(&mut self, a: usize, b: usize) {
        let sum = self.regs[a] as u32 + self.regs[b] as u32;
        self.regs[a] = sum as u16;
        self.flags.z = self.regs[a] == 0;
        self.flags.n = self.regs[a] & 0x8000 != 0;
        self.flags.c = sum > 0xFFFF;
    }

    fn op_sub(&mut self, a: usize, b: usize) {
        self.flags.c = self.regs[a] < self.regs[b];
        let diff = self.regs[a].wrapping_sub(self.regs[b]);
        self.regs[a] = diff;
        self.flags.z = diff == 0;
        self.flags.n = diff & 0x8000 != 0;
    }

    fn op_bitwise(&mut self, a: usize, b: usize, f: impl Fn(u16, u16) -> u16) {
        let result = f(self.regs[a], self.regs[b]);
        self.regs[a] = result;
        self.flags.z = result == 0;
        self.flags.n = result & 0x8000 != 0;
    }

    fn op_fill(&mut self, a: usize, b: usize, c: usize) {
        let start = self.regs[a];
        let count = self.regs[b];
        let value = self.regs[c];
        for i in 0..count {
            self.bus.write16(start.wrapping_add(i.wrapping_mul(2)), value);
        }
    }

    fn op_copy(&mut self, a: usize, b: usize, c: usize) {
        let src = self.regs[a];
        let dst = self.regs[b];
        let count = self.regs[c] as u32;
        let overlap_forward = src < dst && (dst as u32) < (src as u32 + count * 2);
        if overlap_forward {
            for i in (0..count).rev() {
                let off = (i * 2) as u16;
                let word = self.bus.read16(src.wrapping_add(off));
                self.bus.write16(dst.wrapping_add(off), word);
            }
        } else {
            for i in 0..count {
                let off = (i * 2) as u16;
                let word = self.bus.read16(src.wrapping_add(off));
                self.bus.write16(dst.wrapping_add(off), word);
            }
        }
    }

    pub fn snapshot(&self) -> CpuSnapshot {
        CpuSnapshot {
            regs: self.regs,
            pc: self.pc,
            sp: self.sp,
            flags: (self.flags.z, self.flags.n, self.flags.c, self.flags.ie),
            waiting: self.waiting,
            halted: self.halted,
            interrupt_pending: self.interrupt_pending,
            call_depth: self.call_depth,
            ram: self.bus.raw_ram().to_vec(),
            graphics_banks: self.bus.graphics_banks.clone(),
            graphics_banks_front: self.bus.graphics_banks_front.clone(),
            text_vram: self.bus.text_vram.clone(),
            text_vram_front: self.bus.text_vram_front.clone(),
            palette: self.bus.palette.to_vec(),
            palette_index: self.bus.palette_index,
            current_bank: self.bus.current_bank,
            mode_bits: self.bus.mode.pack(),
            peripheral_int_mask: self.bus.peripheral_int_mask,
            text_resolution_mode: self.bus.text_resolution_mode,
            mdu_a: self.bus.mdu_a,
            mdu_res: self.bus.mdu_res,
            mdu_op: self.bus.mdu_op,
            mdu_remainder: self.bus.mdu_remainder,
        }
    }

    pub fn restore(&mut self, snapshot: CpuSnapshot) {
        self.regs = snapshot.regs;
        self.pc = snapshot.pc;
        self.sp = snapshot.sp;
        self.flags = Flags {
            z: snapshot.flags.0,
            n: snapshot.flags.1,
            c: snapshot.flags.2,
            ie: snapshot.flags.3,
        };
        self.waiting = snapshot.waiting;
        self.halted = snapshot.halted;
        self.interrupt_pending = snapshot.interrupt_pending;
        self.call_depth = snapshot.call_depth;
        self.bus.raw_ram_restore(&snapshot.ram);
        self.bus.graphics_banks = snapshot.graphics_banks;
        self.bus.graphics_banks_front = snapshot.graphics_banks_front;
        self.bus.text_vram = snapshot.text_vram;
        self.bus.text_vram_front = snapshot.text_vram_front;
        let mut palette = [0u16; 256];
        palette.copy_from_slice(&snapshot.palette);
        self.bus.palette = palette;
        self.bus.palette_index = snapshot.palette_index;
        self.bus.current_bank = snapshot.current_bank;
        self.bus.mode = crate::bus::ModeBits::unpack(snapshot.mode_bits);
        self.bus.peripheral_int_mask = snapshot.peripheral_int_mask;
        self.bus.text_resolution_mode = snapshot.text_resolution_mode;
        self.bus.mdu_a = snapshot.mdu_a;
        self.bus.mdu_res = snapshot.mdu_res;
        self.bus.mdu_op = snapshot.mdu_op;
        self.bus.mdu_remainder = snapshot.mdu_remainder;
    }
}

/// The full architectural state serialized by `ExecWait` swap files and
/// reused as the memory/register portion of a hibernation snapshot.
#[derive(Serialize, Deserialize)]
pub struct CpuSnapshot {
    pub regs: [u16; 8],
    pub pc: u16,
    pub sp: u16,
    pub flags: (bool, bool, bool, bool),
    pub waiting: bool,
    pub halted: bool,
    pub interrupt_pending: bool,
    pub call_depth: u32,
    pub ram: Vec<u8>,
    pub graphics_banks: [Vec<u8>; 4],
    pub graphics_banks_front: [Vec<u8>; 4],
    pub text_vram: Vec<u8>,
    pub text_vram_front: Vec<u8>,
    pub palette: Vec<u16>,
    pub palette_index: u8,
    pub current_bank: u8,
    pub mode_bits: u16,
    pub peripheral_int_mask: u16,
    pub text_resolution_mode: bool,
    pub mdu_a: i16,
    pub mdu_res: u16,
    pub mdu_op: crate::bus::MduOp,
    pub mdu_remainder: u16,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::assemble;

    fn new_cpu() -> Cpu {
        Cpu::new(Arc::new(VirtualDisk::new()))
    }

    #[test]
    fn add_sets_carry_on_unsigned_overflow() {
        let mut cpu = new_cpu();
        cpu.regs[0] = 0xFFFF;
        cpu.regs[1] = 2;
        cpu.op_add(0, 1);
        assert_eq!(cpu.regs[0], 1);
        assert!(cpu.flags.c);
    }

    #[test]
    fn sub_sets_carry_as_borrow() {
        let mut cpu = new_cpu();
        cpu.regs[0] = 3;
        cpu.regs[1] = 5;
        cpu.op_sub(0, 1);
        assert!(cpu.flags.c);
    }

    #[test]
    fn copy_overlap_forward_shifts_correctly() {
        let mut cpu = new_cpu();
        cpu.bus.write16(0x1000, 1);
        cpu.bus.write16(0x1002, 2);
        cpu.bus.write16(0x1004, 3);
        cpu.bus.write16(0x1006, 4);
        cpu.regs[0] = 0x1000;
        cpu.regs[1] = 0x1002;
        cpu.regs[2] = 3;
        cpu.op_copy(0, 1, 2);
        assert_eq!(cpu.bus.read16(0x1000), 1);
        assert_eq!(cpu.bus.read16(0x1002), 1);
        assert_eq!(cpu.bus.read16(0x1004), 2);
        assert_eq!(cpu.bus.read16(0x1006), 3);
    }

    #[test]
    fn interrupt_dispatch_pushes_pc_and_jumps_to_vector() {
        let asm = "EI\nWFI\nHLT\n";
        let program = assemble(asm).unwrap().code;
        let mut cpu = new_cpu();
        cpu.load(&program);
        cpu.step(); // EI
        cpu.step(); // WFI -> waiting
        cpu.push_key(65);
        cpu.request_interrupt();
        let outcome = cpu.step();
        assert_eq!(outcome, StepOutcome::InterruptDispatched);
        assert_eq!(cpu.pc, INTERRUPT_VECTOR);
        assert!(!cpu.flags.ie);
    }

    #[test]
    fn unused_opcode_is_a_no_op() {
        let mut cpu = new_cpu();
        // opcode 0x3F is outside the defined table.
        let instr: u16 = 0x3F << 10;
        cpu.bus.write16(0, instr);
        cpu.pc = 0;
        let regs_before = cpu.regs;
        cpu.step();
        assert_eq!(cpu.regs, regs_before);
        assert_eq!(cpu.pc, 2);
    }
}
