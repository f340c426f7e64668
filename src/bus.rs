//! The 64 KiB address space and its memory-mapped regions: flat RAM,
//! the graphics bank window, text VRAM, the expansion (peripheral) bus,
//! and the special register block.

use serde::{Deserialize, Serialize};

use crate::peripheral::{MessageBus, NullPeripheral, Peripheral, SLOT_COUNT};

/// The address `dispatch_message` replies are routed back to.
pub const SYSTEM_ADDRESS: &str = "system@local";

pub const GRAPHICS_BANK_BASE: u16 = 0x8000;
pub const GRAPHICS_BANK_END: u16 = 0xBFFF;
pub const GRAPHICS_BANK_SIZE: usize = 0x4000;
pub const TEXT_VRAM_BASE: u16 = 0xF000;
pub const TEXT_VRAM_END: u16 = 0xF7FF;
pub const TEXT_VRAM_SIZE: usize = 0x800;
pub const EXPANSION_BASE: u16 = 0xFC00;
pub const EXPANSION_END: u16 = 0xFCFF;
pub const REG_BASE: u16 = 0xFF00;
pub const REG_END: u16 = 0xFF2F;

// Special register offsets from REG_BASE.
pub const REG_PRINT_CHAR: u16 = 0xFF00;
pub const REG_PRINT_DEC: u16 = 0xFF01;
pub const REG_GFX_BANK: u16 = 0xFF02;
pub const REG_TEXT_RES: u16 = 0xFF03;
pub const REG_KEYBOARD: u16 = 0xFF04;
pub const REG_MODE_BITS: u16 = 0xFF05;
pub const REG_FLIP: u16 = 0xFF06;
pub const REG_PALETTE_IDX: u16 = 0xFF07;
pub const REG_PALETTE_DATA: u16 = 0xFF08;
pub const REG_PERIPH_INT_MASK: u16 = 0xFF09;
pub const REG_VFS_CMD: u16 = 0xFF10;
pub const REG_VFS_NAME_PTR: u16 = 0xFF11;
pub const REG_VFS_BUF_PTR: u16 = 0xFF12;
pub const REG_VFS_LEN: u16 = 0xFF13;
pub const REG_VFS_STATUS: u16 = 0xFF14;
pub const REG_VFS_FREE: u16 = 0xFF15;
pub const REG_MDU_A: u16 = 0xFF20;
pub const REG_MDU_B: u16 = 0xFF21;
pub const REG_MDU_RES: u16 = 0xFF22;
pub const REG_MDU_OP: u16 = 0xFF23;
pub const REG_MDU_REM: u16 = 0xFF24;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum VfsStatus {
    Ok = 0,
    NotFound = 1,
    Quota = 2,
    InvalidName = 3,
    OutOfBounds = 4,
    DirEnd = 5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VfsCommand {
    Read = 1,
    Write = 2,
    Size = 3,
    Delete = 4,
    ListNext = 5,
    FreeSpace = 6,
    GetMeta = 7,
    ExecWait = 8,
}

impl VfsCommand {
    fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            1 => VfsCommand::Read,
            2 => VfsCommand::Write,
            3 => VfsCommand::Size,
            4 => VfsCommand::Delete,
            5 => VfsCommand::ListNext,
            6 => VfsCommand::FreeSpace,
            7 => VfsCommand::GetMeta,
            8 => VfsCommand::ExecWait,
            _ => return None,
        })
    }
}

#[derive(Default, Clone, Copy)]
pub struct ModeBits {
    pub text_overlay: bool,
    pub graphics_enabled: bool,
    pub buffered: bool,
    pub color_mode_8bpp: bool,
}

impl ModeBits {
    pub fn pack(&self) -> u16 {
        (self.text_overlay as u16)
            | ((self.graphics_enabled as u16) << 1)
            | ((self.buffered as u16) << 2)
            | ((self.color_mode_8bpp as u16) << 3)
    }

    pub fn unpack(v: u16) -> Self {
        ModeBits {
            text_overlay: v & 1 != 0,
            graphics_enabled: v & 2 != 0,
            buffered: v & 4 != 0,
            color_mode_8bpp: v & 8 != 0,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MduOp {
    MulQ8_8,
    DivQ8_8,
}

/// A pending action that the bus cannot itself carry out because it
/// needs the whole CPU (register/flag state) rather than just memory.
/// `Cpu::step` observes this after any MMIO write and acts on it.
pub enum MmioEffect {
    None,
    ExecWait,
}

pub struct Bus {
    ram: Vec<u8>,
    pub graphics_banks: [Vec<u8>; 4],
    pub graphics_banks_front: [Vec<u8>; 4],
    pub text_vram: Vec<u8>,
    pub text_vram_front: Vec<u8>,
    pub current_bank: u8,
    pub text_resolution_mode: bool,
    pub mode: ModeBits,
    pub palette: [u16; 256],
    pub palette_index: u8,
    keyboard_fifo: std::collections::VecDeque<u16>,
    pub peripheral_int_mask: u16,
    pub peripherals: Vec<Box<dyn Peripheral>>,
    pub vfs_name_ptr: u16,
    pub vfs_buf_ptr: u16,
    pub vfs_len: u16,
    pub vfs_status: u16,
    pub vfs_free: u16,
    pub mdu_a: i16,
    pub mdu_res: u16,
    pub mdu_op: MduOp,
    pub mdu_remainder: u16,
    pub console: Vec<u8>,
    pending_vfs_command: Option<VfsCommand>,
    pub message_bus: MessageBus,
}

fn empty_graphics_banks() -> [Vec<u8>; 4] {
    [
        vec![0u8; GRAPHICS_BANK_SIZE],
        vec![0u8; GRAPHICS_BANK_SIZE],
        vec![0u8; GRAPHICS_BANK_SIZE],
        vec![0u8; GRAPHICS_BANK_SIZE],
    ]
}

impl Bus {
    pub fn new() -> Self {
        let mut peripherals: Vec<Box<dyn Peripheral>> = Vec::with_capacity(SLOT_COUNT);
        for _ in 0..SLOT_COUNT {
            peripherals.push(Box::new(NullPeripheral));
        }
        Bus {
            ram: vec![0u8; 0x10000],
            graphics_banks: empty_graphics_banks(),
            graphics_banks_front: empty_graphics_banks(),
            text_vram: vec![0u8; TEXT_VRAM_SIZE],
            text_vram_front: vec![0u8; TEXT_VRAM_SIZE],
            current_bank: 0,
            text_resolution_mode: false,
            mode: ModeBits {
                text_overlay: true,
                ..Default::default()
            },
            palette: [0u16; 256],
            palette_index: 0,
            keyboard_fifo: std::collections::VecDeque::new(),
            peripheral_int_mask: 0,
            peripherals,
            vfs_name_ptr: 0,
            vfs_buf_ptr: 0,
            vfs_len: 0,
            vfs_status: 0,
            vfs_free: 0,
            mdu_a: 0,
            mdu_res: 0,
            mdu_op: MduOp::MulQ8_8,
            mdu_remainder: 0,
            console: Vec::new(),
            pending_vfs_command: None,
            message_bus: MessageBus::new(),
        }
    }

    /// Invokes the addressed device's `handle_message` on the calling
    /// thread. An unknown target is forwarded to the out-of-process sink
    /// rather than treated as an error.
    pub fn dispatch_message(&mut self, target: &str, body: Vec<u8>) {
        self.message_bus.dispatch(SYSTEM_ADDRESS, target, body);
    }

    pub fn push_key(&mut self, code: u16) {
        self.keyboard_fifo.push_back(code);
    }

    pub fn read_byte(&self, addr: u16) -> u8 {
        match addr {
            GRAPHICS_BANK_BASE..=GRAPHICS_BANK_END => {
                let bank = &self.graphics_banks[self.current_bank as usize];
                bank[(addr - GRAPHICS_BANK_BASE) as usize]
            }
            TEXT_VRAM_BASE..=TEXT_VRAM_END => self.text_vram[(addr - TEXT_VRAM_BASE) as usize],
            EXPANSION_BASE..=EXPANSION_END => {
                let rel = addr - EXPANSION_BASE;
                let slot = (rel / 16) as usize;
                let offset = (rel % 16) as u8;
                let word_offset = offset / 2;
                let word = self.peripherals[slot].read16(word_offset);
                if offset % 2 == 0 {
                    (word & 0xFF) as u8
                } else {
                    (word >> 8) as u8
                }
            }
            REG_BASE..=REG_END => (self.read_register_word(addr) & 0xFF) as u8,
            _ => self.ram[addr as usize],
        }
    }

    pub fn write_byte(&mut self, addr: u16, value: u8) -> MmioEffect {
        match addr {
            GRAPHICS_BANK_BASE..=GRAPHICS_BANK_END => {
                let bank = &mut self.graphics_banks[self.current_bank as usize];
                bank[(addr - GRAPHICS_BANK_BASE) as usize] = value;
                MmioEffect::None
            }
            TEXT_VRAM_BASE..=TEXT_VRAM_END => {
                self.text_vram[(addr - TEXT_VRAM_BASE) as usize] = value;
                MmioEffect::None
            }
            EXPANSION_BASE..=EXPANSION_END => {
                let rel = addr - EXPANSION_BASE;
                let slot = (rel / 16) as usize;
                let offset = (rel % 16) as u8;
                let word_offset = offset / 2;
                let mut word = self.peripherals[slot].read16(word_offset);
                if offset % 2 == 0 {
                    word = (word & 0xFF00) | value as u16;
                } else {
                    word = (word & 0x00FF) | ((value as u16) << 8);
                }
                self.peripherals[slot].write16(word_offset, word);
                MmioEffect::None
            }
            REG_BASE..=REG_END => {
                let existing = self.read_register_word(addr);
                let merged = (existing & 0xFF00) | value as u16;
                self.write_register_word(addr, merged)
            }
            _ => {
                self.ram[addr as usize] = value;
                MmioEffect::None
            }
        }
    }

    /// Every special register lives at its own address and holds a full
    /// 16-bit value (the map lists `0xFF00`, `0xFF01`, `0xFF02`, … as
    /// distinct registers, not byte halves of a shared word), so a
    /// 16-bit access here must dispatch directly to that one address
    /// rather than split into the generic low/high byte pair the flat
    /// RAM and VRAM windows use.
    pub fn read16(&self, addr: u16) -> u16 {
        if (REG_BASE..=REG_END).contains(&addr) {
            return self.read_register_word(addr);
        }
        let lo = self.read_byte(addr) as u16;
        let hi = self.read_byte(addr.wrapping_add(1)) as u16;
        lo | (hi << 8)
    }

    pub fn write16(&mut self, addr: u16, value: u16) -> MmioEffect {
        if (REG_BASE..=REG_END).contains(&addr) {
            return self.write_register_word(addr, value);
        }
        let eff_lo = self.write_byte(addr, (value & 0xFF) as u8);
        let eff_hi = self.write_byte(addr.wrapping_add(1), (value >> 8) as u8);
        match eff_lo {
            MmioEffect::ExecWait => eff_lo,
            MmioEffect::None => eff_hi,
        }
    }

    fn read_register_word(&self, addr: u16) -> u16 {
        match addr {
            REG_GFX_BANK => self.current_bank as u16,
            REG_TEXT_RES => self.text_resolution_mode as u16,
            REG_KEYBOARD => 0, // side-effecting pop handled in read_word_effectful
            REG_MODE_BITS => self.mode.pack(),
            REG_PALETTE_IDX => self.palette_index as u16,
            REG_PALETTE_DATA => self.palette[self.palette_index as usize],
            REG_PERIPH_INT_MASK => self.peripheral_int_mask,
            REG_VFS_NAME_PTR => self.vfs_name_ptr,
            REG_VFS_BUF_PTR => self.vfs_buf_ptr,
            REG_VFS_LEN => self.vfs_len,
            REG_VFS_STATUS => self.vfs_status,
            REG_VFS_FREE => self.vfs_free,
            REG_MDU_A => self.mdu_a as u16,
            REG_MDU_RES => self.mdu_res,
            REG_MDU_OP => match self.mdu_op {
                MduOp::MulQ8_8 => 0,
                MduOp::DivQ8_8 => 1,
            },
            REG_MDU_REM => self.mdu_remainder,
            _ => 0,
        }
    }

    /// Like `read16` but permits the keyboard register's pop-on-read
    /// side effect; the plain `read_byte`/`read16` path is kept
    /// side-effect-free so debug inspection never mutates state.
    pub fn read16_effectful(&mut self, addr: u16) -> u16 {
        if addr == REG_KEYBOARD {
            return self.keyboard_fifo.pop_front().unwrap_or(0);
        }
        self.read16(addr)
    }

    /// Byte-sized counterpart of `read16_effectful`, used by `LDB`.
    pub fn read_byte_effectful(&mut self, addr: u16) -> u8 {
        if addr == REG_KEYBOARD {
            return (self.keyboard_fifo.pop_front().unwrap_or(0) & 0xFF) as u8;
        }
        self.read_byte(addr)
    }

    fn write_register_word(&mut self, addr: u16, value: u16) -> MmioEffect {
        match addr {
            REG_PRINT_CHAR => {
                self.console.push((value & 0xFF) as u8);
                MmioEffect::None
            }
            REG_PRINT_DEC => {
                self.console.extend_from_slice(value.to_string().as_bytes());
                MmioEffect::None
            }
            REG_GFX_BANK => {
                self.current_bank = (value & 0x03) as u8;
                MmioEffect::None
            }
            REG_TEXT_RES => {
                self.text_resolution_mode = value & 1 != 0;
                MmioEffect::None
            }
            REG_MODE_BITS => {
                self.mode = ModeBits::unpack(value);
                MmioEffect::None
            }
            REG_FLIP => {
                let bank = self.current_bank as usize;
                self.graphics_banks_front[bank] = self.graphics_banks[bank].clone();
                self.text_vram_front = self.text_vram.clone();
                MmioEffect::None
            }
            REG_PALETTE_IDX => {
                self.palette_index = (value & 0xFF) as u8;
                MmioEffect::None
            }
            REG_PALETTE_DATA => {
                self.palette[self.palette_index as usize] = value;
                MmioEffect::None
            }
            REG_PERIPH_INT_MASK => {
                self.peripheral_int_mask &= !value;
                MmioEffect::None
            }
            REG_VFS_CMD => {
                self.pending_vfs_command = VfsCommand::from_u16(value);
                if matches!(self.pending_vfs_command, Some(VfsCommand::ExecWait)) {
                    MmioEffect::ExecWait
                } else {
                    MmioEffect::None
                }
            }
            REG_VFS_NAME_PTR => {
                self.vfs_name_ptr = value;
                MmioEffect::None
            }
            REG_VFS_BUF_PTR => {
                self.vfs_buf_ptr = value;
                MmioEffect::None
            }
            REG_VFS_LEN => {
                self.vfs_len = value;
                MmioEffect::None
            }
            REG_VFS_STATUS => {
                self.vfs_status = value;
                MmioEffect::None
            }
            REG_VFS_FREE => {
                self.vfs_free = value;
                MmioEffect::None
            }
            REG_MDU_A => {
                self.mdu_a = value as i16;
                MmioEffect::None
            }
            REG_MDU_B => {
                self.trigger_mdu(value as i16);
                MmioEffect::None
            }
            REG_MDU_OP => {
                self.mdu_op = if value & 1 == 0 {
                    MduOp::MulQ8_8
                } else {
                    MduOp::DivQ8_8
                };
                MmioEffect::None
            }
            _ => MmioEffect::None,
        }
    }

    fn trigger_mdu(&mut self, b: i16) {
        match self.mdu_op {
            MduOp::MulQ8_8 => {
                let prod = (self.mdu_a as i32) * (b as i32);
                self.mdu_res = (prod >> 8) as u16;
            }
            MduOp::DivQ8_8 => {
                if b == 0 {
                    self.mdu_res = 0xFFFF;
                    self.mdu_remainder = 0;
                } else {
                    let a = (self.mdu_a as i32) << 8;
                    let bb = b as i32;
                    self.mdu_res = (a / bb) as u16;
                    self.mdu_remainder = (a % bb) as u16;
                }
            }
        }
    }

    /// Reads a resolved name string out of RAM starting at `ptr`, null
    /// terminated, at most 16 characters.
    pub fn read_cstring(&self, ptr: u16) -> String {
        let mut bytes = Vec::new();
        let mut addr = ptr;
        for _ in 0..16 {
            let b = self.read_byte(addr);
            if b == 0 {
                break;
            }
            bytes.push(b);
            addr = addr.wrapping_add(1);
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn read_block(&self, ptr: u16, len: u16) -> Vec<u8> {
        (0..len).map(|i| self.read_byte(ptr.wrapping_add(i))).collect()
    }

    pub fn write_block(&mut self, ptr: u16, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.write_byte(ptr.wrapping_add(i as u16), *b);
        }
    }

    /// The raw backing store for addresses outside the special windows,
    /// used for hibernation snapshot/restore. Bypassing `read_byte`/
    /// `write_byte` here matters: those route special-register addresses
    /// through side-effecting handlers (e.g. the VFS command port), which
    /// a snapshot replay must never re-trigger.
    pub fn raw_ram(&self) -> &[u8] {
        &self.ram
    }

    pub fn raw_ram_restore(&mut self, data: &[u8]) {
        self.ram.copy_from_slice(data);
    }

    pub fn take_pending_vfs_command(&mut self) -> Option<VfsCommand> {
        self.pending_vfs_command.take()
    }

    pub fn set_vfs_status(&mut self, status: VfsStatus) {
        self.vfs_status = status as u16;
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_ram_round_trips() {
        let mut bus = Bus::new();
        bus.write16(0x1000, 0xBEEF);
        assert_eq!(bus.read16(0x1000), 0xBEEF);
    }

    #[test]
    fn graphics_bank_window_is_banked() {
        let mut bus = Bus::new();
        bus.write_byte(GRAPHICS_BANK_BASE, 0x42);
        bus.current_bank = 1;
        assert_eq!(bus.read_byte(GRAPHICS_BANK_BASE), 0);
        bus.current_bank = 0;
        assert_eq!(bus.read_byte(GRAPHICS_BANK_BASE), 0x42);
    }

    #[test]
    fn keyboard_fifo_pops_in_order() {
        let mut bus = Bus::new();
        bus.push_key(65);
        bus.push_key(66);
        assert_eq!(bus.read16_effectful(REG_KEYBOARD), 65);
        assert_eq!(bus.read16_effectful(REG_KEYBOARD), 66);
        assert_eq!(bus.read16_effectful(REG_KEYBOARD), 0);
    }

    #[test]
    fn peripheral_int_mask_write_acknowledges() {
        let mut bus = Bus::new();
        bus.peripheral_int_mask = 0b101;
        bus.write16(REG_PERIPH_INT_MASK, 0b001);
        assert_eq!(bus.peripheral_int_mask, 0b100);
    }

    #[test]
    fn mdu_unsigned_division_by_zero_yields_sentinel() {
        let mut bus = Bus::new();
        bus.mdu_op = MduOp::DivQ8_8;
        bus.mdu_a = 10;
        bus.write16(REG_MDU_B, 0);
        assert_eq!(bus.mdu_res, 0xFFFF);
    }

    #[test]
    fn expansion_bus_byte_write_preserves_other_byte() {
        let mut bus = Bus::new();
        bus.write16(EXPANSION_BASE, 0xABCD);
        bus.write_byte(EXPANSION_BASE, 0x11);
        assert_eq!(bus.read16(EXPANSION_BASE), 0xAB11);
    }
}
