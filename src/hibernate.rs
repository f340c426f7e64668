//! Hibernation: serializes a running `Cpu` (registers, flags, memory,
//! graphics state, mounted peripherals, mounted message devices, and the
//! VFS) into a ZIP container, and the inverse restore.
//!
//! Peripherals and message devices are rehydrated by type name through
//! the registries in [`crate::peripheral`]; a type name with no
//! registered factory is silently skipped, as the original slot/address
//! just stays unmounted.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zip::write::FileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::bus::ModeBits;
use crate::cpu::Cpu;
use crate::error::HibernationError;
use crate::peripheral::{self, Peripheral};

#[derive(Serialize, Deserialize)]
struct CpuStateJson {
    regs: [u16; 8],
    pc: u16,
    sp: u16,
    flags: (bool, bool, bool, bool),
    waiting: bool,
    halted: bool,
    interrupt_pending: bool,
    call_depth: u32,
    current_bank: u8,
    text_resolution_mode: bool,
    mode_bits: u16,
    palette_index: u8,
    peripheral_int_mask: u16,
    mdu_a: i16,
    mdu_res: u16,
    mdu_op: crate::bus::MduOp,
    mdu_remainder: u16,
    /// Slot index (as a string key, for JSON object compatibility) to
    /// the peripheral's `type_name()`. Slots holding the null
    /// peripheral are omitted.
    peripherals: HashMap<String, String>,
    /// Message-device address to its `type_name()`.
    message_devices: HashMap<String, String>,
}

#[derive(Serialize, Deserialize)]
struct VfsFileMeta {
    name: String,
    created: DateTime<Utc>,
    modified: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct VfsMetadata {
    files: Vec<VfsFileMeta>,
}

fn options() -> FileOptions {
    FileOptions::default().compression_method(zip::CompressionMethod::Deflated)
}

/// Writes a hibernation container for `cpu` to `path`.
pub fn save(cpu: &Cpu, path: &Path) -> Result<(), HibernationError> {
    let file = std::fs::File::create(path)?;
    let mut zip = ZipWriter::new(file);

    let mut peripherals = HashMap::new();
    for (slot, peripheral) in cpu.bus.peripherals.iter().enumerate() {
        let name = peripheral.type_name();
        if name != "null" {
            peripherals.insert(slot.to_string(), name.to_string());
        }
    }
    let mut message_devices = HashMap::new();
    for address in cpu.bus.message_bus.addresses() {
        if let Some(name) = cpu.bus.message_bus.type_name_of(&address) {
            message_devices.insert(address, name.to_string());
        }
    }

    let state = CpuStateJson {
        regs: cpu.regs,
        pc: cpu.pc,
        sp: cpu.sp,
        flags: (cpu.flags.z, cpu.flags.n, cpu.flags.c, cpu.flags.ie),
        waiting: cpu.waiting,
        halted: cpu.halted,
        interrupt_pending: cpu.interrupt_pending,
        call_depth: cpu.call_depth,
        current_bank: cpu.bus.current_bank,
        text_resolution_mode: cpu.bus.text_resolution_mode,
        mode_bits: cpu.bus.mode.pack(),
        palette_index: cpu.bus.palette_index,
        peripheral_int_mask: cpu.bus.peripheral_int_mask,
        mdu_a: cpu.bus.mdu_a,
        mdu_res: cpu.bus.mdu_res,
        mdu_op: cpu.bus.mdu_op,
        mdu_remainder: cpu.bus.mdu_remainder,
        peripherals,
        message_devices,
    };

    zip.start_file("cpu_state.json", options())?;
    zip.write_all(&serde_json::to_vec_pretty(&state)?)?;

    zip.start_file("memory.bin", options())?;
    zip.write_all(cpu.bus.raw_ram())?;

    for (i, bank) in cpu.bus.graphics_banks.iter().enumerate() {
        zip.start_file(format!("graphics_bank_{i}.bin"), options())?;
        zip.write_all(bank)?;
    }
    for (i, bank) in cpu.bus.graphics_banks_front.iter().enumerate() {
        zip.start_file(format!("graphics_bank_front_{i}.bin"), options())?;
        zip.write_all(bank)?;
    }

    zip.start_file("text_vram.bin", options())?;
    zip.write_all(&cpu.bus.text_vram)?;
    zip.start_file("text_vram_front.bin", options())?;
    zip.write_all(&cpu.bus.text_vram_front)?;

    let mut palette_bytes = Vec::with_capacity(512);
    for entry in cpu.bus.palette.iter() {
        palette_bytes.push((entry & 0xFF) as u8);
        palette_bytes.push((entry >> 8) as u8);
    }
    zip.start_file("palette.bin", options())?;
    zip.write_all(&palette_bytes)?;

    for (slot, peripheral) in cpu.bus.peripherals.iter().enumerate() {
        if let Some(data) = peripheral.save_state() {
            zip.start_file(format!("peripheral_{slot}.bin"), options())?;
            zip.write_all(&data)?;
        }
    }
    for address in cpu.bus.message_bus.addresses() {
        if let Some(data) = cpu.bus.message_bus.save_state_of(&address) {
            zip.start_file(format!("message_device_{}.bin", sanitize(&address)), options())?;
            zip.write_all(&data)?;
        }
    }

    let vfs = cpu.vfs();
    let names = vfs.list();
    let mut files = Vec::with_capacity(names.len());
    for name in &names {
        let (created, modified) = vfs
            .meta(name)
            .map_err(|e| HibernationError::Malformed(e.to_string()))?;
        files.push(VfsFileMeta {
            name: name.clone(),
            created,
            modified,
        });
        let data = vfs
            .read(name)
            .map_err(|e| HibernationError::Malformed(e.to_string()))?;
        zip.start_file(format!("vfs/{name}"), options())?;
        zip.write_all(&data)?;
    }
    zip.start_file("vfs_metadata.json", options())?;
    zip.write_all(&serde_json::to_vec_pretty(&VfsMetadata { files })?)?;

    zip.finish()?;
    tracing::info!(path = %path.display(), files = names.len(), "wrote hibernation snapshot");
    Ok(())
}

/// Restores `cpu` from the hibernation container at `path`, replacing
/// its entire architectural state and VFS contents.
pub fn restore(cpu: &mut Cpu, path: &Path) -> Result<(), HibernationError> {
    let file = std::fs::File::open(path)?;
    let mut zip = ZipArchive::new(file)?;

    let state: CpuStateJson = read_json(&mut zip, "cpu_state.json")?;
    cpu.regs = state.regs;
    cpu.pc = state.pc;
    cpu.sp = state.sp;
    cpu.flags = crate::cpu::Flags {
        z: state.flags.0,
        n: state.flags.1,
        c: state.flags.2,
        ie: state.flags.3,
    };
    cpu.waiting = state.waiting;
    cpu.halted = state.halted;
    cpu.interrupt_pending = state.interrupt_pending;
    cpu.call_depth = state.call_depth;
    cpu.bus.current_bank = state.current_bank;
    cpu.bus.text_resolution_mode = state.text_resolution_mode;
    cpu.bus.mode = ModeBits::unpack(state.mode_bits);
    cpu.bus.palette_index = state.palette_index;
    cpu.bus.peripheral_int_mask = state.peripheral_int_mask;
    cpu.bus.mdu_a = state.mdu_a;
    cpu.bus.mdu_res = state.mdu_res;
    cpu.bus.mdu_op = state.mdu_op;
    cpu.bus.mdu_remainder = state.mdu_remainder;

    let memory = read_bytes(&mut zip, "memory.bin")?;
    cpu.bus.raw_ram_restore(&memory);

    for i in 0..4 {
        cpu.bus.graphics_banks[i] = read_bytes(&mut zip, &format!("graphics_bank_{i}.bin"))?;
        cpu.bus.graphics_banks_front[i] = read_bytes(&mut zip, &format!("graphics_bank_front_{i}.bin"))?;
    }
    cpu.bus.text_vram = read_bytes(&mut zip, "text_vram.bin")?;
    cpu.bus.text_vram_front = read_bytes(&mut zip, "text_vram_front.bin")?;

    let palette_bytes = read_bytes(&mut zip, "palette.bin")?;
    let mut palette = [0u16; 256];
    for (i, pair) in palette_bytes.chunks(2).enumerate().take(256) {
        let lo = pair[0] as u16;
        let hi = *pair.get(1).unwrap_or(&0) as u16;
        palette[i] = lo | (hi << 8);
    }
    cpu.bus.palette = palette;

    for slot in 0..peripheral::SLOT_COUNT {
        cpu.bus.peripherals[slot] = Box::new(peripheral::NullPeripheral);
    }
    for (slot_str, type_name) in &state.peripherals {
        let Ok(slot) = slot_str.parse::<usize>() else {
            continue;
        };
        if slot >= peripheral::SLOT_COUNT {
            continue;
        }
        let Some(mut instance) = peripheral::instantiate_peripheral(type_name) else {
            tracing::warn!(type_name, slot, "unregistered peripheral type, skipping");
            continue;
        };
        if let Ok(data) = read_bytes(&mut zip, &format!("peripheral_{slot}.bin")) {
            instance.load_state(&data);
        }
        cpu.bus.peripherals[slot] = instance;
    }

    for (address, type_name) in &state.message_devices {
        let Some(mut instance) = peripheral::instantiate_message_device(type_name) else {
            tracing::warn!(type_name, address, "unregistered message device type, skipping");
            continue;
        };
        if let Ok(data) = read_bytes(&mut zip, &format!("message_device_{}.bin", sanitize(address))) {
            instance.load_state(&data);
        }
        cpu.bus.message_bus.attach(address, instance);
    }

    let metadata: VfsMetadata = read_json(&mut zip, "vfs_metadata.json")?;
    let vfs = cpu.vfs();
    for name in vfs.list() {
        let _ = vfs.delete(&name);
    }
    for entry in &metadata.files {
        let data = read_bytes(&mut zip, &format!("vfs/{}", entry.name))?;
        vfs.write(&entry.name, data, entry.modified)
            .map_err(|e| HibernationError::Malformed(e.to_string()))?;
    }

    tracing::info!(path = %path.display(), files = metadata.files.len(), "restored hibernation snapshot");
    Ok(())
}

fn sanitize(address: &str) -> String {
    address.chars().map(|c| if c.is_alphanumeric() { c } else { '_' }).collect()
}

fn read_bytes(zip: &mut ZipArchive<std::fs::File>, name: &str) -> Result<Vec<u8>, HibernationError> {
    let mut entry = zip
        .by_name(name)
        .map_err(|_| HibernationError::Malformed(format!("missing entry {name:?}")))?;
    let mut buf = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut buf)?;
    Ok(buf)
}

fn read_json<T: for<'de> Deserialize<'de>>(
    zip: &mut ZipArchive<std::fs::File>,
    name: &str,
) -> Result<T, HibernationError> {
    let bytes = read_bytes(zip, name)?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::VirtualDisk;
    use std::sync::Arc;

    #[test]
    fn round_trip_preserves_registers_and_memory() {
        let vfs = Arc::new(VirtualDisk::new());
        let mut cpu = Cpu::new(vfs.clone());
        cpu.regs[0] = 0x1234;
        cpu.sp = 0xFFFC;
        cpu.bus.write16(0x2000, 0xBEEF);
        cpu.bus.palette_index = 7;
        cpu.bus.palette[7] = 0xF81F;
        vfs.write("A.TXT", b"hi".to_vec(), Utc::now()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.zip");
        save(&cpu, &path).unwrap();

        let vfs2 = Arc::new(VirtualDisk::new());
        let mut cpu2 = Cpu::new(vfs2);
        restore(&mut cpu2, &path).unwrap();

        assert_eq!(cpu2.regs[0], 0x1234);
        assert_eq!(cpu2.sp, 0xFFFC);
        assert_eq!(cpu2.bus.read16(0x2000), 0xBEEF);
        assert_eq!(cpu2.bus.palette[7], 0xF81F);
        assert_eq!(cpu2.vfs().read("A.TXT").unwrap(), b"hi");
    }

    #[test]
    fn unregistered_peripheral_type_is_skipped_on_restore() {
        let vfs = Arc::new(VirtualDisk::new());
        let cpu = Cpu::new(vfs);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.zip");
        save(&cpu, &path).unwrap();

        // Rewrite cpu_state.json inside the archive `save` just wrote so it
        // names an unregistered peripheral type in slot 3, leaving every
        // other entry byte-for-byte as `save` produced it.
        let file = std::fs::File::open(&path).unwrap();
        let mut zip = ZipArchive::new(file).unwrap();
        let mut entries = Vec::with_capacity(zip.len());
        for i in 0..zip.len() {
            let mut entry = zip.by_index(i).unwrap();
            let name = entry.name().to_string();
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf).unwrap();
            entries.push((name, buf));
        }
        for (name, buf) in entries.iter_mut() {
            if name == "cpu_state.json" {
                let mut state: CpuStateJson = serde_json::from_slice(buf).unwrap();
                state.peripherals.insert("3".to_string(), "no-such-device".to_string());
                *buf = serde_json::to_vec_pretty(&state).unwrap();
            }
        }

        let out = std::fs::File::create(&path).unwrap();
        let mut writer = ZipWriter::new(out);
        for (name, buf) in &entries {
            writer.start_file(name, options()).unwrap();
            writer.write_all(buf).unwrap();
        }
        writer.finish().unwrap();

        let vfs2 = Arc::new(VirtualDisk::new());
        let mut cpu2 = Cpu::new(vfs2);
        restore(&mut cpu2, &path).unwrap();
        assert_eq!(cpu2.bus.peripherals[3].type_name(), "null");
    }
}
