//! End-to-end tests driving the public `vm16` API the way the CLI driver
//! does: source text in, an assembled image, a running `Machine`, and
//! (for hibernation/VFS) a host directory. These mirror the concrete
//! scenarios the platform is expected to reproduce exactly.

use std::sync::Arc;

use vm16::bus;
use vm16::cpu::Cpu;
use vm16::preprocessor::Preprocessor;
use vm16::vfs::VirtualDisk;
use vm16::{assemble_source, compile_c_source, hibernate, Machine};

const MAX_STEPS: u64 = 1_000_000;

#[test]
fn fibonacci_recursion_matches_expected_trace() {
    let source = "int fib(int n){if(n==0)return 0;if(n==1)return 1;return fib(n-1)+fib(n-2);} \
                  int main(){int*out=0x3000;*out=fib(6);return fib(6);}";
    let assembled = compile_c_source(source, "fib.c", std::path::Path::new(".")).unwrap();

    let mut machine = Machine::new();
    machine.run(&assembled.code, MAX_STEPS);

    assert_eq!(machine.cpu.regs[0], 8);
    assert_eq!(machine.cpu.bus.read16(0x3000), 8);
    assert_eq!(machine.cpu.sp, 0xFFFE);
}

#[test]
fn unsigned_division_of_a_large_bit_pattern() {
    let source = "int main(){unsigned int x=0xFFF6;return x/2;}";
    let assembled = compile_c_source(source, "udiv.c", std::path::Path::new(".")).unwrap();

    let mut machine = Machine::new();
    machine.run(&assembled.code, MAX_STEPS);

    assert_eq!(machine.cpu.regs[0], 32763);
}

#[test]
fn signed_division_of_the_same_bit_pattern() {
    let source = "int main(){int x=-10;return x/2;}";
    let assembled = compile_c_source(source, "sdiv.c", std::path::Path::new(".")).unwrap();

    let mut machine = Machine::new();
    machine.run(&assembled.code, MAX_STEPS);

    assert_eq!(machine.cpu.regs[0], 0xFFFB);
}

/// Writes "Hello" to `TEST.TXT` through the VFS command port, then reads
/// it back into a different address, matching the round-trip scenario
/// the command port is specified against.
#[test]
fn vfs_round_trip_through_the_command_port() {
    let asm = r#"
        LDI R3, 0x4000
        LDI R0, 0xFF11
        ST R0, R3
        LDI R3, 0x4020
        LDI R0, 0xFF12
        ST R0, R3
        LDI R3, 5
        LDI R0, 0xFF13
        ST R0, R3
        LDI R3, 2
        LDI R0, 0xFF10
        ST R0, R3
        LDI R3, 0x4100
        LDI R0, 0xFF12
        ST R0, R3
        LDI R3, 5
        LDI R0, 0xFF13
        ST R0, R3
        LDI R3, 1
        LDI R0, 0xFF10
        ST R0, R3
        LDI R0, 0xFF14
        LD R5, R0
        HLT
        .ORG 0x4000
        .STRING "TEST.TXT"
        .ORG 0x4020
        .STRING "Hello"
    "#;
    let assembled = assemble_source(asm).unwrap();

    let mut machine = Machine::new();
    machine.run(&assembled.code, MAX_STEPS);

    assert_eq!(machine.cpu.regs[5], 0); // VfsStatus::Ok
    let buf = machine.cpu.bus.read_block(0x4100, 5);
    assert_eq!(buf, vec![0x48, 0x65, 0x6C, 0x6C, 0x6F]);
    assert_eq!(machine.vfs.read("TEST.TXT").unwrap(), buf);
}

/// `EI` then `WFI` parks the CPU; an external keypress both queues the
/// code in the keyboard FIFO and raises the pending interrupt, and the
/// next `step` dispatches to the fixed handler vector.
#[test]
fn interrupt_dispatch_delivers_a_queued_keycode() {
    let vfs = Arc::new(VirtualDisk::new());
    let mut cpu = Cpu::new(vfs);
    let asm = "EI\nWFI\nHLT";
    let assembled = assemble_source(asm).unwrap();
    cpu.load(&assembled.code);

    cpu.step(); // EI
    cpu.step(); // WFI, enters Waiting

    cpu.push_key(65);
    cpu.request_interrupt();

    let saved_pc = cpu.pc;
    cpu.step();

    assert_eq!(cpu.pc, 0x0010);
    assert!(!cpu.flags.ie);
    assert_eq!(cpu.bus.read16(cpu.sp), saved_pc);
    assert_eq!(cpu.bus.read16_effectful(bus::REG_KEYBOARD), 65);
    assert_eq!(cpu.bus.read16_effectful(bus::REG_KEYBOARD), 0);
}

#[test]
fn preprocessor_expands_a_function_like_macro_and_rescans() {
    let mut pp = Preprocessor::new();
    let source = "#define MIN(a,b) ((a)<(b)?(a):(b))\nint m=MIN(5,10);\n";
    let expanded = pp.process_source(source, "macro.c", std::path::Path::new(".")).unwrap();
    assert!(expanded.contains("int m = ((5) < (10) ? (5) : (10));"));
}

/// Running a program partway, hibernating, restoring into a fresh
/// machine, and continuing for the remaining steps must match running
/// the whole program uninterrupted on the original machine.
#[test]
fn hibernation_round_trip_matches_uninterrupted_execution() {
    let source = "int fib(int n){if(n==0)return 0;if(n==1)return 1;return fib(n-1)+fib(n-2);} \
                  int main(){int*out=0x3000;*out=fib(8);return fib(8);}";
    let assembled = compile_c_source(source, "fib.c", std::path::Path::new(".")).unwrap();

    let mut reference = Machine::new();
    reference.run(&assembled.code, MAX_STEPS);

    let mut first_half = Machine::new();
    first_half.cpu.load(&assembled.code);
    for _ in 0..200 {
        if first_half.cpu.halted {
            break;
        }
        first_half.cpu.step();
    }

    let dir = tempfile::tempdir().unwrap();
    let snapshot = dir.path().join("snap.zip");
    hibernate::save(&first_half.cpu, &snapshot).unwrap();

    let vfs2 = Arc::new(VirtualDisk::new());
    let mut resumed = Cpu::new(vfs2);
    hibernate::restore(&mut resumed, &snapshot).unwrap();

    for _ in 0..MAX_STEPS {
        if resumed.halted {
            break;
        }
        resumed.step();
    }

    assert_eq!(resumed.regs, reference.cpu.regs);
    assert_eq!(resumed.sp, reference.cpu.sp);
    assert_eq!(resumed.bus.read16(0x3000), reference.cpu.bus.read16(0x3000));
}

/// A `Machine` built with `storage` loads existing VFS files from the
/// host directory, and writes through the command port show up there
/// after `persist_to`.
#[test]
fn vfs_persists_through_a_host_storage_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("SEED.TXT"), b"seed").unwrap();

    let mut machine = Machine::new();
    machine.load_storage(dir.path()).unwrap();
    assert_eq!(machine.vfs.read("SEED.TXT").unwrap(), b"seed");

    machine.vfs.write("NEW.TXT", b"fresh".to_vec(), chrono::Utc::now()).unwrap();
    machine.vfs.persist_to(dir.path()).unwrap();

    let on_disk = std::fs::read(dir.path().join("NEW.TXT")).unwrap();
    assert_eq!(on_disk, b"fresh");
}

/// `COPY` with overlapping forward ranges must copy high-to-low so the
/// source isn't clobbered before it's read, the same scenario the
/// opcode table documents for `src < dst < src + count*2`.
#[test]
fn copy_handles_an_overlapping_forward_range() {
    let vfs = Arc::new(VirtualDisk::new());
    let mut cpu = Cpu::new(vfs);
    let asm = "LDI R0, 0x1000\nLDI R1, 0x1002\nLDI R2, 3\nCOPY R0, R1, R2\nHLT";
    let assembled = assemble_source(asm).unwrap();
    cpu.load(&assembled.code);
    cpu.bus.write16(0x1000, 1);
    cpu.bus.write16(0x1002, 2);
    cpu.bus.write16(0x1004, 3);
    cpu.bus.write16(0x1006, 4);

    loop {
        match cpu.step() {
            vm16::cpu::StepOutcome::Halted => break,
            _ => {}
        }
    }

    assert_eq!(cpu.bus.read16(0x1000), 1);
    assert_eq!(cpu.bus.read16(0x1002), 1);
    assert_eq!(cpu.bus.read16(0x1004), 2);
    assert_eq!(cpu.bus.read16(0x1006), 3);
}

#[test]
fn dead_function_is_absent_from_generated_assembly() {
    let source = "int unused(){return 99;} int main(){return 1;}";
    let expanded = Preprocessor::new()
        .process_source(source, "dce.c", std::path::Path::new("."))
        .unwrap();
    let tokens = vm16::lexer::tokenize(&expanded).unwrap();
    let program = vm16::parser::parse(tokens).unwrap();
    let assembly = vm16::codegen::generate(&program).unwrap();

    assert!(!assembly.contains("unused"));
    assert!(assembly.contains("main"));
}
