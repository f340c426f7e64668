//! A self-contained 16-bit virtual machine platform: a CPU emulator with
//! a memory-mapped peripheral bus, a persistent virtual filesystem,
//! hibernation (suspend/resume) support, and a two-stage toolchain
//! (C-subset compiler → symbolic assembler) that produces binaries
//! runnable on the VM.

pub mod assembler;
pub mod ast;
pub mod bus;
pub mod codegen;
pub mod cpu;
pub mod error;
pub mod hibernate;
pub mod lexer;
pub mod parser;
pub mod peripheral;
pub mod preprocessor;
pub mod symtab;
pub mod vfs;

use std::path::Path;
use std::sync::Arc;

use error::DriverError;

/// Runs the full C → assembly → bytes pipeline the driver CLI uses for a
/// `.c` input: preprocess, lex, parse, generate assembly, then assemble.
pub fn compile_c_source(source: &str, origin: &str, include_dir: &Path) -> Result<assembler::AssembledProgram, DriverError> {
    let mut pp = preprocessor::Preprocessor::new();
    let expanded = pp.process_source(source, origin, include_dir)?;
    tracing::debug!(origin, expanded_len = expanded.len(), "preprocessed source");

    let tokens = lexer::tokenize(&expanded)?;
    tracing::debug!(tokens = tokens.len(), "lexed source");

    let program = parser::parse(tokens)?;
    tracing::debug!(
        functions = program.functions.len(),
        globals = program.globals.len(),
        "parsed program"
    );

    let assembly = codegen::generate(&program)?;
    tracing::debug!(assembly_lines = assembly.lines().count(), "generated assembly");

    let assembled = assembler::assemble(&assembly)?;
    tracing::info!(bytes = assembled.code.len(), "assembled program image");
    Ok(assembled)
}

/// Assembles `source` (symbolic assembly text) directly, for `.s` and
/// other non-`.c` inputs.
pub fn assemble_source(source: &str) -> Result<assembler::AssembledProgram, DriverError> {
    Ok(assembler::assemble(source)?)
}

/// A running VM instance: the CPU plus the VFS it reads and writes
/// through the command port, shared with a background persistence
/// ticker.
pub struct Machine {
    pub cpu: cpu::Cpu,
    pub vfs: Arc<vfs::VirtualDisk>,
}

impl Machine {
    pub fn new() -> Self {
        let vfs = Arc::new(vfs::VirtualDisk::new());
        Machine {
            cpu: cpu::Cpu::new(vfs.clone()),
            vfs,
        }
    }

    /// Loads `storage_dir`'s contents into the VFS before running.
    pub fn load_storage(&mut self, storage_dir: &Path) -> Result<(), DriverError> {
        self.vfs.load_from(storage_dir, chrono::Utc::now())?;
        Ok(())
    }

    /// Loads `program` at address 0 and runs a bounded burst of steps at
    /// a time until the CPU halts (and is not mid-`ExecWait`) or
    /// `max_steps` is exhausted, whichever comes first.
    pub fn run(&mut self, program: &[u8], max_steps: u64) {
        self.cpu.load(program);
        let mut steps = 0u64;
        loop {
            if steps >= max_steps {
                tracing::warn!(max_steps, "run budget exhausted before halt");
                break;
            }
            match self.cpu.step() {
                cpu::StepOutcome::Halted => {
                    tracing::info!(steps, "cpu halted");
                    break;
                }
                cpu::StepOutcome::Waiting => {
                    // A real host yields to its scheduler here; tests and
                    // the CLI driver just keep polling since nothing else
                    // is running.
                }
                _ => {}
            }
            steps += 1;
        }
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}
