//! Command-line driver: compiles or assembles a source file, optionally
//! runs the resulting image (or a prebuilt binary) against a VFS backed
//! by a host storage directory, with a background ticker keeping that
//! directory in sync while the machine runs.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use vm16::error::DriverError;
use vm16::vfs::VirtualDisk;
use vm16::Machine;

const PERSIST_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_MAX_STEPS: u64 = 10_000_000;

#[derive(Parser, Debug)]
#[command(name = "vm16", about = "C-subset toolchain and emulator for the 16-bit VM platform")]
struct Cli {
    /// Source file to compile/assemble: a `.c` file runs the full
    /// compiler pipeline, anything else is assembled directly.
    #[arg(short = 'i', long = "in")]
    input: PathBuf,

    /// Where to write the assembled binary image. Defaults to `<in>.bin`.
    #[arg(short = 'o', long = "out")]
    output: Option<PathBuf>,

    /// Run the freshly assembled image after building it.
    #[arg(long)]
    run: bool,

    /// Run a prebuilt binary image instead of compiling `-in`.
    #[arg(long = "run-bin")]
    run_bin: Option<PathBuf>,

    /// Host directory backing the virtual filesystem for a run.
    #[arg(long)]
    storage: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "driver failed");
            eprintln!("error: {err}");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

fn run(cli: Cli) -> Result<(), DriverError> {
    let code = if let Some(bin_path) = &cli.run_bin {
        std::fs::read(bin_path)?
    } else {
        let source = std::fs::read_to_string(&cli.input)?;
        let origin = cli
            .input
            .to_str()
            .ok_or_else(|| DriverError::Args("input path is not valid UTF-8".to_string()))?;
        let include_dir = cli.input.parent().unwrap_or_else(|| Path::new("."));

        let assembled = if cli.input.extension().and_then(|e| e.to_str()) == Some("c") {
            vm16::compile_c_source(&source, origin, include_dir)?
        } else {
            vm16::assemble_source(&source)?
        };

        let out_path = cli.output.clone().unwrap_or_else(|| cli.input.with_extension("bin"));
        std::fs::write(&out_path, &assembled.code)?;
        tracing::info!(path = %out_path.display(), bytes = assembled.code.len(), "wrote image");
        assembled.code
    };

    if cli.run || cli.run_bin.is_some() {
        run_machine(&code, cli.storage.as_deref())?;
    }

    Ok(())
}

fn run_machine(code: &[u8], storage: Option<&Path>) -> Result<(), DriverError> {
    let mut machine = Machine::new();
    if let Some(dir) = storage {
        machine.load_storage(dir)?;
    }

    let ticker = storage.map(|dir| spawn_ticker(machine.vfs.clone(), dir.to_path_buf()));

    machine.run(code, DEFAULT_MAX_STEPS);

    if !machine.cpu.bus.console.is_empty() {
        print!("{}", String::from_utf8_lossy(&machine.cpu.bus.console));
    }

    if let Some(dir) = storage {
        machine.vfs.persist_to(dir)?;
    }
    if let Some(ticker) = ticker {
        ticker.stop();
    }

    Ok(())
}

/// A background thread that periodically flushes VFS dirty state to
/// its host directory, so a long-running or hung program doesn't lose
/// writes it already made. Joined (not detached) on `stop` so the
/// driver never exits mid-flush.
struct Ticker {
    stop_flag: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Ticker {
    fn stop(mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn spawn_ticker(vfs: Arc<VirtualDisk>, dir: PathBuf) -> Ticker {
    let stop_flag = Arc::new(AtomicBool::new(false));
    let flag = stop_flag.clone();
    let handle = std::thread::spawn(move || {
        while !flag.load(Ordering::SeqCst) {
            std::thread::sleep(PERSIST_INTERVAL);
            if vfs.is_dirty() {
                if let Err(err) = vfs.persist_to(&dir) {
                    tracing::warn!(error = %err, "background persist failed");
                }
            }
        }
    });
    Ticker {
        stop_flag,
        handle: Some(handle),
    }
}
