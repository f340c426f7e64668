//! Per-component error hierarchy, wired together with `thiserror` so the
//! driver can use `?` end to end and still recover a precise exit code.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the virtual disk.
#[derive(Error, Debug)]
pub enum VfsError {
    #[error("invalid filename: {0:?}")]
    InvalidName(String),
    #[error("file not found: {0:?}")]
    NotFound(String),
    #[error("disk quota exceeded: {requested} bytes requested, {available} available")]
    QuotaExceeded { requested: usize, available: usize },
    #[error("buffer access out of bounds at address {0:#06x}")]
    OutOfBounds(u16),
    #[error("io error persisting {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by the preprocessor.
#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("{file}: include cycle detected for {included:?}")]
    IncludeCycle { file: String, included: String },
    #[error("{file}: cannot resolve include {included:?}")]
    UnresolvedInclude { file: String, included: String },
    #[error("{file}:{line}: malformed macro definition")]
    MalformedDefine { file: String, line: usize },
    #[error("{file}:{line}: unterminated macro argument list")]
    UnterminatedArgs { file: String, line: usize },
}

/// Errors raised by the lexer.
#[derive(Error, Debug)]
pub enum LexError {
    #[error("line {line}: unterminated string literal")]
    UnterminatedString { line: usize },
    #[error("line {line}: unterminated character literal")]
    UnterminatedChar { line: usize },
    #[error("line {line}: unterminated block comment")]
    UnterminatedComment { line: usize },
    #[error("line {line}: unexpected character {ch:?}")]
    UnexpectedChar { line: usize, ch: char },
    #[error("line {line}: invalid numeric literal {text:?}")]
    InvalidNumber { line: usize, text: String },
}

/// Errors raised by the parser.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("line {line}: expected {expected}, found {found:?}")]
    UnexpectedToken {
        line: usize,
        expected: String,
        found: String,
    },
    #[error("line {line}: unexpected end of input, expected {expected}")]
    UnexpectedEof { line: usize, expected: String },
    #[error("line {line}: a statement is not allowed at file scope")]
    StatementAtFileScope { line: usize },
}

/// Errors raised by the code generator.
#[derive(Error, Debug)]
pub enum CodegenError {
    #[error("line {line}: undefined variable {name:?}")]
    UndefinedVariable { line: usize, name: String },
    #[error("line {line}: undefined function {name:?}")]
    UndefinedFunction { line: usize, name: String },
    #[error("line {line}: division by zero in constant expression")]
    DivByZeroInConstExpr { line: usize },
    #[error("line {line}: break outside of a loop or switch")]
    BreakOutsideLoop { line: usize },
    #[error("line {line}: continue outside of a loop")]
    ContinueOutsideLoop { line: usize },
    #[error("line {line}: unknown struct type {name:?}")]
    UnknownStruct { line: usize, name: String },
    #[error("line {line}: unknown field {field:?} on struct {name:?}")]
    UnknownField { line: usize, name: String, field: String },
    #[error("line {line}: void function must not return a value")]
    VoidFunctionReturnsValue { line: usize },
    #[error("line {line}: non-void function must return a value")]
    MissingReturnValue { line: usize },
}

/// Errors raised by the assembler.
#[derive(Error, Debug)]
pub enum AssembleError {
    #[error("line {line}: undefined label {label:?}")]
    UndefinedLabel { line: usize, label: String },
    #[error("line {line}: duplicate label {label:?}")]
    DuplicateLabel { line: usize, label: String },
    #[error("line {line}: immediate {value} out of range for a 16-bit word")]
    ImmediateOutOfRange { line: usize, value: i64 },
    #[error("line {line}: unknown mnemonic or directive {text:?}")]
    UnknownMnemonic { line: usize, text: String },
    #[error("line {line}: wrong operand count for {mnemonic}, expected {expected}, found {found}")]
    WrongOperandCount {
        line: usize,
        mnemonic: String,
        expected: usize,
        found: usize,
    },
    #[error("program of {0} bytes exceeds the 64 KiB address space")]
    ProgramTooLarge(usize),
}

/// Errors raised while restoring or taking a hibernation snapshot.
#[derive(Error, Debug)]
pub enum HibernationError {
    #[error("zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed snapshot: {0}")]
    Malformed(String),
    #[error("snapshot serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Top-level error produced by the driver binary. Every component error
/// converts into this via `#[from]` so `?` propagates across the whole
/// compile → assemble → run pipeline; the CLI is the only place that
/// inspects it to choose a process exit code.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error(transparent)]
    Vfs(#[from] VfsError),
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Codegen(#[from] CodegenError),
    #[error(transparent)]
    Assemble(#[from] AssembleError),
    #[error(transparent)]
    Hibernation(#[from] HibernationError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid arguments: {0}")]
    Args(String),
}

impl DriverError {
    /// Maps this error onto the process exit codes documented for the
    /// driver CLI: 1 for I/O or compile-pipeline errors, 2 for argument
    /// errors.
    pub fn exit_code(&self) -> i32 {
        match self {
            DriverError::Args(_) => 2,
            _ => 1,
        }
    }
}
