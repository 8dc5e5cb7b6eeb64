use thiserror::Error;

/// Errors raised while scanning or parsing a compilation unit.
///
/// The compiler aggregates these (it keeps emitting after a
/// synchronise) but the VM never runs a unit that produced any.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("[line {line}] Error{at}: {message}")]
pub struct CompileError {
    pub line: usize,
    /// `" at 'lexeme'"`, or empty at EOF / for lexical errors that have no
    /// single offending token.
    pub at: String,
    pub message: String,
}

/// A single frame of the stack trace attached to a `RuntimeError`.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceFrame {
    pub name: String,
    pub line: usize,
}

/// Errors raised while executing bytecode. Unrecoverable from Sox code,
/// there is no try/catch; the VM resets its stack and aborts the current
/// `run`.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> RuntimeError {
        RuntimeError { message: message.into(), trace: Vec::new() }
    }

    /// Render the message followed by a top-down stack trace, matching the
    /// format collaborators (e.g. a CLI driver) print to stderr.
    pub fn render(&self) -> String {
        let mut out = self.message.clone();
        for frame in &self.trace {
            out.push('\n');
            out.push_str(&format!("[line {}] in {}", frame.line, frame.name));
        }
        out
    }
}

/// Outcome of `Vm::interpret` / `Vm::run`, mirroring the exit-code
/// convention in spec.md §6 (`interpret(source) -> ok | compile_error |
/// runtime_error`).
#[derive(Debug)]
pub enum InterpretResult {
    Ok,
    CompileError(Vec<CompileError>),
    RuntimeError(RuntimeError),
}

impl InterpretResult {
    /// Exit code per spec.md §6: 0 success, 65 compile error, 70 runtime
    /// error. (64 usage / 74 I/O error belong to the external driver.)
    pub fn exit_code(&self) -> i32 {
        match self {
            InterpretResult::Ok => 0,
            InterpretResult::CompileError(_) => 65,
            InterpretResult::RuntimeError(_) => 70,
        }
    }
}
