//! Boundary to the external execution engine.
//!
//! The engine is consumed as an opaque command/query service: process
//! control, breakpoint placement, stack unwinding and variable introspection
//! all live behind [`Engine`]. Every call is synchronous from the adapter's
//! point of view.

use std::path::{Path, PathBuf};

use strum_macros::Display;

use crate::value::ValueSnapshot;

/// Execution command issued to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum EngineCommand {
    Continue,
    Next,
    Step,
    StepOut,
    Halt,
}

impl EngineCommand {
    /// Step-family commands stop with reason "step", everything else stops
    /// on a breakpoint.
    pub fn is_step(&self) -> bool {
        matches!(
            self,
            EngineCommand::Next | EngineCommand::Step | EngineCommand::StepOut
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("debugee process exit with code {0}")]
    ProcessExit(i32),
    #[error("thread {0} not found")]
    ThreadNotFound(i64),
    #[error("frame {1} not found in thread {0}")]
    FrameNotFound(i64, usize),
    #[error("breakpoint {0} not found")]
    BreakpointNotFound(i64),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// State reported by the engine after a command or a state query.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineState {
    pub exited: bool,
    pub exit_code: i32,
    /// Thread the engine selected for subsequent operations.
    pub selected_thread: i64,
    /// Thread the engine is currently positioned on.
    pub current_thread: i64,
}

/// One live execution thread with its user-visible position.
#[derive(Debug, Clone)]
pub struct ThreadInfo {
    pub id: i64,
    pub function: Option<String>,
    pub file: PathBuf,
    pub line: i64,
}

/// One activation record within a thread call stack.
#[derive(Debug, Clone)]
pub struct FrameInfo {
    pub function: Option<String>,
    pub file: PathBuf,
    pub line: i64,
    /// Location synthesized by the compiler, with no backing source file.
    pub synthetic: bool,
}

#[derive(Debug, Clone)]
pub struct BreakpointInfo {
    pub id: i64,
    pub file: PathBuf,
    pub line: i64,
    pub condition: Option<String>,
}

/// Synchronous execution-control service driven by the adapter.
pub trait Engine {
    /// Runs `command` and blocks until the debuggee stops or exits.
    fn command(&mut self, command: EngineCommand) -> EngineResult<EngineState>;

    /// Current engine state. With `nowait` the call must not block on a
    /// running debuggee.
    fn state(&mut self, nowait: bool) -> EngineResult<EngineState>;

    fn threads(&mut self) -> EngineResult<Vec<ThreadInfo>>;

    fn stacktrace(&mut self, thread_id: i64, depth: usize) -> EngineResult<Vec<FrameInfo>>;

    fn function_arguments(&mut self, thread_id: i64, frame: usize)
        -> EngineResult<Vec<ValueSnapshot>>;

    fn local_variables(&mut self, thread_id: i64, frame: usize)
        -> EngineResult<Vec<ValueSnapshot>>;

    /// Package-scoped global variables of `package`, fully qualified names.
    fn package_variables(&mut self, package: &str) -> EngineResult<Vec<ValueSnapshot>>;

    fn current_package(&mut self) -> EngineResult<String>;

    fn breakpoints(&mut self) -> EngineResult<Vec<BreakpointInfo>>;

    fn create_breakpoint(
        &mut self,
        file: &Path,
        line: i64,
        condition: Option<String>,
    ) -> EngineResult<BreakpointInfo>;

    fn clear_breakpoint(&mut self, id: i64) -> EngineResult<()>;

    /// Detaches from the debuggee, killing it when `kill` is set. Must
    /// tolerate being called after the process already exited.
    fn detach(&mut self, kill: bool) -> EngineResult<()>;
}

/// Creates an engine attached to a freshly launched debuggee.
pub trait EngineFactory: Send {
    fn launch(&self, program: &Path, args: &[String]) -> EngineResult<Box<dyn Engine + Send>>;

    /// True when the factory launches the debuggee itself, as opposed to
    /// attaching to a pre-existing process. Launched debuggees are killed on
    /// detach.
    fn launches_debuggee(&self) -> bool {
        true
    }
}
