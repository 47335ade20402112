//! DAP session controller and request router.
//!
//! A server serves exactly one client connection. Two flows of control touch
//! it: the serve flow ([`Server::run`]) accepts the connection and processes
//! requests strictly sequentially, and the lifecycle-owner flow
//! ([`ServerHandle::stop`]) tears the session down from outside. Teardown is
//! idempotent and safe to invoke from either flow, or both racing.

use std::any::Any;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};

use itertools::Itertools;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use strum_macros::EnumString;

use crate::build::BuildService;
use crate::convert::{children, ValueRegistry};
use crate::engine::{Engine, EngineCommand, EngineError, EngineFactory};
use crate::handles::HandleRegistry;
use crate::protocol::{
    error_body, Breakpoint, Capabilities, ContinueResponseBody, Event, OutputEventBody, Request,
    Response, Scope, ScopesArguments, ScopesResponseBody, SetBreakpointsArguments,
    SetBreakpointsResponseBody, Source, StackFrame, StackTraceArguments, StackTraceResponseBody,
    StoppedEventBody, Thread, ThreadsResponseBody, VariablesArguments, VariablesResponseBody,
    FAILED_TO_LAUNCH, INTERNAL_ERROR, NOT_YET_IMPLEMENTED, UNABLE_TO_DISPLAY_THREADS,
    UNABLE_TO_LIST_ARGS, UNABLE_TO_LIST_GLOBALS, UNABLE_TO_LIST_LOCALS, UNABLE_TO_LOOKUP_VARIABLE,
    UNABLE_TO_PRODUCE_STACK_TRACE, UNABLE_TO_SET_BREAKPOINTS, UNSUPPORTED_COMMAND,
};
use crate::transport::{ConnectionClosed, DapTransport, TcpTransport};
use crate::value::ValueSnapshot;
use crate::weak_error;

/// Default output path for built debuggee binaries.
pub const DEBUG_BINARY: &str = "./__debug_bin";

/// Rewrite of the raw "bad access" fault text into a message that actually
/// tells the user what happened.
pub const BETTER_BAD_ACCESS_ERROR: &str = "invalid memory address or nil pointer dereference \
[signal SIGSEGV: segmentation violation]\nUnable to propagate EXC_BAD_ACCESS signal to target \
process and panic";

/// Session launch mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum LaunchMode {
    /// Build the program with a debug profile, then run the artifact.
    Debug,
    /// Build the test harness of the program, then run the artifact.
    Test,
    /// Run an already-built executable as is.
    Exec,
}

/// Per-session configuration derived from launch arguments.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub stop_on_entry: bool,
    pub stack_trace_depth: usize,
    pub show_global_variables: bool,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        LaunchConfig {
            stop_on_entry: false,
            stack_trace_depth: 50,
            show_global_variables: false,
        }
    }
}

/// Payload of a stack-frame handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRef {
    pub thread_id: i64,
    pub frame_index: usize,
}

/// State reachable from both the serve flow and the lifecycle-owner flow.
pub struct Shared {
    stopped: AtomicBool,
    /// Set when the engine launched the debuggee itself; launched debuggees
    /// are killed on detach.
    launched: AtomicBool,
    conn: Mutex<Option<TcpStream>>,
    engine: Mutex<Option<Box<dyn Engine + Send>>>,
    disconnect: Mutex<Option<mpsc::Sender<()>>>,
    binary_to_remove: Mutex<Option<PathBuf>>,
}

impl Shared {
    fn new(disconnect: mpsc::Sender<()>) -> Arc<Self> {
        Arc::new(Shared {
            stopped: AtomicBool::new(false),
            launched: AtomicBool::new(false),
            conn: Mutex::new(None),
            engine: Mutex::new(None),
            disconnect: Mutex::new(Some(disconnect)),
            binary_to_remove: Mutex::new(None),
        })
    }
}

// A handler panic while the engine lock is held must not wedge the session.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Fires the session-done signal; subsequent calls are no-ops.
fn signal_disconnect(shared: &Shared) {
    if let Some(tx) = lock(&shared.disconnect).take() {
        let _ = tx.send(());
    }
}

/// One-shot DAP server bound to a TCP listener.
pub struct Server {
    listener: TcpListener,
    engine_factory: Box<dyn EngineFactory>,
    build: Box<dyn BuildService>,
    shared: Arc<Shared>,
}

/// Cloneable lifecycle handle for an owner task.
#[derive(Clone)]
pub struct ServerHandle {
    addr: SocketAddr,
    shared: Arc<Shared>,
}

impl Server {
    /// `disconnect` fires exactly once, when the session ends for any reason
    /// (client disconnect, read failure or [`ServerHandle::stop`]).
    pub fn new(
        listener: TcpListener,
        engine_factory: Box<dyn EngineFactory>,
        build: Box<dyn BuildService>,
        disconnect: mpsc::Sender<()>,
    ) -> anyhow::Result<(Server, ServerHandle)> {
        let addr = listener.local_addr()?;
        let shared = Shared::new(disconnect);
        let handle = ServerHandle {
            addr,
            shared: shared.clone(),
        };
        let server = Server {
            listener,
            engine_factory,
            build,
            shared,
        };
        Ok((server, handle))
    }

    /// Accepts exactly one client connection and serves it to completion.
    pub fn run(self) -> anyhow::Result<()> {
        let (stream, peer) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(e) => {
                if self.shared.stopped.load(Ordering::SeqCst) {
                    return Ok(());
                }
                return Err(e.into());
            }
        };
        if self.shared.stopped.load(Ordering::SeqCst) {
            // stop() raced the accept with its unblocking probe connection.
            return Ok(());
        }
        log::info!(target: "dap", "accepted DAP client connection from {peer}");

        *lock(&self.shared.conn) = Some(stream.try_clone()?);
        let transport = TcpTransport::new(stream)?;
        let mut session = Session::new(
            transport,
            self.shared.clone(),
            self.engine_factory.as_ref(),
            self.build.as_ref(),
        );
        session.serve();
        drop(session);

        if let Some(mut engine) = lock(&self.shared.engine).take() {
            let kill = self.shared.launched.load(Ordering::SeqCst);
            weak_error!(engine.detach(kill), "detach on teardown:");
        }
        if let Some(path) = lock(&self.shared.binary_to_remove).take() {
            self.build.remove(&path);
        }
        signal_disconnect(&self.shared);
        Ok(())
    }
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Tears the session down from the owner flow. Idempotent; tolerates a
    /// racing client-initiated disconnect.
    pub fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!(target: "dap", "stopping DAP server");
        // An accepted connection is shut down so the blocked read in the
        // serve flow fails; without one the serve flow is still blocked in
        // accept, which a probe connection unblocks.
        if let Some(conn) = lock(&self.shared.conn).as_ref() {
            let _ = conn.shutdown(Shutdown::Both);
        } else {
            let _ = TcpStream::connect(self.addr);
        }
        // An engine missing from its slot is mid-command in the serve flow,
        // which re-checks the stop flag when the command returns and then
        // owns the detach.
        if let Some(mut engine) = lock(&self.shared.engine).take() {
            let kill = self.shared.launched.load(Ordering::SeqCst);
            weak_error!(engine.detach(kill), "detach on stop:");
        }
        signal_disconnect(&self.shared);
    }
}

/// Per-connection request loop: reads framed requests, dispatches them by
/// command and guarantees a response is sent even when a handler fails.
pub struct Session<'a, T: DapTransport> {
    transport: T,
    shared: Arc<Shared>,
    engine_factory: &'a dyn EngineFactory,
    build: &'a dyn BuildService,
    config: LaunchConfig,
    frames: HandleRegistry<FrameRef>,
    values: ValueRegistry,
    seq: i64,
}

// Validated launch request, ready to run. Config attributes stay buffered
// here until every key has validated; a rejected launch must not leave any
// of them applied.
struct LaunchPlan {
    program: PathBuf,
    mode: LaunchMode,
    output: PathBuf,
    build_flags: String,
    program_args: Vec<String>,
    stop_on_entry: Option<bool>,
    stack_trace_depth: Option<usize>,
    show_global_variables: Option<bool>,
}

impl<'a, T: DapTransport> Session<'a, T> {
    pub fn new(
        transport: T,
        shared: Arc<Shared>,
        engine_factory: &'a dyn EngineFactory,
        build: &'a dyn BuildService,
    ) -> Self {
        Session {
            transport,
            shared,
            engine_factory,
            build,
            config: LaunchConfig::default(),
            frames: HandleRegistry::new(),
            values: ValueRegistry::new(),
            seq: 0,
        }
    }

    /// Processes requests until the client disconnects, the connection fails
    /// or the server is stopped.
    pub fn serve(&mut self) {
        loop {
            let message = match self.transport.read_message() {
                Ok(message) => message,
                Err(e) => {
                    if e.downcast_ref::<ConnectionClosed>().is_some()
                        || self.shared.stopped.load(Ordering::SeqCst)
                    {
                        log::debug!(target: "dap", "connection closed, session done");
                    } else {
                        log::error!(target: "dap", "read DAP message: {e:#}");
                    }
                    break;
                }
            };

            let request: Request = match serde_json::from_value(message) {
                Ok(request) => request,
                Err(e) => {
                    log::warn!(target: "dap", "drop undecodable message: {e}");
                    continue;
                }
            };

            let seq = request.seq;
            let command = request.command.clone();
            match catch_unwind(AssertUnwindSafe(|| self.handle_request(&request))) {
                Ok(true) => {}
                Ok(false) => break,
                Err(payload) => {
                    let text = panic_text(payload);
                    log::error!(target: "dap", "handler for {command:?} panicked: {text}");
                    self.send_internal_error(seq, &command, text);
                }
            }
        }
    }

    // Returns false when the session is over.
    fn handle_request(&mut self, request: &Request) -> bool {
        log::debug!(target: "dap", "request {} ({})", request.command, request.seq);
        match request.command.as_str() {
            "initialize" => self.on_initialize(request),
            "launch" => self.on_launch(request),
            "setBreakpoints" => self.on_set_breakpoints(request),
            // This request arrives even when no exception filters were
            // advertised; acknowledge it as a no-op.
            "setExceptionBreakpoints" => self.respond_ok(request.seq, &request.command, None),
            "configurationDone" => self.on_configuration_done(request),
            "continue" => self.on_continue(request),
            "next" => {
                self.respond_ok(request.seq, &request.command, None);
                self.do_command(EngineCommand::Next);
            }
            "stepIn" => {
                self.respond_ok(request.seq, &request.command, None);
                self.do_command(EngineCommand::Step);
            }
            "stepOut" => {
                self.respond_ok(request.seq, &request.command, None);
                self.do_command(EngineCommand::StepOut);
            }
            "threads" => self.on_threads(request),
            "stackTrace" => self.on_stack_trace(request),
            "scopes" => self.on_scopes(request),
            "variables" => self.on_variables(request),
            "disconnect" => {
                self.on_disconnect(request);
                return false;
            }
            // Mandatory to accept, not implemented in this version.
            "attach" | "pause" | "evaluate" | "setVariable" | "terminate" | "restart"
            | "setFunctionBreakpoints" | "stepBack" | "reverseContinue" | "setExpression"
            | "loadedSources" | "readMemory" | "disassemble" | "cancel" => self.respond_error(
                request.seq,
                &request.command,
                NOT_YET_IMPLEMENTED,
                "Not yet implemented",
                format!("cannot process {:?} request", request.command),
            ),
            // Advertised as unsupported in the initialize response.
            "restartFrame" | "goto" | "source" | "terminateThreads" | "stepInTargets"
            | "gotoTargets" | "completions" | "exceptionInfo" | "dataBreakpointInfo"
            | "setDataBreakpoints" | "breakpointLocations" | "modules" => self.respond_error(
                request.seq,
                &request.command,
                UNSUPPORTED_COMMAND,
                "Unsupported command",
                format!("cannot process {:?} request", request.command),
            ),
            _ => self.send_internal_error(
                request.seq,
                &request.command,
                format!("unable to process {:?} request", request.command),
            ),
        }
        true
    }

    fn on_initialize(&mut self, request: &Request) {
        self.respond_ok(
            request.seq,
            &request.command,
            body_of(Capabilities::default()),
        );
    }

    fn on_launch(&mut self, request: &Request) {
        let plan = match self.parse_launch(&request.arguments) {
            Ok(plan) => plan,
            Err(details) => {
                self.respond_error(
                    request.seq,
                    &request.command,
                    FAILED_TO_LAUNCH,
                    "Failed to launch",
                    details,
                );
                return;
            }
        };

        if let Some(stop_on_entry) = plan.stop_on_entry {
            self.config.stop_on_entry = stop_on_entry;
        }
        if let Some(depth) = plan.stack_trace_depth {
            self.config.stack_trace_depth = depth;
        }
        if let Some(show_globals) = plan.show_global_variables {
            self.config.show_global_variables = show_globals;
        }

        let build_result = match plan.mode {
            LaunchMode::Debug => self.build.build(&plan.output, &plan.program, &plan.build_flags),
            LaunchMode::Test => self
                .build
                .test_build(&plan.output, &plan.program, &plan.build_flags),
            LaunchMode::Exec => Ok(()),
        };
        if let Err(e) = build_result {
            self.respond_error(
                request.seq,
                &request.command,
                FAILED_TO_LAUNCH,
                "Failed to launch",
                format!("build error: {e:#}"),
            );
            return;
        }

        let program = match plan.mode {
            LaunchMode::Exec => plan.program,
            // The artifact is removed when the session ends.
            LaunchMode::Debug | LaunchMode::Test => {
                *lock(&self.shared.binary_to_remove) = Some(plan.output.clone());
                plan.output
            }
        };

        match self.engine_factory.launch(&program, &plan.program_args) {
            Ok(engine) => {
                self.shared
                    .launched
                    .store(self.engine_factory.launches_debuggee(), Ordering::SeqCst);
                *lock(&self.shared.engine) = Some(engine);
                // The initialized event opens the breakpoint-configuration
                // window; the debuggee is not resumed until configurationDone.
                self.send_event("initialized", None);
                self.respond_ok(request.seq, &request.command, None);
            }
            Err(e) => self.respond_error(
                request.seq,
                &request.command,
                FAILED_TO_LAUNCH,
                "Failed to launch",
                format!("{e:#}"),
            ),
        }
    }

    // Full validation happens before any side effect: a launch request with
    // a bad attribute neither builds nor launches anything, and touches no
    // session state.
    fn parse_launch(&self, arguments: &Value) -> Result<LaunchPlan, String> {
        let Some(args) = arguments.as_object() else {
            return Err("launch arguments must be a map".to_string());
        };

        let program = match string_arg(args, "program")? {
            Some(program) if !program.is_empty() => PathBuf::from(program),
            _ => return Err("The program attribute is missing in debug configuration.".to_string()),
        };

        let mode = string_arg(args, "mode")?.unwrap_or_else(|| "debug".to_string());
        let mode = LaunchMode::from_str(&mode)
            .map_err(|_| format!("Unsupported 'mode' value {mode:?} in debug configuration."))?;

        let output = string_arg(args, "output")?.unwrap_or_else(|| DEBUG_BINARY.to_string());
        let build_flags = string_arg(args, "buildFlags")?.unwrap_or_default();
        let program_args = string_array_arg(args, "args")?.unwrap_or_default();

        Ok(LaunchPlan {
            program,
            mode,
            output: PathBuf::from(output),
            build_flags,
            program_args,
            stop_on_entry: bool_arg(args, "stopOnEntry")?,
            stack_trace_depth: positive_int_arg(args, "stackTraceDepth")?,
            show_global_variables: bool_arg(args, "showGlobalVariables")?,
        })
    }

    fn on_set_breakpoints(&mut self, request: &Request) {
        let args: SetBreakpointsArguments = match parse_args(&request.arguments) {
            Ok(args) => args,
            Err(e) => {
                self.respond_error(
                    request.seq,
                    &request.command,
                    UNABLE_TO_SET_BREAKPOINTS,
                    "Unable to set breakpoints",
                    format!("{e:#}"),
                );
                return;
            }
        };
        let Some(path) = args.source.path.map(PathBuf::from) else {
            self.respond_error(
                request.seq,
                &request.command,
                UNABLE_TO_SET_BREAKPOINTS,
                "Unable to set breakpoints",
                "source path must be specified".to_string(),
            );
            return;
        };

        let shared = self.shared.clone();
        let mut slot = lock(&shared.engine);
        let Some(engine) = slot.as_mut() else {
            self.respond_error(
                request.seq,
                &request.command,
                UNABLE_TO_SET_BREAKPOINTS,
                "Unable to set breakpoints",
                "no debug session active".to_string(),
            );
            return;
        };

        // Replace-all semantics for this source path: every existing
        // non-special breakpoint in the file goes away first.
        let existing = match engine.breakpoints() {
            Ok(existing) => existing,
            Err(e) => {
                self.respond_error(
                    request.seq,
                    &request.command,
                    UNABLE_TO_SET_BREAKPOINTS,
                    "Unable to set breakpoints",
                    format!("{e:#}"),
                );
                return;
            }
        };
        for bp in existing.iter().filter(|bp| bp.id >= 0 && bp.file == path) {
            if let Err(e) = engine.clear_breakpoint(bp.id) {
                self.respond_error(
                    request.seq,
                    &request.command,
                    UNABLE_TO_SET_BREAKPOINTS,
                    "Unable to set breakpoints",
                    format!("{e:#}"),
                );
                return;
            }
        }

        let breakpoints = args
            .breakpoints
            .iter()
            .map(|want| {
                match engine.create_breakpoint(&path, want.line, want.condition.clone()) {
                    // The engine may move a breakpoint to the nearest
                    // breakable line.
                    Ok(installed) => Breakpoint {
                        verified: true,
                        line: installed.line,
                        message: None,
                    },
                    Err(e) => Breakpoint {
                        verified: false,
                        line: want.line,
                        message: Some(format!("{e:#}")),
                    },
                }
            })
            .collect_vec();
        self.respond_ok(
            request.seq,
            &request.command,
            body_of(SetBreakpointsResponseBody { breakpoints }),
        );
    }

    fn on_configuration_done(&mut self, request: &Request) {
        if self.config.stop_on_entry {
            self.send_event(
                "stopped",
                body_of(StoppedEventBody {
                    reason: "entry".to_string(),
                    thread_id: 1,
                    all_threads_stopped: true,
                    text: None,
                }),
            );
        }
        self.respond_ok(request.seq, &request.command, None);
        if !self.config.stop_on_entry {
            self.do_command(EngineCommand::Continue);
        }
    }

    fn on_continue(&mut self, request: &Request) {
        // The engine resumes every thread together.
        self.respond_ok(
            request.seq,
            &request.command,
            body_of(ContinueResponseBody {
                all_threads_continued: true,
            }),
        );
        self.do_command(EngineCommand::Continue);
    }

    fn on_threads(&mut self, request: &Request) {
        let shared = self.shared.clone();
        let mut slot = lock(&shared.engine);
        let Some(engine) = slot.as_mut() else {
            self.respond_error(
                request.seq,
                &request.command,
                UNABLE_TO_DISPLAY_THREADS,
                "Unable to display threads",
                "no debug session active".to_string(),
            );
            return;
        };

        let threads = match engine.threads() {
            Ok(threads) => threads,
            // The debuggee can exit while this request is in flight; a
            // terminated event covers it, an error response would not.
            Err(EngineError::ProcessExit(_)) => vec![],
            Err(e) => {
                self.respond_error(
                    request.seq,
                    &request.command,
                    UNABLE_TO_DISPLAY_THREADS,
                    "Unable to display threads",
                    format!("{e:#}"),
                );
                return;
            }
        };

        let mut threads = threads
            .into_iter()
            .map(|t| Thread {
                id: t.id,
                name: t
                    .function
                    .unwrap_or_else(|| format!("{}@{}", t.file.display(), t.line)),
            })
            .collect_vec();
        if threads.is_empty() && !matches!(engine.state(true), Err(EngineError::ProcessExit(_))) {
            // The protocol requires at least one thread in a live session.
            threads = vec![Thread {
                id: 1,
                name: "Dummy".to_string(),
            }];
        }
        self.respond_ok(
            request.seq,
            &request.command,
            body_of(ThreadsResponseBody { threads }),
        );
    }

    fn on_stack_trace(&mut self, request: &Request) {
        let args: StackTraceArguments = match parse_args(&request.arguments) {
            Ok(args) => args,
            Err(e) => {
                self.respond_error(
                    request.seq,
                    &request.command,
                    UNABLE_TO_PRODUCE_STACK_TRACE,
                    "Unable to produce stack trace",
                    format!("{e:#}"),
                );
                return;
            }
        };

        let shared = self.shared.clone();
        let mut slot = lock(&shared.engine);
        let Some(engine) = slot.as_mut() else {
            self.respond_error(
                request.seq,
                &request.command,
                UNABLE_TO_PRODUCE_STACK_TRACE,
                "Unable to produce stack trace",
                "no debug session active".to_string(),
            );
            return;
        };

        let frames = match engine.stacktrace(args.thread_id, self.config.stack_trace_depth) {
            Ok(frames) => frames,
            Err(e) => {
                self.respond_error(
                    request.seq,
                    &request.command,
                    UNABLE_TO_PRODUCE_STACK_TRACE,
                    "Unable to produce stack trace",
                    format!("{e:#}"),
                );
                return;
            }
        };

        let stack_frames = frames
            .into_iter()
            .enumerate()
            .map(|(frame_index, frame)| {
                let id = self.frames.create(FrameRef {
                    thread_id: args.thread_id,
                    frame_index,
                });
                let name = frame
                    .function
                    .unwrap_or_else(|| format!("{}@{}", frame.file.display(), frame.line));
                // Compiler-generated locations have no source to open.
                let source = if frame.synthetic {
                    None
                } else {
                    Some(Source {
                        name: frame
                            .file
                            .file_name()
                            .map(|name| name.to_string_lossy().to_string()),
                        path: Some(frame.file.to_string_lossy().to_string()),
                    })
                };
                StackFrame {
                    id,
                    name,
                    source,
                    line: frame.line,
                    column: 0,
                }
            })
            .collect_vec();

        // Pagination slices the already-fetched list, it never re-fetches.
        let total_frames = stack_frames.len() as i64;
        let mut stack_frames = stack_frames
            .into_iter()
            .skip(args.start_frame.max(0) as usize)
            .collect_vec();
        if args.levels > 0 {
            stack_frames.truncate(args.levels as usize);
        }
        self.respond_ok(
            request.seq,
            &request.command,
            body_of(StackTraceResponseBody {
                stack_frames,
                total_frames,
            }),
        );
    }

    fn on_scopes(&mut self, request: &Request) {
        let args: ScopesArguments = match parse_args(&request.arguments) {
            Ok(args) => args,
            Err(e) => {
                self.respond_error(
                    request.seq,
                    &request.command,
                    UNABLE_TO_LIST_LOCALS,
                    "Unable to list locals",
                    format!("{e:#}"),
                );
                return;
            }
        };
        let Some(frame) = self.frames.get(args.frame_id).copied() else {
            self.respond_error(
                request.seq,
                &request.command,
                UNABLE_TO_LIST_LOCALS,
                "Unable to list locals",
                format!("unknown frame id {}", args.frame_id),
            );
            return;
        };

        let shared = self.shared.clone();
        let mut slot = lock(&shared.engine);
        let Some(engine) = slot.as_mut() else {
            self.respond_error(
                request.seq,
                &request.command,
                UNABLE_TO_LIST_LOCALS,
                "Unable to list locals",
                "no debug session active".to_string(),
            );
            return;
        };

        let arguments = match engine.function_arguments(frame.thread_id, frame.frame_index) {
            Ok(arguments) => arguments,
            Err(e) => {
                self.respond_error(
                    request.seq,
                    &request.command,
                    UNABLE_TO_LIST_ARGS,
                    "Unable to list args",
                    format!("{e:#}"),
                );
                return;
            }
        };
        let locals = match engine.local_variables(frame.thread_id, frame.frame_index) {
            Ok(locals) => locals,
            Err(e) => {
                self.respond_error(
                    request.seq,
                    &request.command,
                    UNABLE_TO_LIST_LOCALS,
                    "Unable to list locals",
                    format!("{e:#}"),
                );
                return;
            }
        };

        let mut scopes = vec![
            Scope {
                name: "Arguments".to_string(),
                variables_reference: self
                    .values
                    .create(ValueSnapshot::container("Arguments", arguments)),
                expensive: false,
            },
            Scope {
                name: "Locals".to_string(),
                variables_reference: self.values.create(ValueSnapshot::container("Locals", locals)),
                expensive: false,
            },
        ];

        if self.config.show_global_variables {
            let package = match engine.current_package() {
                Ok(package) => package,
                Err(e) => {
                    self.respond_error(
                        request.seq,
                        &request.command,
                        UNABLE_TO_LIST_GLOBALS,
                        "Unable to list globals",
                        format!("{e:#}"),
                    );
                    return;
                }
            };
            let mut globals = match engine.package_variables(&package) {
                Ok(globals) => globals,
                Err(e) => {
                    self.respond_error(
                        request.seq,
                        &request.command,
                        UNABLE_TO_LIST_GLOBALS,
                        "Unable to list globals",
                        format!("{e:#}"),
                    );
                    return;
                }
            };
            // The package prefix is carried once in the scope name instead
            // of repeating on every variable.
            let prefix = format!("{package}.");
            for global in &mut globals {
                if let Some(short) = global.name.strip_prefix(&prefix) {
                    global.name = short.to_string();
                }
            }
            scopes.push(Scope {
                name: format!("Globals (package {package})"),
                variables_reference: self.values.create(ValueSnapshot::container("Globals", globals)),
                expensive: false,
            });
        }

        self.respond_ok(
            request.seq,
            &request.command,
            body_of(ScopesResponseBody { scopes }),
        );
    }

    fn on_variables(&mut self, request: &Request) {
        let args: VariablesArguments = match parse_args(&request.arguments) {
            Ok(args) => args,
            Err(e) => {
                self.respond_error(
                    request.seq,
                    &request.command,
                    UNABLE_TO_LOOKUP_VARIABLE,
                    "Unable to lookup variable",
                    format!("{e:#}"),
                );
                return;
            }
        };
        let Some(snapshot) = self.values.get(args.variables_reference).cloned() else {
            self.respond_error(
                request.seq,
                &request.command,
                UNABLE_TO_LOOKUP_VARIABLE,
                "Unable to lookup variable",
                format!("unknown variables reference {}", args.variables_reference),
            );
            return;
        };
        let variables = children(&mut self.values, &snapshot);
        self.respond_ok(
            request.seq,
            &request.command,
            body_of(VariablesResponseBody { variables }),
        );
    }

    fn on_disconnect(&mut self, request: &Request) {
        self.respond_ok(request.seq, &request.command, None);
        let shared = self.shared.clone();
        let mut slot = lock(&shared.engine);
        if let Some(mut engine) = slot.take() {
            let kill = shared.launched.load(Ordering::SeqCst);
            weak_error!(engine.command(EngineCommand::Halt), "halt on disconnect:");
            weak_error!(engine.detach(kill), "detach on disconnect:");
        }
        drop(slot);
        signal_disconnect(&shared);
    }

    /// Issues an execution command to the engine, blocks until the debuggee
    /// stops or exits and emits the matching event.
    fn do_command(&mut self, command: EngineCommand) {
        let shared = self.shared.clone();
        // The engine leaves its slot while the debuggee runs: an owner-flow
        // stop() must not queue behind a command that may never return.
        let Some(mut engine) = lock(&shared.engine).take() else {
            return;
        };

        log::debug!(target: "dap", "run {command} command");
        let result = engine.command(command);

        if shared.stopped.load(Ordering::SeqCst) {
            // stop() fired mid-command and found the slot empty, so the
            // engine teardown falls to this flow.
            let kill = shared.launched.load(Ordering::SeqCst);
            weak_error!(engine.detach(kill), "detach on stop:");
            return;
        }

        let exited = matches!(result, Err(EngineError::ProcessExit(_)))
            || matches!(result, Ok(state) if state.exited);
        if exited {
            *lock(&shared.engine) = Some(engine);
            self.send_event("terminated", None);
            return;
        }

        // Frames and values the prior handles referenced may be gone now.
        self.frames.reset();
        self.values.reset();

        match result {
            Ok(state) => {
                *lock(&shared.engine) = Some(engine);
                let reason = if command.is_step() { "step" } else { "breakpoint" };
                self.send_event(
                    "stopped",
                    body_of(StoppedEventBody {
                        reason: reason.to_string(),
                        thread_id: state.selected_thread,
                        all_threads_stopped: true,
                        text: None,
                    }),
                );
            }
            Err(e) => {
                log::error!(target: "dap", "runtime error: {e:#}");
                let mut text = format!("{e:#}");
                if text == "bad access" {
                    text = BETTER_BAD_ACCESS_ERROR.to_string();
                }
                // Best effort: the faulting thread id comes from a
                // non-blocking state query.
                let thread_id = weak_error!(engine.state(true))
                    .map(|state| state.current_thread)
                    .unwrap_or(0);
                *lock(&shared.engine) = Some(engine);
                self.send_event(
                    "stopped",
                    body_of(StoppedEventBody {
                        reason: "runtime error".to_string(),
                        thread_id,
                        all_threads_stopped: true,
                        text: Some(text.clone()),
                    }),
                );
                self.send_event(
                    "output",
                    body_of(OutputEventBody {
                        category: "stderr".to_string(),
                        output: format!("ERROR: {text}\n"),
                    }),
                );
            }
        }
    }

    fn respond_ok(&mut self, request_seq: i64, command: &str, body: Option<Value>) {
        let seq = self.next_seq();
        self.send_message(Response {
            seq,
            r#type: "response",
            request_seq,
            success: true,
            command: command.to_string(),
            message: None,
            body,
        });
    }

    fn respond_error(
        &mut self,
        request_seq: i64,
        command: &str,
        id: i64,
        summary: &str,
        details: String,
    ) {
        log::warn!(target: "dap", "{summary}: {details}");
        let seq = self.next_seq();
        self.send_message(Response {
            seq,
            r#type: "response",
            request_seq,
            success: false,
            command: command.to_string(),
            message: Some(summary.to_string()),
            body: Some(error_body(id, &format!("{summary}: {details}"))),
        });
    }

    fn send_internal_error(&mut self, request_seq: i64, command: &str, details: String) {
        self.respond_error(request_seq, command, INTERNAL_ERROR, "Internal Error", details);
    }

    fn send_event(&mut self, event: &'static str, body: Option<Value>) {
        let seq = self.next_seq();
        self.send_message(Event {
            seq,
            r#type: "event",
            event,
            body,
        });
    }

    fn send_message(&mut self, message: impl Serialize) {
        let Some(message) = body_of(message) else {
            return;
        };
        weak_error!(self.transport.write_message(&message), "send DAP message:");
    }

    fn next_seq(&mut self) -> i64 {
        self.seq += 1;
        self.seq
    }
}

fn body_of(body: impl Serialize) -> Option<Value> {
    weak_error!(serde_json::to_value(body))
}

fn parse_args<A: DeserializeOwned + Default>(arguments: &Value) -> anyhow::Result<A> {
    if arguments.is_null() {
        return Ok(A::default());
    }
    Ok(serde_json::from_value(arguments.clone())?)
}

fn panic_text(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

type ArgMap = serde_json::Map<String, Value>;

// Launch attributes come in an untyped map; a present-but-mistyped attribute
// is a launch error, never a silent default.

fn string_arg(args: &ArgMap, key: &str) -> Result<Option<String>, String> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(other) => Err(format!(
            "'{key}' attribute in debug configuration must be a string, got {other}"
        )),
    }
}

fn bool_arg(args: &ArgMap, key: &str) -> Result<Option<bool>, String> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(value)) => Ok(Some(*value)),
        Some(other) => Err(format!(
            "'{key}' attribute in debug configuration must be a boolean, got {other}"
        )),
    }
}

fn positive_int_arg(args: &ArgMap, key: &str) -> Result<Option<usize>, String> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(value)) => match value.as_i64() {
            Some(value) if value > 0 => Ok(Some(value as usize)),
            _ => Err(format!(
                "'{key}' attribute in debug configuration must be a positive number, got {value}"
            )),
        },
        Some(other) => Err(format!(
            "'{key}' attribute in debug configuration must be a positive number, got {other}"
        )),
    }
}

fn string_array_arg(args: &ArgMap, key: &str) -> Result<Option<Vec<String>>, String> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(values)) => values
            .iter()
            .map(|value| match value {
                Value::String(value) => Ok(value.clone()),
                other => Err(format!(
                    "'{key}' attribute in debug configuration must be an array of strings, \
got element {other}"
                )),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        Some(other) => Err(format!(
            "'{key}' attribute in debug configuration must be an array of strings, got {other}"
        )),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::{BreakpointInfo, EngineResult, EngineState, FrameInfo, ThreadInfo};
    use crate::value::ValueKind;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::thread;

    // In-memory transport: feeds scripted requests, records everything sent.
    struct ScriptTransport {
        incoming: VecDeque<Value>,
        outgoing: Arc<Mutex<Vec<Value>>>,
    }

    impl DapTransport for ScriptTransport {
        fn read_message(&mut self) -> anyhow::Result<Value> {
            self.incoming
                .pop_front()
                .ok_or_else(|| anyhow::Error::new(ConnectionClosed))
        }

        fn write_message(&mut self, message: &Value) -> anyhow::Result<()> {
            self.outgoing.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    #[derive(Default, Clone)]
    struct EngineLog {
        commands: Arc<Mutex<Vec<EngineCommand>>>,
        detach: Arc<Mutex<Option<bool>>>,
        cleared: Arc<Mutex<Vec<i64>>>,
        created: Arc<Mutex<Vec<(PathBuf, i64, Option<String>)>>>,
    }

    // Blocks command() until released, modeling a long-running debuggee.
    struct CommandGate {
        entered: mpsc::Sender<()>,
        release: mpsc::Receiver<()>,
    }

    struct MockEngine {
        log: EngineLog,
        gate: Option<CommandGate>,
        threads: Vec<ThreadInfo>,
        frames: Vec<FrameInfo>,
        arguments: Vec<ValueSnapshot>,
        locals: Vec<ValueSnapshot>,
        globals: Vec<ValueSnapshot>,
        breakpoints: Vec<BreakpointInfo>,
        next_breakpoint: i64,
        exited: bool,
        fail_commands: bool,
    }

    impl Default for MockEngine {
        fn default() -> Self {
            MockEngine {
                log: EngineLog::default(),
                gate: None,
                threads: vec![ThreadInfo {
                    id: 1,
                    function: Some("main.main".to_string()),
                    file: PathBuf::from("/src/main.go"),
                    line: 10,
                }],
                frames: vec![FrameInfo {
                    function: Some("main.main".to_string()),
                    file: PathBuf::from("/src/main.go"),
                    line: 10,
                    synthetic: false,
                }],
                arguments: vec![],
                locals: vec![],
                globals: vec![],
                breakpoints: vec![],
                next_breakpoint: 100,
                exited: false,
                fail_commands: false,
            }
        }
    }

    impl Engine for MockEngine {
        fn command(&mut self, command: EngineCommand) -> EngineResult<EngineState> {
            self.log.commands.lock().unwrap().push(command);
            if let Some(gate) = &self.gate {
                let _ = gate.entered.send(());
                let _ = gate.release.recv();
            }
            if self.exited {
                return Err(EngineError::ProcessExit(0));
            }
            if self.fail_commands {
                return Err(EngineError::Backend(anyhow::anyhow!("bad access")));
            }
            Ok(EngineState {
                selected_thread: 1,
                current_thread: 1,
                ..Default::default()
            })
        }

        fn state(&mut self, _nowait: bool) -> EngineResult<EngineState> {
            if self.exited {
                return Err(EngineError::ProcessExit(0));
            }
            Ok(EngineState {
                selected_thread: 1,
                current_thread: 1,
                ..Default::default()
            })
        }

        fn threads(&mut self) -> EngineResult<Vec<ThreadInfo>> {
            if self.exited {
                return Err(EngineError::ProcessExit(0));
            }
            Ok(self.threads.clone())
        }

        fn stacktrace(&mut self, thread_id: i64, _depth: usize) -> EngineResult<Vec<FrameInfo>> {
            if thread_id == 13 {
                panic!("mock frame fault");
            }
            if !self.threads.iter().any(|t| t.id == thread_id) {
                return Err(EngineError::ThreadNotFound(thread_id));
            }
            Ok(self.frames.clone())
        }

        fn function_arguments(
            &mut self,
            _thread_id: i64,
            _frame: usize,
        ) -> EngineResult<Vec<ValueSnapshot>> {
            Ok(self.arguments.clone())
        }

        fn local_variables(
            &mut self,
            _thread_id: i64,
            _frame: usize,
        ) -> EngineResult<Vec<ValueSnapshot>> {
            Ok(self.locals.clone())
        }

        fn package_variables(&mut self, _package: &str) -> EngineResult<Vec<ValueSnapshot>> {
            Ok(self.globals.clone())
        }

        fn current_package(&mut self) -> EngineResult<String> {
            Ok("main".to_string())
        }

        fn breakpoints(&mut self) -> EngineResult<Vec<BreakpointInfo>> {
            Ok(self.breakpoints.clone())
        }

        fn create_breakpoint(
            &mut self,
            file: &Path,
            line: i64,
            condition: Option<String>,
        ) -> EngineResult<BreakpointInfo> {
            if line == 999 {
                return Err(EngineError::Backend(anyhow::anyhow!("no source line 999")));
            }
            self.log
                .created
                .lock()
                .unwrap()
                .push((file.to_path_buf(), line, condition.clone()));
            let bp = BreakpointInfo {
                id: self.next_breakpoint,
                file: file.to_path_buf(),
                line,
                condition,
            };
            self.next_breakpoint += 1;
            self.breakpoints.push(bp.clone());
            Ok(bp)
        }

        fn clear_breakpoint(&mut self, id: i64) -> EngineResult<()> {
            let Some(pos) = self.breakpoints.iter().position(|bp| bp.id == id) else {
                return Err(EngineError::BreakpointNotFound(id));
            };
            self.breakpoints.remove(pos);
            self.log.cleared.lock().unwrap().push(id);
            Ok(())
        }

        fn detach(&mut self, kill: bool) -> EngineResult<()> {
            *self.log.detach.lock().unwrap() = Some(kill);
            Ok(())
        }
    }

    struct MockFactory {
        engine: Mutex<Option<MockEngine>>,
        launches: Arc<Mutex<Vec<(PathBuf, Vec<String>)>>>,
    }

    impl MockFactory {
        fn new(engine: MockEngine) -> Self {
            MockFactory {
                engine: Mutex::new(Some(engine)),
                launches: Arc::default(),
            }
        }
    }

    impl EngineFactory for MockFactory {
        fn launch(
            &self,
            program: &Path,
            args: &[String],
        ) -> EngineResult<Box<dyn Engine + Send>> {
            self.launches
                .lock()
                .unwrap()
                .push((program.to_path_buf(), args.to_vec()));
            match self.engine.lock().unwrap().take() {
                Some(engine) => Ok(Box::new(engine)),
                None => Err(EngineError::Backend(anyhow::anyhow!(
                    "could not launch process"
                ))),
            }
        }
    }

    #[derive(Default)]
    struct MockBuild {
        calls: Arc<Mutex<Vec<String>>>,
        fail_with: Option<String>,
        removed: Arc<Mutex<Vec<PathBuf>>>,
    }

    impl BuildService for MockBuild {
        fn build(&self, _output: &Path, program: &Path, _flags: &str) -> anyhow::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("build {}", program.display()));
            match &self.fail_with {
                Some(text) => Err(anyhow::anyhow!("{text}")),
                None => Ok(()),
            }
        }

        fn test_build(&self, _output: &Path, program: &Path, _flags: &str) -> anyhow::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("test {}", program.display()));
            match &self.fail_with {
                Some(text) => Err(anyhow::anyhow!("{text}")),
                None => Ok(()),
            }
        }

        fn remove(&self, path: &Path) {
            self.removed.lock().unwrap().push(path.to_path_buf());
        }
    }

    struct Fixture {
        factory: MockFactory,
        build: MockBuild,
        engine_log: EngineLog,
        shared: Arc<Shared>,
        disconnected: Mutex<mpsc::Receiver<()>>,
        outgoing: Arc<Mutex<Vec<Value>>>,
    }

    impl Fixture {
        fn new(engine: MockEngine) -> Self {
            let (tx, rx) = mpsc::channel();
            Fixture {
                engine_log: engine.log.clone(),
                factory: MockFactory::new(engine),
                build: MockBuild::default(),
                shared: Shared::new(tx),
                disconnected: Mutex::new(rx),
                outgoing: Arc::default(),
            }
        }

        fn run(&self, requests: Vec<Value>) -> Vec<Value> {
            let transport = ScriptTransport {
                incoming: requests.into(),
                outgoing: self.outgoing.clone(),
            };
            let mut session =
                Session::new(transport, self.shared.clone(), &self.factory, &self.build);
            session.serve();
            self.outgoing.lock().unwrap().clone()
        }
    }

    fn req(seq: i64, command: &str, arguments: Value) -> Value {
        json!({"seq": seq, "type": "request", "command": command, "arguments": arguments})
    }

    fn launch_req(seq: i64) -> Value {
        req(seq, "launch", json!({"program": "/bin/prog", "mode": "exec"}))
    }

    fn response<'a>(messages: &'a [Value], command: &str) -> &'a Value {
        messages
            .iter()
            .find(|m| m["type"] == "response" && m["command"] == command)
            .unwrap_or_else(|| panic!("no response for {command}: {messages:?}"))
    }

    fn event<'a>(messages: &'a [Value], name: &str) -> &'a Value {
        messages
            .iter()
            .find(|m| m["type"] == "event" && m["event"] == name)
            .unwrap_or_else(|| panic!("no {name} event: {messages:?}"))
    }

    fn position(messages: &[Value], pred: impl Fn(&Value) -> bool) -> usize {
        messages.iter().position(pred).unwrap()
    }

    #[test]
    fn test_initialize_reports_capabilities() {
        let fx = Fixture::new(MockEngine::default());
        let out = fx.run(vec![req(1, "initialize", json!({}))]);
        let resp = response(&out, "initialize");
        assert_eq!(resp["success"], json!(true));
        assert_eq!(resp["request_seq"], json!(1));
        assert_eq!(resp["body"]["supportsConfigurationDoneRequest"], json!(true));
        assert_eq!(resp["body"]["supportsConditionalBreakpoints"], json!(true));
        assert_eq!(resp["body"]["supportsSetVariable"], json!(false));
    }

    #[test]
    fn test_launch_requires_program() {
        let fx = Fixture::new(MockEngine::default());
        let out = fx.run(vec![req(1, "launch", json!({"mode": "exec"}))]);
        let resp = response(&out, "launch");
        assert_eq!(resp["success"], json!(false));
        assert_eq!(resp["body"]["error"]["id"], json!(FAILED_TO_LAUNCH));
        assert!(fx.factory.launches.lock().unwrap().is_empty());
    }

    #[test]
    fn test_launch_rejects_unknown_mode_before_build() {
        let fx = Fixture::new(MockEngine::default());
        let out = fx.run(vec![req(
            1,
            "launch",
            json!({"program": "/bin/prog", "mode": "remote"}),
        )]);
        let resp = response(&out, "launch");
        assert_eq!(resp["body"]["error"]["id"], json!(FAILED_TO_LAUNCH));
        assert!(resp["body"]["error"]["format"]
            .as_str()
            .unwrap()
            .contains("'mode'"));
        assert!(fx.build.calls.lock().unwrap().is_empty());
        assert!(fx.factory.launches.lock().unwrap().is_empty());
    }

    #[test]
    fn test_launch_rejects_ill_typed_attribute() {
        let fx = Fixture::new(MockEngine::default());
        let out = fx.run(vec![req(
            1,
            "launch",
            json!({"program": "/bin/prog", "mode": "exec", "stopOnEntry": "yes"}),
        )]);
        let resp = response(&out, "launch");
        assert_eq!(resp["success"], json!(false));
        assert_eq!(resp["body"]["error"]["id"], json!(FAILED_TO_LAUNCH));
        assert!(resp["body"]["error"]["format"]
            .as_str()
            .unwrap()
            .contains("stopOnEntry"));
    }

    #[test]
    fn test_failed_launch_leaves_config_untouched() {
        let fx = Fixture::new(MockEngine::default());
        let out = fx.run(vec![
            req(
                1,
                "launch",
                json!({
                    "program": "/bin/prog",
                    "mode": "exec",
                    "stopOnEntry": true,
                    "stackTraceDepth": "deep",
                }),
            ),
            launch_req(2),
            req(3, "configurationDone", json!({})),
        ]);
        let failed = response(&out, "launch");
        assert_eq!(failed["success"], json!(false));
        assert_eq!(failed["body"]["error"]["id"], json!(FAILED_TO_LAUNCH));
        let retried = out
            .iter()
            .filter(|m| m["command"] == "launch")
            .nth(1)
            .unwrap();
        assert_eq!(retried["success"], json!(true));
        // The rejected launch left no attribute applied: configurationDone
        // resumes the debuggee instead of stopping on entry.
        assert_eq!(
            *fx.engine_log.commands.lock().unwrap(),
            vec![EngineCommand::Continue]
        );
        assert_eq!(event(&out, "stopped")["body"]["reason"], json!("breakpoint"));
    }

    #[test]
    fn test_launch_test_mode_uses_test_build() {
        let fx = Fixture::new(MockEngine::default());
        let out = fx.run(vec![req(
            1,
            "launch",
            json!({"program": "/src/pkg", "mode": "test"}),
        )]);
        assert_eq!(response(&out, "launch")["success"], json!(true));
        assert_eq!(*fx.build.calls.lock().unwrap(), vec!["test /src/pkg"]);
        // The launched program is the built artifact, not the source path.
        let launches = fx.factory.launches.lock().unwrap();
        assert_eq!(launches[0].0, PathBuf::from(DEBUG_BINARY));
    }

    #[test]
    fn test_build_failure_embeds_error_text() {
        let mut fx = Fixture::new(MockEngine::default());
        fx.build.fail_with = Some("syntax error in main.go:4".to_string());
        let out = fx.run(vec![req(
            1,
            "launch",
            json!({"program": "/src/pkg", "mode": "debug"}),
        )]);
        let resp = response(&out, "launch");
        assert_eq!(resp["body"]["error"]["id"], json!(FAILED_TO_LAUNCH));
        assert!(resp["body"]["error"]["format"]
            .as_str()
            .unwrap()
            .contains("syntax error in main.go:4"));
        assert!(fx.factory.launches.lock().unwrap().is_empty());
    }

    #[test]
    fn test_exec_mode_skips_build_and_orders_initialized_event_first() {
        let fx = Fixture::new(MockEngine::default());
        let out = fx.run(vec![req(1, "initialize", json!({})), launch_req(2)]);
        assert!(fx.build.calls.lock().unwrap().is_empty());
        let ev = position(&out, |m| m["event"] == "initialized");
        let resp = position(&out, |m| m["command"] == "launch");
        assert!(ev < resp);
        assert_eq!(response(&out, "launch")["success"], json!(true));
    }

    #[test]
    fn test_configuration_done_stops_on_entry_before_response() {
        let fx = Fixture::new(MockEngine::default());
        let out = fx.run(vec![
            req(
                1,
                "launch",
                json!({"program": "/bin/prog", "mode": "exec", "stopOnEntry": true}),
            ),
            req(2, "configurationDone", json!({})),
        ]);
        let stopped = event(&out, "stopped");
        assert_eq!(stopped["body"]["reason"], json!("entry"));
        assert_eq!(stopped["body"]["allThreadsStopped"], json!(true));
        let ev = position(&out, |m| m["event"] == "stopped");
        let resp = position(&out, |m| m["command"] == "configurationDone");
        assert!(ev < resp);
        // The debuggee was not resumed.
        assert!(fx.engine_log.commands.lock().unwrap().is_empty());
    }

    #[test]
    fn test_configuration_done_resumes_without_stop_on_entry() {
        let fx = Fixture::new(MockEngine::default());
        let out = fx.run(vec![
            launch_req(1),
            req(2, "configurationDone", json!({})),
        ]);
        assert_eq!(response(&out, "configurationDone")["success"], json!(true));
        assert_eq!(
            *fx.engine_log.commands.lock().unwrap(),
            vec![EngineCommand::Continue]
        );
        assert_eq!(event(&out, "stopped")["body"]["reason"], json!("breakpoint"));
    }

    #[test]
    fn test_continue_acknowledges_all_threads() {
        let fx = Fixture::new(MockEngine::default());
        let out = fx.run(vec![launch_req(1), req(2, "continue", json!({"threadId": 1}))]);
        let resp = response(&out, "continue");
        assert_eq!(resp["body"]["allThreadsContinued"], json!(true));
        let resp_at = position(&out, |m| m["command"] == "continue");
        let stop_at = position(&out, |m| m["event"] == "stopped");
        assert!(resp_at < stop_at);
    }

    #[test]
    fn test_step_stops_with_step_reason() {
        let fx = Fixture::new(MockEngine::default());
        let out = fx.run(vec![launch_req(1), req(2, "next", json!({"threadId": 1}))]);
        assert_eq!(response(&out, "next")["success"], json!(true));
        assert_eq!(
            *fx.engine_log.commands.lock().unwrap(),
            vec![EngineCommand::Next]
        );
        assert_eq!(event(&out, "stopped")["body"]["reason"], json!("step"));
    }

    #[test]
    fn test_exit_during_command_terminates() {
        let mut engine = MockEngine::default();
        engine.exited = true;
        let fx = Fixture::new(engine);
        let out = fx.run(vec![launch_req(1), req(2, "continue", json!({}))]);
        event(&out, "terminated");
        assert!(out.iter().all(|m| m["event"] != "stopped"));
    }

    #[test]
    fn test_runtime_error_stop_rewrites_bad_access() {
        let mut engine = MockEngine::default();
        engine.fail_commands = true;
        let fx = Fixture::new(engine);
        let out = fx.run(vec![launch_req(1), req(2, "continue", json!({}))]);
        let stopped = event(&out, "stopped");
        assert_eq!(stopped["body"]["reason"], json!("runtime error"));
        assert_eq!(stopped["body"]["text"], json!(BETTER_BAD_ACCESS_ERROR));
        assert_eq!(stopped["body"]["threadId"], json!(1));
        let output = event(&out, "output");
        assert_eq!(output["body"]["category"], json!("stderr"));
        assert!(output["body"]["output"]
            .as_str()
            .unwrap()
            .starts_with("ERROR: "));
    }

    #[test]
    fn test_engine_slot_is_free_while_command_runs() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let mut engine = MockEngine::default();
        engine.gate = Some(CommandGate {
            entered: entered_tx,
            release: release_rx,
        });
        let fx = Fixture::new(engine);
        thread::scope(|s| {
            let serve = s.spawn(|| fx.run(vec![launch_req(1), req(2, "continue", json!({}))]));
            entered_rx.recv().unwrap();
            // A running command must not hold the engine slot hostage.
            let slot = fx.shared.engine.try_lock().unwrap();
            assert!(slot.is_none());
            drop(slot);
            release_tx.send(()).unwrap();
            let out = serve.join().unwrap();
            assert_eq!(event(&out, "stopped")["body"]["reason"], json!("breakpoint"));
        });
        // The engine returned to its slot after the stop.
        assert!(lock(&fx.shared.engine).is_some());
    }

    #[test]
    fn test_stop_during_command_hands_teardown_to_serve_flow() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let mut engine = MockEngine::default();
        engine.gate = Some(CommandGate {
            entered: entered_tx,
            release: release_rx,
        });
        let fx = Fixture::new(engine);
        thread::scope(|s| {
            let serve = s.spawn(|| fx.run(vec![launch_req(1), req(2, "continue", json!({}))]));
            entered_rx.recv().unwrap();
            // Owner-flow stop while the command is in flight finds the slot
            // empty; the serve flow detaches when the command returns.
            fx.shared.stopped.store(true, Ordering::SeqCst);
            release_tx.send(()).unwrap();
            let out = serve.join().unwrap();
            assert!(out.iter().all(|m| m["event"] != "stopped"));
        });
        assert_eq!(*fx.engine_log.detach.lock().unwrap(), Some(true));
        assert!(lock(&fx.shared.engine).is_none());
    }

    #[test]
    fn test_threads_without_engine_is_an_error() {
        let fx = Fixture::new(MockEngine::default());
        let out = fx.run(vec![req(1, "threads", json!({}))]);
        let resp = response(&out, "threads");
        assert_eq!(resp["success"], json!(false));
        assert_eq!(resp["body"]["error"]["id"], json!(UNABLE_TO_DISPLAY_THREADS));
    }

    #[test]
    fn test_threads_placeholder_when_engine_reports_none() {
        let mut engine = MockEngine::default();
        engine.threads = vec![];
        let fx = Fixture::new(engine);
        let out = fx.run(vec![launch_req(1), req(2, "threads", json!({}))]);
        let resp = response(&out, "threads");
        assert_eq!(resp["body"]["threads"], json!([{"id": 1, "name": "Dummy"}]));
    }

    #[test]
    fn test_threads_after_exit_is_empty_not_an_error() {
        let mut engine = MockEngine::default();
        engine.exited = true;
        let fx = Fixture::new(engine);
        let out = fx.run(vec![launch_req(1), req(2, "threads", json!({}))]);
        let resp = response(&out, "threads");
        assert_eq!(resp["success"], json!(true));
        assert_eq!(resp["body"]["threads"], json!([]));
    }

    #[test]
    fn test_stack_trace_unknown_thread_is_an_error() {
        let fx = Fixture::new(MockEngine::default());
        let out = fx.run(vec![
            launch_req(1),
            req(2, "stackTrace", json!({"threadId": 7})),
        ]);
        let resp = response(&out, "stackTrace");
        assert_eq!(resp["success"], json!(false));
        assert_eq!(
            resp["body"]["error"]["id"],
            json!(UNABLE_TO_PRODUCE_STACK_TRACE)
        );
    }

    #[test]
    fn test_set_breakpoints_replaces_per_path() {
        let mut engine = MockEngine::default();
        engine.breakpoints = vec![
            // Special breakpoints survive replacement.
            BreakpointInfo {
                id: -1,
                file: PathBuf::from("/src/main.go"),
                line: 1,
                condition: None,
            },
            BreakpointInfo {
                id: 50,
                file: PathBuf::from("/src/main.go"),
                line: 5,
                condition: None,
            },
            BreakpointInfo {
                id: 51,
                file: PathBuf::from("/src/other.go"),
                line: 5,
                condition: None,
            },
        ];
        let fx = Fixture::new(engine);
        let out = fx.run(vec![
            launch_req(1),
            req(
                2,
                "setBreakpoints",
                json!({
                    "source": {"path": "/src/main.go"},
                    "breakpoints": [
                        {"line": 12, "condition": "i > 3"},
                        {"line": 999},
                    ],
                }),
            ),
        ]);
        assert_eq!(*fx.engine_log.cleared.lock().unwrap(), vec![50]);
        assert_eq!(
            *fx.engine_log.created.lock().unwrap(),
            vec![(PathBuf::from("/src/main.go"), 12, Some("i > 3".to_string()))]
        );
        let bps = &response(&out, "setBreakpoints")["body"]["breakpoints"];
        assert_eq!(bps[0]["verified"], json!(true));
        assert_eq!(bps[0]["line"], json!(12));
        assert_eq!(bps[1]["verified"], json!(false));
        assert_eq!(bps[1]["line"], json!(999));
        assert!(bps[1]["message"].as_str().unwrap().contains("no source line"));
    }

    #[test]
    fn test_scopes_and_variables_flow() {
        let mut engine = MockEngine::default();
        engine.arguments = vec![ValueSnapshot {
            name: "argc".to_string(),
            value: "2".to_string(),
            ..Default::default()
        }];
        engine.locals = vec![
            ValueSnapshot {
                name: "i".to_string(),
                value: "42".to_string(),
                ..Default::default()
            },
            ValueSnapshot {
                name: "point".to_string(),
                kind: ValueKind::Struct,
                type_name: "main.Point".to_string(),
                children: vec![ValueSnapshot {
                    name: "x".to_string(),
                    value: "1".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
        ];
        engine.globals = vec![ValueSnapshot {
            name: "main.version".to_string(),
            value: "\"1.0\"".to_string(),
            kind: ValueKind::String,
            len: 5,
            ..Default::default()
        }];
        let fx = Fixture::new(engine);
        // Handle numbering is deterministic: the single stack frame gets
        // frame id 1, the scopes get value references 1..=3 in order.
        let out = fx.run(vec![
            req(
                1,
                "launch",
                json!({"program": "/bin/prog", "mode": "exec", "showGlobalVariables": true}),
            ),
            req(2, "stackTrace", json!({"threadId": 1})),
            req(3, "scopes", json!({"frameId": 1})),
            req(4, "variables", json!({"variablesReference": 2})),
            req(5, "variables", json!({"variablesReference": 3})),
        ]);

        let frame = &response(&out, "stackTrace")["body"]["stackFrames"][0];
        assert_eq!(frame["name"], json!("main.main"));
        assert_eq!(frame["source"]["name"], json!("main.go"));
        assert_eq!(frame["id"], json!(1));

        let scopes = &response(&out, "scopes")["body"]["scopes"];
        assert_eq!(scopes[0]["name"], json!("Arguments"));
        assert_eq!(scopes[1]["name"], json!("Locals"));
        assert_eq!(scopes[2]["name"], json!("Globals (package main)"));
        assert_eq!(scopes[1]["variablesReference"], json!(2));
        assert_eq!(scopes[2]["variablesReference"], json!(3));

        let locals = &response(&out, "variables")["body"]["variables"];
        assert_eq!(locals[0]["name"], json!("i"));
        assert_eq!(locals[0]["value"], json!("42"));
        assert_eq!(locals[0]["variablesReference"], json!(0));
        assert_eq!(locals[1]["name"], json!("point"));
        assert_eq!(locals[1]["value"], json!("<main.Point>"));
        assert!(locals[1]["variablesReference"].as_i64().unwrap() > 0);

        // Package prefix was stripped from the global's name.
        let globals = out
            .iter()
            .filter(|m| m["command"] == "variables")
            .nth(1)
            .unwrap();
        assert_eq!(globals["body"]["variables"][0]["name"], json!("version"));
    }

    #[test]
    fn test_handles_invalidated_on_resume() {
        let fx = Fixture::new(MockEngine::default());
        let out = fx.run(vec![
            launch_req(1),
            req(2, "stackTrace", json!({"threadId": 1})),
            req(3, "scopes", json!({"frameId": 1})),
            req(4, "next", json!({"threadId": 1})),
            req(5, "variables", json!({"variablesReference": 1})),
            req(6, "scopes", json!({"frameId": 1})),
        ]);
        let vars = response(&out, "variables");
        assert_eq!(vars["success"], json!(false));
        assert_eq!(vars["body"]["error"]["id"], json!(UNABLE_TO_LOOKUP_VARIABLE));
        let stale_scopes = out
            .iter()
            .filter(|m| m["command"] == "scopes")
            .nth(1)
            .unwrap();
        assert_eq!(stale_scopes["success"], json!(false));
        assert_eq!(
            stale_scopes["body"]["error"]["id"],
            json!(UNABLE_TO_LIST_LOCALS)
        );
    }

    #[test]
    fn test_disconnect_detaches_and_signals() {
        let fx = Fixture::new(MockEngine::default());
        let out = fx.run(vec![
            launch_req(1),
            req(2, "disconnect", json!({})),
            // Never processed: the session ends on disconnect.
            req(3, "threads", json!({})),
        ]);
        assert_eq!(response(&out, "disconnect")["success"], json!(true));
        assert!(out.iter().all(|m| m["command"] != "threads"));
        // Launched debuggee gets killed on detach.
        assert_eq!(*fx.engine_log.detach.lock().unwrap(), Some(true));
        assert_eq!(
            *fx.engine_log.commands.lock().unwrap(),
            vec![EngineCommand::Halt]
        );
        assert!(fx.disconnected.lock().unwrap().try_recv().is_ok());
        assert!(fx.disconnected.lock().unwrap().try_recv().is_err());
    }

    #[test]
    fn test_unsupported_and_unimplemented_commands() {
        let fx = Fixture::new(MockEngine::default());
        let out = fx.run(vec![
            req(1, "completions", json!({})),
            req(2, "evaluate", json!({"expression": "1+1"})),
            req(3, "fuzzBall", json!({})),
        ]);
        assert_eq!(
            response(&out, "completions")["body"]["error"]["id"],
            json!(UNSUPPORTED_COMMAND)
        );
        assert_eq!(
            response(&out, "evaluate")["body"]["error"]["id"],
            json!(NOT_YET_IMPLEMENTED)
        );
        assert_eq!(
            response(&out, "fuzzBall")["body"]["error"]["id"],
            json!(INTERNAL_ERROR)
        );
    }

    #[test]
    fn test_handler_panic_yields_internal_error_and_loop_survives() {
        let fx = Fixture::new(MockEngine::default());
        let out = fx.run(vec![
            launch_req(1),
            // Thread id 13 makes the mock engine panic.
            req(2, "stackTrace", json!({"threadId": 13})),
            req(3, "threads", json!({})),
        ]);
        let resp = response(&out, "stackTrace");
        assert_eq!(resp["success"], json!(false));
        assert_eq!(resp["body"]["error"]["id"], json!(INTERNAL_ERROR));
        assert_eq!(resp["request_seq"], json!(2));
        // The session kept serving after the fault.
        assert_eq!(response(&out, "threads")["success"], json!(true));
    }

    #[test]
    fn test_outgoing_messages_are_sequenced_from_one() {
        let fx = Fixture::new(MockEngine::default());
        let out = fx.run(vec![req(5, "initialize", json!({})), launch_req(9)]);
        let seqs = out.iter().map(|m| m["seq"].as_i64().unwrap()).collect_vec();
        assert_eq!(seqs, (1..=out.len() as i64).collect_vec());
    }
}
