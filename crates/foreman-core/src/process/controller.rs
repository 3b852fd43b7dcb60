use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use foreman_protocol::ProgressKind;
use foreman_protocol::stream::StreamMessage;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{oneshot, watch};

use crate::cancellation::{CancellationToken, Registration};
use crate::error::{ForemanError, Result};
use crate::stream::{ListenerId, ParserEvent, ParserEventKind, StreamParser};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// How long to keep draining stdout/stderr after the process exited.
/// Grandchildren can hold the pipes open indefinitely.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub program: String,
    /// Inserted before the generated flags
    pub extra_args: Vec<String>,
    pub system_prompt: Option<String>,
    pub max_turns: u32,
    pub allowed_tools: Option<Vec<String>>,
    pub working_directory: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub timeout: Duration,
    pub grace_period: Duration,
    /// Keep stdin open for follow-up messages. The one-shot `--print`
    /// invocation waits for EOF before it starts, so this defaults to false.
    pub keep_stdin_open: bool,
    pub cancellation: Option<CancellationToken>,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            extra_args: Vec::new(),
            system_prompt: None,
            max_turns: 10,
            allowed_tools: None,
            working_directory: None,
            env: HashMap::new(),
            timeout: DEFAULT_TIMEOUT,
            grace_period: DEFAULT_GRACE_PERIOD,
            keep_stdin_open: false,
            cancellation: None,
        }
    }
}

impl ControllerOptions {
    /// Command-line arguments for a first message.
    pub fn build_args(&self, message: &str) -> Vec<String> {
        let mut args = self.extra_args.clone();
        args.extend([
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ]);
        if let Some(prompt) = self.system_prompt.as_ref().filter(|p| !p.is_empty()) {
            args.push("--system-prompt".to_string());
            args.push(prompt.clone());
        }
        args.push("--max-turns".to_string());
        args.push(self.max_turns.to_string());
        if let Some(tools) = self.allowed_tools.as_ref().filter(|t| !t.is_empty()) {
            args.push("--allowedTools".to_string());
            args.push(tools.join(","));
        }
        args.push(message.to_string());
        args
    }
}

/// Simplified progress derived from parsed stream messages.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerProgress {
    pub kind: ProgressKind,
    pub message: String,
    pub tool_name: Option<String>,
    pub current_turn: u32,
    pub max_turns: u32,
    pub percent: u8,
}

/// Why the controller stopped the process, if it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    Timeout,
    Cancelled,
}

type ExitCallback = Box<dyn FnOnce(i32) + Send>;
type StderrCallback = Arc<dyn Fn(&str) + Send + Sync>;
type ProgressCallback = Arc<dyn Fn(&ControllerProgress) + Send + Sync>;
type MessageCallback = Arc<dyn Fn(&StreamMessage) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_exit: Vec<ExitCallback>,
    on_stderr: Vec<StderrCallback>,
    on_progress: Vec<ProgressCallback>,
    on_message: Vec<MessageCallback>,
}

#[derive(Default)]
struct ProcState {
    started: bool,
    stdin: Option<ChildStdin>,
}

struct Inner {
    options: ControllerOptions,
    state: tokio::sync::Mutex<ProcState>,
    pid: Mutex<Option<u32>>,
    running: AtomicBool,
    stopping: AtomicBool,
    exit_tx: watch::Sender<Option<i32>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    parser: Mutex<StreamParser>,
    callbacks: Mutex<Callbacks>,
    stderr: Mutex<String>,
    current_turn: AtomicU32,
    stop_reason: Mutex<Option<StopReason>>,
    cancel_registration: Mutex<Option<Registration>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Owns one assistant process for one execution.
///
/// The first [`send`](Self::send) spawns the process with the message as its
/// final argument; stdout is decoded by a [`StreamParser`], stderr is
/// collected and forwarded. The controller is single-use: once the process
/// has exited it cannot be restarted.
#[derive(Clone)]
pub struct SubprocessController {
    inner: Arc<Inner>,
}

impl SubprocessController {
    pub fn new(options: ControllerOptions) -> Self {
        let (exit_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                options,
                state: tokio::sync::Mutex::new(ProcState::default()),
                pid: Mutex::new(None),
                running: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                exit_tx,
                kill_tx: Mutex::new(None),
                parser: Mutex::new(StreamParser::new()),
                callbacks: Mutex::new(Callbacks::default()),
                stderr: Mutex::new(String::new()),
                current_turn: AtomicU32::new(0),
                stop_reason: Mutex::new(None),
                cancel_registration: Mutex::new(None),
            }),
        }
    }

    pub fn options(&self) -> &ControllerOptions {
        &self.inner.options
    }

    /// Start the process with `message`, or write it to the running
    /// process's stdin.
    pub async fn send(&self, message: &str) -> Result<()> {
        let mut state = self.inner.state.lock().await;

        if !state.started {
            state.started = true;
            return self.start(&mut state, message).await;
        }

        if !self.is_running() {
            return Err(ForemanError::ProcessNotRunning);
        }
        let stdin = state.stdin.as_mut().ok_or(ForemanError::StdinClosed)?;
        stdin.write_all(message.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        tracing::debug!(pid = ?self.pid(), input_len = message.len(), "message written to stdin");
        Ok(())
    }

    async fn start(&self, state: &mut ProcState, message: &str) -> Result<()> {
        let options = &self.inner.options;
        let args = options.build_args(message);

        let mut command = Command::new(&options.program);
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &options.working_directory {
            command.current_dir(dir);
        }
        for (key, value) in &options.env {
            command.env(key, value);
        }

        tracing::debug!(
            program = %options.program,
            workdir = ?options.working_directory,
            max_turns = options.max_turns,
            "spawning assistant process"
        );

        let mut child = match command.spawn() {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, program = %options.program, "failed to spawn assistant process");
                Self::finish(&self.inner, -1);
                return Err(e.into());
            }
        };
        let pid = child.id();
        *lock(&self.inner.pid) = pid;
        self.inner.running.store(true, Ordering::SeqCst);
        tracing::info!(pid = ?pid, program = %options.program, "assistant process spawned");

        let stdin = child.stdin.take();
        state.stdin = if options.keep_stdin_open {
            stdin
        } else {
            // Dropping stdin sends EOF
            None
        };

        let stdout_task = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(Self::read_stdout(self.inner.clone(), stdout)));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(Self::read_stderr(self.inner.clone(), stderr)));

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        *lock(&self.inner.kill_tx) = Some(kill_tx);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    tracing::debug!(pid = ?pid, "force-killing assistant process");
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            for task in [stdout_task, stderr_task].into_iter().flatten() {
                if tokio::time::timeout(READER_DRAIN_TIMEOUT, task).await.is_err() {
                    tracing::warn!(pid = ?pid, "output reader did not finish after exit");
                }
            }

            let code = match &status {
                Ok(s) => s.code().unwrap_or(0),
                Err(e) => {
                    tracing::error!(pid = ?pid, error = %e, "failed to wait for assistant process");
                    0
                }
            };
            Self::finish(&inner, code);
        });

        self.arm_timeout();
        self.bind_cancellation();
        Ok(())
    }

    fn arm_timeout(&self) {
        let controller = self.clone();
        let timeout = self.inner.options.timeout;
        let mut exit_rx = self.inner.exit_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    if controller.is_running() {
                        tracing::warn!(pid = ?controller.pid(), timeout = ?timeout, "assistant process timed out");
                        controller.set_stop_reason(StopReason::Timeout);
                        controller.stop().await;
                    }
                }
                // The watch::Ref must not live across the stop() await
                _ = async { let _ = exit_rx.wait_for(|code| code.is_some()).await; } => {}
            }
        });
    }

    fn bind_cancellation(&self) {
        let Some(token) = self.inner.options.cancellation.clone() else {
            return;
        };
        let controller = self.clone();
        let handle = tokio::runtime::Handle::current();
        let registration = token.register(move |reason| {
            tracing::info!(pid = ?controller.pid(), reason = ?reason, "cancellation requested, stopping assistant process");
            controller.set_stop_reason(StopReason::Cancelled);
            handle.spawn(async move { controller.stop().await });
        });
        *lock(&self.inner.cancel_registration) = Some(registration);
    }

    fn set_stop_reason(&self, reason: StopReason) {
        let mut current = lock(&self.inner.stop_reason);
        if current.is_none() {
            *current = Some(reason);
        }
    }

    async fn read_stdout<R: AsyncRead + Unpin>(inner: Arc<Inner>, mut reader: R) {
        let mut buf = vec![0u8; 8192];
        let mut carry = Vec::new();
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let text = decode_utf8(&mut carry, &buf[..n]);
                    let messages = lock(&inner.parser).parse(&text);
                    for message in messages {
                        Self::dispatch_message(&inner, &message);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "error reading assistant stdout");
                    break;
                }
            }
        }
        if !carry.is_empty() {
            let tail = String::from_utf8_lossy(&carry).into_owned();
            let messages = lock(&inner.parser).parse(&tail);
            for message in messages {
                Self::dispatch_message(&inner, &message);
            }
        }
        let last = lock(&inner.parser).finish();
        if let Some(message) = last {
            Self::dispatch_message(&inner, &message);
        }
    }

    async fn read_stderr<R: AsyncRead + Unpin>(inner: Arc<Inner>, mut reader: R) {
        let mut buf = vec![0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                    tracing::debug!(len = n, "assistant stderr");
                    lock(&inner.stderr).push_str(&chunk);
                    let callbacks = lock(&inner.callbacks).on_stderr.clone();
                    for callback in callbacks {
                        guarded(|| callback(&chunk));
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "error reading assistant stderr");
                    break;
                }
            }
        }
    }

    fn dispatch_message(inner: &Arc<Inner>, message: &StreamMessage) {
        let (message_callbacks, progress_callbacks) = {
            let callbacks = lock(&inner.callbacks);
            (callbacks.on_message.clone(), callbacks.on_progress.clone())
        };
        for callback in message_callbacks {
            guarded(|| callback(message));
        }

        let max_turns = inner.options.max_turns;
        let Some(progress) = progress_for(message, &inner.current_turn, max_turns) else {
            return;
        };
        for callback in progress_callbacks {
            guarded(|| callback(&progress));
        }
    }

    fn finish(inner: &Arc<Inner>, code: i32) {
        inner.running.store(false, Ordering::SeqCst);
        lock(&inner.kill_tx).take();
        if let Some(registration) = lock(&inner.cancel_registration).take() {
            registration.dispose();
        }
        tracing::info!(pid = ?*lock(&inner.pid), exit_code = code, "assistant process exited");

        inner.exit_tx.send_replace(Some(code));
        let callbacks = {
            let mut callbacks = lock(&inner.callbacks);
            // Nothing is dispatched after exit; release captured state
            callbacks.on_stderr.clear();
            callbacks.on_progress.clear();
            callbacks.on_message.clear();
            std::mem::take(&mut callbacks.on_exit)
        };
        for callback in callbacks {
            guarded(move || callback(code));
        }
    }

    /// Terminate the process: SIGTERM, then SIGKILL after the grace period.
    /// Resolves once the exit has been observed. Idempotent.
    pub async fn stop(&self) {
        let started = self.inner.state.try_lock().map(|s| s.started).unwrap_or(true);
        if !started || self.exit_code().is_some() {
            return;
        }
        self.set_stop_reason(StopReason::Requested);

        if !self.inner.stopping.swap(true, Ordering::SeqCst) {
            let pid = self.pid();
            tracing::debug!(pid = ?pid, "stopping assistant process");

            let signalled = pid.map(send_terminate).unwrap_or(false);
            let exited = signalled
                && tokio::time::timeout(self.inner.options.grace_period, self.wait_exit())
                    .await
                    .is_ok();
            if !exited {
                if let Some(kill_tx) = lock(&self.inner.kill_tx).take() {
                    let _ = kill_tx.send(());
                }
            }
        }

        self.wait_exit().await;
    }

    async fn wait_exit(&self) -> i32 {
        let mut rx = self.inner.exit_tx.subscribe();
        match rx.wait_for(|code| code.is_some()).await {
            Ok(code) => code.unwrap_or(0),
            Err(_) => 0,
        }
    }

    /// Wait for the process to exit and return its exit code.
    pub async fn wait(&self) -> Result<i32> {
        if !self.inner.state.lock().await.started {
            return Err(ForemanError::ProcessNotRunning);
        }
        Ok(self.wait_exit().await)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn pid(&self) -> Option<u32> {
        *lock(&self.inner.pid)
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.inner.exit_tx.borrow()
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        *lock(&self.inner.stop_reason)
    }

    pub fn stderr_output(&self) -> String {
        lock(&self.inner.stderr).clone()
    }

    pub fn text(&self) -> String {
        lock(&self.inner.parser).text().to_string()
    }

    pub fn messages(&self) -> Vec<StreamMessage> {
        lock(&self.inner.parser).messages()
    }

    pub fn current_turn(&self) -> u32 {
        self.inner.current_turn.load(Ordering::SeqCst)
    }

    /// Called once with the exit code; immediately if already exited.
    pub fn on_exit<F>(&self, callback: F)
    where
        F: FnOnce(i32) + Send + 'static,
    {
        let mut callbacks = lock(&self.inner.callbacks);
        if let Some(code) = self.exit_code() {
            drop(callbacks);
            guarded(move || callback(code));
            return;
        }
        callbacks.on_exit.push(Box::new(callback));
    }

    pub fn on_stderr<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        lock(&self.inner.callbacks).on_stderr.push(Arc::new(callback));
    }

    pub fn on_progress<F>(&self, callback: F)
    where
        F: Fn(&ControllerProgress) + Send + Sync + 'static,
    {
        lock(&self.inner.callbacks).on_progress.push(Arc::new(callback));
    }

    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(&StreamMessage) + Send + Sync + 'static,
    {
        lock(&self.inner.callbacks).on_message.push(Arc::new(callback));
    }

    /// Attach a listener directly to the underlying stream parser.
    pub fn on_parser_event<F>(&self, kind: ParserEventKind, callback: F) -> ListenerId
    where
        F: Fn(&ParserEvent) + Send + Sync + 'static,
    {
        lock(&self.inner.parser).on(kind, callback)
    }
}

fn guarded<F: FnOnce()>(f: F) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::error!("controller callback panicked");
    }
}

fn percent(current_turn: u32, max_turns: u32) -> u8 {
    if max_turns == 0 {
        return 0;
    }
    let pct = (100.0 * current_turn as f64 / max_turns as f64).round();
    pct.min(100.0) as u8
}

fn progress_for(
    message: &StreamMessage,
    current_turn: &AtomicU32,
    max_turns: u32,
) -> Option<ControllerProgress> {
    let (kind, text, tool_name) = match message {
        StreamMessage::Assistant(assistant) => {
            current_turn.fetch_add(1, Ordering::SeqCst);
            (ProgressKind::Text, assistant.content.clone(), None)
        }
        StreamMessage::ToolUse(tool_use) => (
            ProgressKind::ToolUse,
            format!("Using tool: {}", tool_use.name),
            Some(tool_use.name.clone()),
        ),
        StreamMessage::ToolResult(result) => {
            let text = if result.is_error {
                format!("Tool failed: {}", result.content_text())
            } else {
                "Tool completed".to_string()
            };
            (ProgressKind::ToolResult, text, None)
        }
        StreamMessage::System(system) => (
            ProgressKind::Status,
            system
                .message
                .clone()
                .or_else(|| system.subtype.clone())
                .unwrap_or_else(|| "system".to_string()),
            None,
        ),
        StreamMessage::Result(result) => (
            ProgressKind::Status,
            if result.success { "Completed" } else { "Failed" }.to_string(),
            None,
        ),
        StreamMessage::Error(error) => (ProgressKind::Status, format!("Error: {}", error.message), None),
        StreamMessage::User(_) => return None,
    };

    let turn = current_turn.load(Ordering::SeqCst);
    Some(ControllerProgress {
        kind,
        message: text,
        tool_name,
        current_turn: turn,
        max_turns,
        percent: percent(turn, max_turns),
    })
}

/// Decode `bytes` as UTF-8, carrying an incomplete trailing sequence over
/// to the next chunk.
fn decode_utf8(carry: &mut Vec<u8>, bytes: &[u8]) -> String {
    carry.extend_from_slice(bytes);
    match std::str::from_utf8(carry) {
        Ok(s) => {
            let out = s.to_string();
            carry.clear();
            out
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let out = String::from_utf8_lossy(&carry[..valid]).into_owned();
            carry.drain(..valid);
            out
        }
        Err(_) => {
            let out = String::from_utf8_lossy(carry).into_owned();
            carry.clear();
            out
        }
    }
}

#[cfg(unix)]
fn send_terminate(pid: u32) -> bool {
    // SAFETY: plain kill(2) on a pid we spawned
    unsafe { libc::kill(pid as i32, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn send_terminate(_pid: u32) -> bool {
    false
}
