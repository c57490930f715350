use std::collections::BTreeMap;
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use th_core::config::TerminalConfig;
use th_telemetry::metrics::{global_metrics, APP_RUN_DURATION_SECONDS, APP_SPAWNS_TOTAL};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::admission::{AdmissionController, AdmissionSlot};
use crate::output::OutputWriter;

/// Initial geometry of every PTY.
pub const DEFAULT_ROWS: u16 = 24;
pub const DEFAULT_COLS: u16 = 80;

/// Size of one PTY read.
pub const READ_CHUNK: usize = 8192;

/// Keystroke chunks that may queue up for a child that is not reading stdin.
const STDIN_QUEUE: usize = 256;

/// How long a terminated child gets to exit on SIGHUP before its process
/// group is sent SIGKILL.
pub const KILL_GRACE: Duration = Duration::from_millis(250);

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Read-only settings shared by every session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub apps_directory: PathBuf,
    /// Invocable name -> description. Keys form the whitelist.
    pub allowed_apps: BTreeMap<String, String>,
    /// Consulted by the transport before a session exists.
    pub allowed_origins: Vec<String>,
}

impl SessionConfig {
    pub fn is_allowed(&self, name: &str) -> bool {
        self.allowed_apps.contains_key(name)
    }

    pub fn app_path(&self, name: &str) -> PathBuf {
        self.apps_directory.join(name)
    }
}

impl From<&TerminalConfig> for SessionConfig {
    fn from(cfg: &TerminalConfig) -> Self {
        Self {
            apps_directory: cfg.apps_directory.clone(),
            allowed_apps: cfg.allowed_apps.clone(),
            allowed_origins: cfg.allowed_origins.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why an app could not be started. None of these end the session.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("app '{0}' is not in the allowed list")]
    NotAllowed(String),

    #[error("all {max} app slots are in use")]
    Busy { max: usize },

    #[error("app '{name}' executable not found at {}", path.display())]
    NotFound { name: String, path: PathBuf },

    #[error("failed to start '{name}': {reason}")]
    LaunchFailed { name: String, reason: String },
}

impl SpawnError {
    /// Text shown in the client's terminal.
    pub fn user_message(&self) -> String {
        match self {
            Self::NotAllowed(name) => format!(
                "Error: App '{name}' not found\r\nType 'list' to see available apps\r\n"
            ),
            Self::Busy { .. } => "Error: An app is already running. Please wait.\r\n".to_string(),
            Self::NotFound { name, path } => format!(
                "Error: App '{name}' executable not found at {}\r\n\
                 Make sure to compile and place your app in the apps directory\r\n",
                path.display()
            ),
            Self::LaunchFailed { reason, .. } => format!("Error starting app: {reason}\r\n"),
        }
    }

    fn metric_label(&self) -> &'static str {
        match self {
            Self::NotAllowed(_) => "not_allowed",
            Self::Busy { .. } => "busy",
            Self::NotFound { .. } => "not_found",
            Self::LaunchFailed { .. } => "launch_failed",
        }
    }
}

/// I/O failures on a running PTY.
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("pty I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pty resize failed: {0}")]
    Resize(String),

    #[error("pty stdin is full, input dropped")]
    StdinFull,

    #[error("pty stdin is closed")]
    StdinClosed,
}

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

/// The two geometry operations a PTY master offers.
pub trait PtyGeometry {
    fn current_size(&self) -> anyhow::Result<PtySize>;
    fn set_size(&self, size: PtySize) -> anyhow::Result<()>;
}

impl PtyGeometry for Box<dyn MasterPty + Send> {
    fn current_size(&self) -> anyhow::Result<PtySize> {
        self.get_size()
    }

    fn set_size(&self, size: PtySize) -> anyhow::Result<()> {
        self.resize(size)
    }
}

/// Apply `rows` x `cols` unless the PTY already has that size.
///
/// Returns whether a resize was issued. If the current size cannot be read
/// the resize is attempted anyway.
pub fn resize_if_changed(pty: &dyn PtyGeometry, rows: u16, cols: u16) -> Result<bool, PtyError> {
    if let Ok(current) = pty.current_size() {
        if current.rows == rows && current.cols == cols {
            return Ok(false);
        }
    }
    pty.set_size(pty_size(rows, cols))
        .map_err(|e| PtyError::Resize(e.to_string()))?;
    debug!(cols, rows, "PTY resized");
    Ok(true)
}

fn pty_size(rows: u16, cols: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

// ---------------------------------------------------------------------------
// ManagedProcess
// ---------------------------------------------------------------------------

/// A running child process and the PTY it is attached to.
///
/// Owned by exactly one session. It ends either through
/// [`finish`](Self::finish) after the child exited on its own, or through
/// [`terminate`](Self::terminate) when the session goes away first. Both
/// consume the handle and both release the admission slot it holds.
pub struct ManagedProcess {
    id: Uuid,
    name: String,
    pid: Option<u32>,
    started: Instant,
    master: Box<dyn MasterPty + Send>,
    stdin: flume::Sender<Vec<u8>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    slot: AdmissionSlot,
}

/// Everything a successful launch hands back. The reader and the child go to
/// the output pump and the exit waiter respectively.
pub struct Launched {
    pub process: ManagedProcess,
    pub reader: Box<dyn Read + Send>,
    pub child: Box<dyn Child + Send + Sync>,
}

impl ManagedProcess {
    /// Start `name` from the apps directory inside a fresh 24x80 PTY.
    ///
    /// Checks run in order: whitelist, admission, executable on disk, launch.
    /// A slot taken in the admission step is given back on every later
    /// failure. `announce` runs once all checks passed, right before the PTY
    /// is opened.
    pub fn launch(
        config: &SessionConfig,
        admission: &Arc<AdmissionController>,
        name: &str,
        args: &[String],
        announce: impl FnOnce(&str),
    ) -> Result<Launched, SpawnError> {
        let result = Self::try_launch(config, admission, name, args, announce);
        let label = match &result {
            Ok(_) => "started",
            Err(e) => e.metric_label(),
        };
        global_metrics().increment_counter(APP_SPAWNS_TOTAL, &[("result", label)]);
        result
    }

    fn try_launch(
        config: &SessionConfig,
        admission: &Arc<AdmissionController>,
        name: &str,
        args: &[String],
        announce: impl FnOnce(&str),
    ) -> Result<Launched, SpawnError> {
        if !config.is_allowed(name) {
            return Err(SpawnError::NotAllowed(name.to_string()));
        }

        let slot = admission.acquire_slot().ok_or(SpawnError::Busy {
            max: admission.max_concurrent(),
        })?;

        let path = config.app_path(name);
        let exe = match std::fs::canonicalize(&path) {
            Ok(p) => p,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(SpawnError::NotFound {
                    name: name.to_string(),
                    path,
                });
            }
            Err(e) => return Err(launch_failed(name, e)),
        };

        announce(name);

        let pair = native_pty_system()
            .openpty(pty_size(DEFAULT_ROWS, DEFAULT_COLS))
            .map_err(|e| launch_failed(name, e))?;

        let child = pair
            .slave
            .spawn_command(build_command(&exe, args))
            .map_err(|e| launch_failed(name, e))?;
        // The child holds its own copy; ours would keep the master from
        // seeing end-of-stream when the child exits.
        drop(pair.slave);

        let killer = child.clone_killer();
        let pid = child.process_id();

        let started = (|| {
            let reader = pair.master.try_clone_reader()?;
            let writer = pair.master.take_writer()?;
            anyhow::Ok((reader, writer))
        })();
        let (reader, writer) = match started {
            Ok(rw) => rw,
            Err(e) => {
                let mut child = child;
                if let Some(pid) = pid {
                    kill_process_group(pid);
                } else {
                    let _ = child.kill();
                }
                let _ = child.wait();
                return Err(launch_failed(name, e));
            }
        };

        let id = Uuid::new_v4();
        let stdin = spawn_stdin_writer(id, writer);

        info!(%id, app = name, ?pid, ?args, "app started");

        Ok(Launched {
            process: ManagedProcess {
                id,
                name: name.to_string(),
                pid,
                started: Instant::now(),
                master: pair.master,
                stdin,
                killer,
                slot,
            },
            reader,
            child,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Queue raw bytes for the child's stdin, unmodified.
    pub fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        self.stdin.try_send(data.to_vec()).map_err(|e| match e {
            flume::TrySendError::Full(_) => PtyError::StdinFull,
            flume::TrySendError::Disconnected(_) => PtyError::StdinClosed,
        })
    }

    /// Resize the PTY if the geometry differs from the current one.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<bool, PtyError> {
        resize_if_changed(&self.master, rows, cols)
    }

    /// Current geometry as reported by the PTY.
    pub fn size(&self) -> Result<(u16, u16), PtyError> {
        let size = self
            .master
            .get_size()
            .map_err(|e| PtyError::Resize(e.to_string()))?;
        Ok((size.rows, size.cols))
    }

    /// The child exited by itself: give back the slot and close the master.
    pub fn finish(self) {
        let elapsed = self.started.elapsed();
        self.slot.release();
        record_run(&self.name, self.id, elapsed, "exited");
    }

    /// Kill the child, close the master, give back the slot.
    ///
    /// The child is sent SIGHUP first. If it is still around after
    /// [`KILL_GRACE`] its whole process group gets SIGKILL, so the slot is
    /// only given back once nothing of the app can keep running. Blocks for
    /// at most the grace period. Someone must be waiting on the child for
    /// the early exit to be noticed.
    pub fn terminate(mut self) {
        if let Err(e) = self.killer.kill() {
            // Already gone is the common case when racing a natural exit.
            debug!(id = %self.id, "kill failed: {e}");
        }
        if let Some(pid) = self.pid {
            if !exits_within(pid, KILL_GRACE) {
                warn!(id = %self.id, pid, "app ignored SIGHUP, killing its process group");
                kill_process_group(pid);
            }
        }
        let elapsed = self.started.elapsed();
        self.slot.release();
        record_run(&self.name, self.id, elapsed, "terminated");
    }
}

impl std::fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("slot", &self.slot)
            .finish()
    }
}

fn record_run(name: &str, id: Uuid, elapsed: Duration, how: &str) {
    global_metrics().record_histogram(APP_RUN_DURATION_SECONDS, elapsed.as_secs_f64());
    info!(%id, app = name, elapsed_ms = elapsed.as_millis() as u64, "app {how}");
}

/// Poll until `pid` has been reaped or `grace` runs out.
#[cfg(unix)]
fn exits_within(pid: u32, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    loop {
        // SAFETY: signal 0 only probes for existence.
        if unsafe { libc::kill(pid as libc::pid_t, 0) } != 0 {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[cfg(not(unix))]
fn exits_within(_pid: u32, _grace: Duration) -> bool {
    true
}

/// SIGKILL the child and everything it started. The child leads its own
/// session, so its pid is also its process group id.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    // SAFETY: plain syscalls on a pid we spawned and have not reaped.
    unsafe {
        if libc::killpg(pid as libc::pid_t, libc::SIGKILL) != 0 {
            libc::kill(pid as libc::pid_t, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

fn launch_failed(name: &str, e: impl std::fmt::Display) -> SpawnError {
    SpawnError::LaunchFailed {
        name: name.to_string(),
        reason: e.to_string(),
    }
}

/// Environment for full-screen TUI programs. `TERM_PROGRAM` is dropped so a
/// child does not adopt the capabilities of whatever terminal launched the
/// server.
fn build_command(exe: &std::path::Path, args: &[String]) -> CommandBuilder {
    let mut cmd = CommandBuilder::new(exe);
    cmd.args(args);
    if let Ok(cwd) = std::env::current_dir() {
        cmd.cwd(cwd);
    }
    cmd.env("TERM", "xterm-256color");
    cmd.env("COLORTERM", "truecolor");
    cmd.env_remove("TERM_PROGRAM");
    cmd.env_remove("TERM_PROGRAM_VERSION");
    cmd
}

/// Feed queued keystrokes to the PTY on a dedicated thread so a child that
/// stops reading never blocks the session.
fn spawn_stdin_writer(id: Uuid, mut writer: Box<dyn Write + Send>) -> flume::Sender<Vec<u8>> {
    let (tx, rx) = flume::bounded::<Vec<u8>>(STDIN_QUEUE);
    std::thread::spawn(move || {
        while let Ok(data) = rx.recv() {
            if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                warn!(%id, "error writing to PTY: {e}");
                break;
            }
        }
        debug!(%id, "stdin writer finished");
    });
    tx
}

// ---------------------------------------------------------------------------
// Output pump
// ---------------------------------------------------------------------------

/// Copy PTY output to the client until end-of-stream, a read error, a closed
/// transport, or `closed()` turning true.
///
/// Bytes go out as read; the only buffering is a multi-byte UTF-8 sequence
/// split across two reads, which is held until its remainder arrives.
pub fn pump_output(
    id: Uuid,
    mut reader: Box<dyn Read + Send>,
    out: OutputWriter,
    closed: impl Fn() -> bool,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        if closed() {
            debug!(%id, "session closed, stopping output pump");
            return;
        }
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let text = take_complete_utf8(&mut pending);
                if !out.send(text) {
                    return;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if is_end_of_stream(&e) => break,
            Err(e) => {
                warn!(%id, "PTY read error: {e}");
                break;
            }
        }
    }
    if !pending.is_empty() {
        out.send(String::from_utf8_lossy(&pending).into_owned());
    }
    debug!(%id, "output pump finished");
}

/// Linux reports EIO on the master once the last slave descriptor closes.
fn is_end_of_stream(e: &std::io::Error) -> bool {
    #[cfg(unix)]
    if e.raw_os_error() == Some(libc::EIO) {
        return true;
    }
    e.kind() == ErrorKind::UnexpectedEof
}

/// Drain everything up to an incomplete trailing UTF-8 sequence.
fn take_complete_utf8(pending: &mut Vec<u8>) -> String {
    let keep = incomplete_tail_len(pending);
    let rest = pending.split_off(pending.len() - keep);
    let text = String::from_utf8_lossy(pending).into_owned();
    *pending = rest;
    text
}

fn incomplete_tail_len(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let b = bytes[bytes.len() - back];
        if b & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let needed = match b {
            0xF0..=0xFF => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if needed > back { back } else { 0 };
    }
    0
}
