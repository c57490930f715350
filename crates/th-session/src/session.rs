use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use portable_pty::Child;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::admission::AdmissionController;
use crate::command::{self, Builtin, Command};
use crate::message::ClientMessage;
use crate::output::OutputWriter;
use crate::pty_bridge::{pump_output, Launched, ManagedProcess, SessionConfig};

/// Sent once an attached process has exited and the session is Idle again.
pub const COMPLETION_BANNER: &str = "\r\n[Process Completed. Press Enter to continue]\r\n";

/// How long the exit waiter lets the output pump drain before announcing
/// completion.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

struct SessionState {
    closed: bool,
    attached: Option<ManagedProcess>,
}

/// State reachable from the pump and exit-waiter threads.
struct Shared {
    id: Uuid,
    state: Mutex<SessionState>,
    output: OutputWriter,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| {
            warn!(session = %self.id, "session lock was poisoned, recovering");
            e.into_inner()
        })
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

// ---------------------------------------------------------------------------
// TerminalSession
// ---------------------------------------------------------------------------

/// One client connection.
///
/// Idle while no process is attached: keystrokes are line-edited and echoed
/// locally and submitted lines are interpreted as commands. Busy while a
/// process is attached: keystrokes go to the process untouched and its
/// output streams back. Closed once [`close`](Self::close) ran; nothing
/// leaves the session after that.
pub struct TerminalSession {
    config: Arc<SessionConfig>,
    admission: Arc<AdmissionController>,
    shared: Arc<Shared>,
    line_buffer: String,
}

impl TerminalSession {
    /// Start a session in the Idle state and greet the client.
    pub fn new(
        id: Uuid,
        config: Arc<SessionConfig>,
        admission: Arc<AdmissionController>,
        output: OutputWriter,
    ) -> Self {
        let session = Self {
            config,
            admission,
            shared: Arc::new(Shared {
                id,
                state: Mutex::new(SessionState {
                    closed: false,
                    attached: None,
                }),
                output,
            }),
            line_buffer: String::new(),
        };
        session
            .shared
            .output
            .send(command::welcome_banner(&session.config.allowed_apps));
        info!(session = %id, "terminal session opened");
        session
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Whether a process is attached (Busy).
    pub fn is_attached(&self) -> bool {
        self.shared.lock().attached.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// The text not yet submitted in Idle mode.
    pub fn line_buffer(&self) -> &str {
        &self.line_buffer
    }

    pub fn handle_message(&mut self, msg: ClientMessage) {
        match msg {
            ClientMessage::Command(line) => self.handle_command(&line),
            ClientMessage::Input(data) => self.handle_input(&data),
            ClientMessage::Resize(size) => self.handle_resize(size.rows, size.cols),
        }
    }

    /// A full line submitted by the client.
    ///
    /// While Busy the line is typed into the attached process followed by a
    /// carriage return; it never starts a second process. An empty line is
    /// dropped.
    pub fn handle_command(&mut self, line: &str) {
        {
            let state = self.shared.lock();
            if state.closed {
                return;
            }
            if let Some(process) = &state.attached {
                if line.is_empty() {
                    return;
                }
                let mut data = line.as_bytes().to_vec();
                data.push(b'\r');
                if let Err(e) = process.write(&data) {
                    warn!(session = %self.id(), "dropping command for attached app: {e}");
                }
                return;
            }
        }
        self.execute(line);
    }

    /// Raw keystrokes.
    pub fn handle_input(&mut self, data: &str) {
        {
            let state = self.shared.lock();
            if state.closed {
                return;
            }
            if let Some(process) = &state.attached {
                if let Err(e) = process.write(data.as_bytes()) {
                    warn!(session = %self.id(), "dropping input for attached app: {e}");
                }
                return;
            }
        }

        for (idx, ch) in data.char_indices() {
            match ch {
                '\r' | '\n' => {
                    self.echo("\r\n");
                    let line = std::mem::take(&mut self.line_buffer);
                    self.execute(&line);
                    // The line may have started a process; the rest of this
                    // frame belongs to it.
                    if self.is_attached() {
                        let rest = &data[idx + ch.len_utf8()..];
                        if !rest.is_empty() {
                            self.handle_input(rest);
                        }
                        return;
                    }
                }
                '\u{7f}' | '\u{8}' => {
                    if self.line_buffer.pop().is_some() {
                        self.echo("\x08 \x08");
                    }
                }
                '\u{3}' => {
                    self.line_buffer.clear();
                    self.echo("^C\r\n");
                }
                other => {
                    self.line_buffer.push(other);
                    let mut buf = [0u8; 4];
                    self.echo(other.encode_utf8(&mut buf));
                }
            }
        }
    }

    /// Resize the attached PTY. Ignored while Idle.
    pub fn handle_resize(&self, rows: u16, cols: u16) {
        let state = self.shared.lock();
        let Some(process) = &state.attached else {
            debug!(session = %self.id(), rows, cols, "resize with no app attached");
            return;
        };
        if let Err(e) = process.resize(rows, cols) {
            warn!(session = %self.id(), "error resizing PTY: {e}");
        }
    }

    /// Enter Closed. Kills an attached process and gives back its admission
    /// slot. Safe to call more than once.
    pub fn close(&self) {
        let process = {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.attached.take()
        };
        if let Some(process) = process {
            process.terminate();
        }
        info!(session = %self.id(), "terminal session closed");
    }

    fn echo(&self, text: &str) {
        self.shared.output.send(text);
    }

    fn execute(&mut self, line: &str) {
        match command::classify(line) {
            Command::Empty => {}
            Command::Builtin(Builtin::Help) => {
                self.echo(&command::welcome_banner(&self.config.allowed_apps));
            }
            Command::Builtin(Builtin::List) => {
                self.echo(&command::apps_listing(&self.config.allowed_apps));
            }
            Command::Builtin(Builtin::Clear) => self.echo(command::CLEAR_SCREEN),
            Command::Invocation { name, args } => self.spawn(&name, &args),
        }
    }

    fn spawn(&mut self, name: &str, args: &[String]) {
        let output = self.shared.output.clone();
        let launched = ManagedProcess::launch(&self.config, &self.admission, name, args, |name| {
            output.send(format!("Running: {name}\r\n"));
        });
        match launched {
            Ok(launched) => self.attach(launched),
            Err(e) => {
                info!(session = %self.id(), app = name, "spawn rejected: {e}");
                self.echo(&e.user_message());
            }
        }
    }

    fn attach(&mut self, launched: Launched) {
        let Launched {
            process,
            reader,
            child,
        } = launched;
        let process_id = process.id();

        {
            let mut state = self.shared.lock();
            if state.closed {
                drop(state);
                let mut child = child;
                std::thread::spawn(move || child.wait());
                process.terminate();
                return;
            }
            state.attached = Some(process);
        }

        let (drained_tx, drained_rx) = flume::bounded::<()>(1);

        let shared = Arc::clone(&self.shared);
        std::thread::spawn(move || {
            let output = shared.output.clone();
            pump_output(process_id, reader, output, || shared.is_closed());
            drop(drained_tx);
        });

        let shared = Arc::clone(&self.shared);
        std::thread::spawn(move || wait_for_exit(shared, process_id, child, drained_rx));
    }
}

impl Drop for TerminalSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalSession")
            .field("id", &self.shared.id)
            .field("attached", &self.is_attached())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Block until the child exits, then detach it if this session still owns it
/// and tell the client.
///
/// If [`TerminalSession::close`] got to the process first it already
/// terminated it, so nothing is released or sent here.
fn wait_for_exit(
    shared: Arc<Shared>,
    process_id: Uuid,
    mut child: Box<dyn Child + Send + Sync>,
    drained: flume::Receiver<()>,
) {
    match child.wait() {
        Ok(status) => debug!(id = %process_id, code = status.exit_code(), "app exited"),
        Err(e) => warn!(id = %process_id, "error waiting for app: {e}"),
    }

    let owned = {
        let mut state = shared.lock();
        match &state.attached {
            Some(p) if p.id() == process_id => state.attached.take(),
            _ => None,
        }
    };
    let Some(process) = owned else {
        return;
    };
    process.finish();

    // Let trailing output reach the client ahead of the banner. The pump
    // signals by dropping its sender.
    let _ = drained.recv_timeout(DRAIN_GRACE);
    if !shared.is_closed() {
        shared.output.send(COMPLETION_BANNER);
    }
}
