//! Backend dispatcher spawning: persistent helper processes with
//! newline-framed stdout and staged termination.
//!
//! A [`Spawner`] owns at most one dispatcher child at a time. Launching
//! wires up piped stdin/stdout (stderr is inherited), streams every complete
//! stdout line to the event sink, and keeps the child around so that a later
//! launch with the same executable and environment can be served by writing
//! one more command line to its stdin instead of paying interpreter start-up
//! again. Termination is staged: a cooperative `exit` command, SIGQUIT, and
//! a delayed SIGKILL for helpers that ignore both.

mod error;
mod framing;

pub use error::SpawnError;

use framing::LineBuffer;
use pkgd_config::DaemonConfig;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

/// How often the drain/reap task polls the child for output and exit.
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Grace period between SIGQUIT and the SIGKILL escalation.
const SIGKILL_DELAY: Duration = Duration::from_millis(500);
/// How long the reap path waits for straggling stdout bytes of an already
/// exited child before giving up on the pipe.
const FINAL_DRAIN_TIMEOUT: Duration = Duration::from_millis(10);

/// Classification of a terminated dispatcher, reported exactly once per
/// child via [`SpawnEvents::on_exit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExitKind {
    /// Child exited on its own with status 0.
    Success,
    /// Child exited on its own with a non-zero status.
    Failed,
    /// Child terminated after [`Spawner::kill`] sent SIGQUIT.
    SigQuit,
    /// Child ignored SIGQUIT and was killed by the escalation timer.
    SigKill,
    /// Child obeyed the `exit` command from [`Spawner::graceful_exit`].
    DispatcherExit,
    /// Child was asked to exit because the caller swapped dispatchers.
    DispatcherChanged,
    /// Not classified yet.
    #[default]
    Unknown,
}

impl ExitKind {
    /// First non-default classification wins; later callers are ignored.
    fn set_if_unknown(&mut self, kind: ExitKind) {
        if *self == ExitKind::Unknown {
            *self = kind;
        }
    }
}

/// Receiver for dispatcher output and termination.
///
/// Both methods are invoked from the drain/reap task. Every complete stdout
/// line produces one `on_line` call, in pipe order; each child produces
/// exactly one trailing `on_exit` call, after which no further events are
/// delivered for that child.
pub trait SpawnEvents: Send + Sync + 'static {
    fn on_line(&self, line: &str);
    fn on_exit(&self, kind: ExitKind);
}

/// State shared between the [`Spawner`], its drain/reap task and the
/// SIGKILL escalation timer.
#[derive(Default)]
struct SpawnState {
    child_pid: Option<i32>,
    finished: bool,
    exit_kind: ExitKind,
    is_sending_exit: bool,
    is_changing_dispatcher: bool,
    /// A `graceful_exit` caller is parked on the wait gate.
    awaiting_exit: bool,
    kill_task: Option<JoinHandle<()>>,
    reaped_tx: Option<watch::Sender<bool>>,
}

/// Launches and supervises one backend dispatcher process at a time.
pub struct Spawner {
    config: DaemonConfig,
    sink: Arc<dyn SpawnEvents>,
    state: Arc<Mutex<SpawnState>>,
    /// Write end of the child's stdin; present iff a child is attached.
    stdin: Arc<AsyncMutex<Option<ChildStdin>>>,
    /// Gate released by the reap path; refreshed per launch.
    reaped_rx: Option<watch::Receiver<bool>>,
    poll_task: Option<JoinHandle<()>>,
    /// Executable of the previous helper, for the reuse check.
    last_argv0: Option<String>,
    /// Environment of the previous helper, compared element-wise.
    last_envp: Option<Vec<String>>,
}

impl Spawner {
    pub fn new(config: DaemonConfig, sink: Arc<dyn SpawnEvents>) -> Self {
        Self {
            config,
            sink,
            state: Arc::new(Mutex::new(SpawnState::default())),
            stdin: Arc::new(AsyncMutex::new(None)),
            reaped_rx: None,
            poll_task: None,
            last_argv0: None,
            last_envp: None,
        }
    }

    /// Whether a dispatcher child is currently attached and unreaped.
    pub fn is_running(&self) -> bool {
        lock_state(&self.state).child_pid.is_some()
    }

    /// Pid of the attached dispatcher, if any.
    pub fn child_id(&self) -> Option<u32> {
        lock_state(&self.state).child_pid.map(|pid| pid as u32)
    }

    /// Run a dispatcher request, reusing the running helper when it matches.
    ///
    /// A running child is reused iff `argv[0]` equals the previous
    /// executable and `envp` equals the previous environment element-wise;
    /// the request then travels as one tab-joined line on its stdin. Any
    /// mismatch (or a failed write) retires the old helper through the
    /// graceful-exit protocol and spawns `argv` afresh with piped
    /// stdin/stdout. `envp = None` inherits the daemon environment; a
    /// present `envp` replaces it entirely.
    pub async fn launch(
        &mut self,
        argv: &[String],
        envp: Option<&[String]>,
    ) -> Result<(), SpawnError> {
        assert!(!argv.is_empty(), "launch requires a non-empty argv");
        debug!(?argv, ?envp, "dispatcher launch requested");

        if self.is_running() {
            if self.last_argv0.as_deref() != Some(argv[0].as_str()) {
                debug!("argv did not match, not reusing");
            } else if !envp_equal(self.last_envp.as_deref(), envp) {
                debug!("envp did not match, not reusing");
            } else {
                // Tabs, not spaces: argument tokens may contain spaces.
                let command = argv[1..].join("\t");
                debug!("reusing running dispatcher");
                match self.send_stdin(&command).await {
                    Ok(()) => return Ok(()),
                    Err(err) => {
                        warn!(%err, "failed to write to dispatcher, killing and respawning")
                    }
                }
            }

            // Retire the old instance before starting a conflicting one.
            debug!("changing dispatcher, exiting old instance");
            lock_state(&self.state).is_changing_dispatcher = true;
            if let Err(err) = self.graceful_exit().await {
                warn!(%err, "old dispatcher did not exit cleanly");
            }
            lock_state(&self.state).is_changing_dispatcher = false;
        }

        // The previous drain task must be gone before a new one is
        // installed; anything else is a state-machine violation.
        if let Some(handle) = self.poll_task.take() {
            if tokio::time::timeout(POLL_INTERVAL * 2, handle).await.is_err() {
                panic!("drain task for the previous dispatcher is still installed");
            }
        }

        {
            let mut st = lock_state(&self.state);
            st.finished = false;
            st.exit_kind = ExitKind::Unknown;
        }

        debug!(argv0 = %argv[0], "spawning new dispatcher");
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(envp) = envp {
            cmd.env_clear();
            for entry in envp {
                match entry.split_once('=') {
                    Some((key, value)) => {
                        cmd.env(key, value);
                    }
                    None => warn!(%entry, "ignoring malformed environment entry"),
                }
            }
        }
        let mut child = cmd.spawn().map_err(|source| SpawnError::Spawn {
            argv0: argv[0].clone(),
            source,
        })?;

        let pid = child.id().map(|pid| pid as i32);

        // Don't let an expensive backend bog the system down.
        let nice = self.config.backend_spawn_nice_value();
        if nice != 0 {
            if let Some(pid) = pid {
                renice(pid, nice);
            }
        }

        // Remember the signature so the next launch can reuse this helper.
        self.last_argv0 = Some(argv[0].clone());
        self.last_envp = envp.map(<[String]>::to_vec);

        let stdin = child.stdin.take().expect("dispatcher stdin is piped");
        let stdout = child.stdout.take().expect("dispatcher stdout is piped");
        *self.stdin.lock().await = Some(stdin);

        let (reaped_tx, reaped_rx) = watch::channel(false);
        self.reaped_rx = Some(reaped_rx);
        {
            let mut st = lock_state(&self.state);
            st.child_pid = pid;
            st.reaped_tx = Some(reaped_tx);
        }

        self.poll_task = Some(tokio::spawn(drain_and_reap(
            child,
            stdout,
            self.sink.clone(),
            self.state.clone(),
            self.stdin.clone(),
        )));
        Ok(())
    }

    /// Terminate the dispatcher with SIGQUIT, escalating to SIGKILL after
    /// [`SIGKILL_DELAY`] if it has not been reaped by then.
    pub fn kill(&self) -> Result<(), SpawnError> {
        let mut st = lock_state(&self.state);
        let Some(pid) = st.child_pid else {
            warn!("dispatcher already finished, nothing to kill");
            return Err(SpawnError::AlreadyFinished);
        };
        st.exit_kind.set_if_unknown(ExitKind::SigQuit);
        debug!(pid, "sending SIGQUIT to dispatcher");
        send_signal(pid, libc::SIGQUIT)?;

        // Well-behaved helpers flush and quit; the rest get SIGKILL.
        let state = self.state.clone();
        st.kill_task = Some(tokio::spawn(async move {
            tokio::time::sleep(SIGKILL_DELAY).await;
            let mut st = lock_state(&state);
            if st.finished {
                return;
            }
            let Some(pid) = st.child_pid else { return };
            st.exit_kind = ExitKind::SigKill;
            debug!(pid, "dispatcher ignored SIGQUIT, sending SIGKILL");
            if let Err(err) = send_signal(pid, libc::SIGKILL) {
                warn!(%err, "failed to SIGKILL dispatcher");
            }
        }));
        Ok(())
    }

    /// Ask the dispatcher to exit by writing the literal `exit` command,
    /// then wait until the child has been reaped.
    ///
    /// This is the one suspending operation on the Spawner; callers swapping
    /// dispatchers rely on it to know the old helper has fully torn down.
    /// Fails fast when an exit is already in flight, and returns the write's
    /// failure without waiting when the command could not be delivered.
    pub async fn graceful_exit(&self) -> Result<(), SpawnError> {
        let reaped_rx = {
            let mut st = lock_state(&self.state);
            if st.is_sending_exit {
                warn!("already sending exit, ignoring");
                return Err(SpawnError::ExitInProgress);
            }
            st.is_sending_exit = true;
            st.awaiting_exit = true;
            self.reaped_rx.clone()
        };

        let result = self.send_stdin("exit").await;
        if result.is_ok() {
            if let Some(mut rx) = reaped_rx {
                let _ = rx.wait_for(|reaped| *reaped).await;
                debug!("dispatcher instance exited");
            }
        }

        let mut st = lock_state(&self.state);
        st.is_sending_exit = false;
        st.awaiting_exit = false;
        result
    }

    /// Write one command line to the running dispatcher's stdin.
    async fn send_stdin(&self, command: &str) -> Result<(), SpawnError> {
        if lock_state(&self.state).finished {
            warn!("dispatcher already finished, dropping command");
            return Err(SpawnError::AlreadyFinished);
        }
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            warn!("no dispatcher stdin, dropping command");
            return Err(SpawnError::AlreadyFinished);
        };

        debug!(command, "sending command to dispatcher");
        let buffer = format!("{command}\n");
        let wrote = stdin
            .write(buffer.as_bytes())
            .await
            .map_err(SpawnError::Write)?;
        if wrote != buffer.len() {
            warn!(wrote, length = buffer.len(), "short write to dispatcher stdin");
            return Err(SpawnError::ShortWrite {
                wrote,
                length: buffer.len(),
            });
        }
        stdin.flush().await.map_err(SpawnError::Write)?;
        Ok(())
    }
}

impl Drop for Spawner {
    fn drop(&mut self) {
        // Callbacks die before the descriptors they hold: aborting the
        // drain task drops the child handle, which kills an unreaped child
        // and closes its pipe ends.
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
        let mut st = lock_state(&self.state);
        if let Some(kill_task) = st.kill_task.take() {
            kill_task.abort();
        }
        if let Some(pid) = st.child_pid.take() {
            debug!(pid, "spawner dropped with live dispatcher");
            let _ = send_signal(pid, libc::SIGQUIT);
        }
    }
}

/// Drive the 50 ms tick: drain stdout into line events, then check for
/// child exit; on exit, classify and emit the terminal event.
async fn drain_and_reap(
    mut child: Child,
    mut stdout: ChildStdout,
    sink: Arc<dyn SpawnEvents>,
    state: Arc<Mutex<SpawnState>>,
    stdin: Arc<AsyncMutex<Option<ChildStdin>>>,
) {
    let mut buffer = LineBuffer::new();
    let mut chunk = [0u8; 4096];
    let mut eof = false;
    let mut ticks: u32 = 0;
    let mut interval = tokio::time::interval(POLL_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let status = loop {
        tokio::select! {
            biased;
            read = stdout.read(&mut chunk), if !eof => match read {
                Ok(0) => {
                    // Stdout closed while the child lives on: emit what is
                    // left and keep ticking until the reap.
                    if let Some(tail) = buffer.take_remaining() {
                        sink.on_line(&tail);
                    }
                    eof = true;
                }
                Ok(n) => {
                    for line in buffer.extend(&chunk[..n]) {
                        sink.on_line(&line);
                    }
                }
                Err(err) => {
                    warn!(%err, "failed to read dispatcher stdout");
                    if let Some(tail) = buffer.take_remaining() {
                        sink.on_line(&tail);
                    }
                    eof = true;
                }
            },
            _ = interval.tick() => {
                ticks = ticks.wrapping_add(1);
                // One debug line per 20 ticks keeps a 50 ms cadence quiet.
                if ticks % 20 == 1 {
                    debug!(pid = ?lock_state(&state).child_pid, "polling dispatcher (1/20)");
                }
                match child.try_wait() {
                    Ok(None) => {}
                    Ok(Some(status)) => break Some(status),
                    Err(err) => {
                        error!(%err, "failed to wait on dispatcher");
                        break None;
                    }
                }
            }
        }
    };

    if !eof {
        drain_remaining(&mut stdout, &mut buffer, sink.as_ref()).await;
    }
    drop(stdout);
    reap(status, &sink, &state, &stdin).await;
}

/// Pick up stdout bytes that were still in flight when the exit was
/// observed, so every line of a child precedes its exit event.
async fn drain_remaining(stdout: &mut ChildStdout, buffer: &mut LineBuffer, sink: &dyn SpawnEvents) {
    let mut chunk = [0u8; 4096];
    loop {
        match tokio::time::timeout(FINAL_DRAIN_TIMEOUT, stdout.read(&mut chunk)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => {
                for line in buffer.extend(&chunk[..n]) {
                    sink.on_line(&line);
                }
            }
            Ok(Err(err)) => {
                warn!(%err, "failed to drain dispatcher stdout");
                break;
            }
        }
    }
    if let Some(tail) = buffer.take_remaining() {
        sink.on_line(&tail);
    }
}

/// Release the child's resources and emit the terminal classification.
async fn reap(
    status: Option<ExitStatus>,
    sink: &Arc<dyn SpawnEvents>,
    state: &Arc<Mutex<SpawnState>>,
    stdin: &Arc<AsyncMutex<Option<ChildStdin>>>,
) {
    // The write end closes first so reuse attempts fail fast.
    stdin.lock().await.take();

    let kind = {
        let mut st = lock_state(state);
        if st.finished {
            error!("dispatcher reaped twice");
            return;
        }
        st.child_pid = None;

        match status.and_then(|status| status.code()) {
            Some(0) => st.exit_kind.set_if_unknown(ExitKind::Success),
            code => {
                warn!(?code, "dispatcher failed");
                st.exit_kind.set_if_unknown(ExitKind::Failed);
            }
        }
        // A parked graceful-exit caller earns the richer classification.
        if st.awaiting_exit {
            if st.is_changing_dispatcher {
                st.exit_kind = ExitKind::DispatcherChanged;
            } else if st.is_sending_exit {
                st.exit_kind = ExitKind::DispatcherExit;
            }
        }
        st.finished = true;

        if let Some(kill_task) = st.kill_task.take() {
            kill_task.abort();
        }
        if let Some(reaped_tx) = st.reaped_tx.take() {
            let _ = reaped_tx.send(true);
        }
        st.exit_kind
    };

    debug!(?kind, "emitting exit");
    sink.on_exit(kind);
}

/// Element-wise, order-sensitive environment comparison; absent equals
/// absent only.
fn envp_equal(last: Option<&[String]>, next: Option<&[String]>) -> bool {
    match (last, next) {
        (None, None) => true,
        (Some(last), Some(next)) => last == next,
        _ => false,
    }
}

fn send_signal(pid: i32, signal: libc::c_int) -> Result<(), SpawnError> {
    // SAFETY: kill() only inspects its scalar arguments.
    let rc = unsafe { libc::kill(pid, signal) };
    if rc != 0 {
        let source = std::io::Error::last_os_error();
        return Err(SpawnError::Signal {
            pid,
            signal,
            source,
        });
    }
    Ok(())
}

fn renice(pid: i32, nice: i32) {
    debug!(pid, nice, "renicing dispatcher");
    // SAFETY: setpriority() only inspects its scalar arguments.
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS as _, pid as _, nice) };
    if rc != 0 {
        warn!(
            pid,
            nice,
            error = %std::io::Error::last_os_error(),
            "failed to renice dispatcher"
        );
    }
}

fn lock_state(state: &Mutex<SpawnState>) -> MutexGuard<'_, SpawnState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
