//! Process launcher for `kubectl port-forward`
//!
//! Spawns one forwarding process per definition and decides, right after the
//! spawn, whether it came up cleanly. The launcher owns no shared state; the
//! returned [`ForwardProcess`] handle is owned by whoever tracks the forward.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::definition::TunnelDefinition;
use crate::error::TunnelError;
use crate::probe::is_port_available;

/// Default time between spawn and the stability checks
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(250);

/// Upper bound for collecting stderr of a process that already exited
const STDERR_GRACE: Duration = Duration::from_millis(200);

/// Most stderr bytes kept while a launch is being checked
const STDERR_CAPTURE_LIMIT: usize = 16 * 1024;

/// A live forwarding process
pub trait ForwardProcess: Send {
    /// OS process id, if known
    fn pid(&self) -> Option<u32>;

    /// Terminate the process
    fn kill(&mut self) -> std::io::Result<()>;
}

/// Starts forwarding processes for tunnel definitions
#[cfg_attr(test, mockall::automock)]
pub trait Launcher {
    fn launch(&self, definition: &TunnelDefinition)
        -> Result<Box<dyn ForwardProcess>, TunnelError>;
}

/// Launcher backed by the `kubectl` command-line tool
#[derive(Debug, Clone)]
pub struct KubectlLauncher {
    program: PathBuf,
    settle: Duration,
}

impl KubectlLauncher {
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("kubectl"),
            settle: DEFAULT_SETTLE,
        }
    }

    /// Use a different kubectl binary
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Change the delay before the post-spawn stability checks
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn settle(&self) -> Duration {
        self.settle
    }

    /// Build the kubectl argument list for a definition
    pub fn command_args(definition: &TunnelDefinition) -> Vec<String> {
        let mut args = Vec::with_capacity(7);
        if !definition.context.is_empty() {
            args.push("--context".to_string());
            args.push(definition.context.clone());
        }
        args.push("port-forward".to_string());
        args.push("--namespace".to_string());
        args.push(definition.namespace.clone());
        args.push(format!("svc/{}", definition.service));
        args.push(format!(
            "{}:{}",
            definition.port_local, definition.port_remote
        ));
        args
    }
}

impl Default for KubectlLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl Launcher for KubectlLauncher {
    fn launch(
        &self,
        definition: &TunnelDefinition,
    ) -> Result<Box<dyn ForwardProcess>, TunnelError> {
        let port = definition.port_local;

        if !is_port_available(port) {
            error!(tunnel = %definition.id, port, "Pre-check failed: local port already in use");
            return Err(TunnelError::PortInUse { port });
        }

        let args = Self::command_args(definition);
        debug!(
            tunnel = %definition.id,
            "Attempting port-forward: {} {}",
            self.program.display(),
            args.join(" ")
        );

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                error!(tunnel = %definition.id, "Failed to spawn port-forward: {}", e);
                TunnelError::LaunchFailed {
                    message: String::new(),
                    source: Some(e),
                }
            })?;

        let pid = child.id();
        let stderr = StderrBuffer::default();
        let reader = child.stderr.take().and_then(|pipe| stderr.drain(pipe, pid));

        if !self.settle.is_zero() {
            thread::sleep(self.settle);
        }

        match child.try_wait() {
            Ok(Some(status)) => {
                if let Some(reader) = &reader {
                    wait_for_reader(reader);
                }
                let text = stderr.text();
                error!(
                    tunnel = %definition.id,
                    pid,
                    %status,
                    "Port-forward process exited quickly. Stderr: {}",
                    text.trim()
                );
                return Err(TunnelError::ProcessExitedImmediately {
                    stderr: text.trim().to_string(),
                });
            }
            Ok(None) => {}
            Err(e) => {
                reap(&mut child);
                return Err(TunnelError::LaunchFailed {
                    message: stderr.text().trim().to_string(),
                    source: Some(e),
                });
            }
        }

        // kubectl reports connection and lookup failures on stderr while it keeps running
        let text = stderr.text();
        if !text.trim().is_empty() {
            error!(
                tunnel = %definition.id,
                pid,
                "Port-forward process produced stderr output shortly after start: {}",
                text.trim()
            );
            reap(&mut child);
            return Err(TunnelError::LaunchFailed {
                message: text.trim().to_string(),
                source: None,
            });
        }

        // From here on stderr is only logged; the pipe is still drained
        stderr.close();

        debug!(tunnel = %definition.id, pid, port, "Started port-forward process, appears stable");
        Ok(Box::new(KubectlProcess {
            child,
            reaped: false,
        }))
    }
}

/// Handle to a running kubectl process
///
/// The child is killed and reaped when the handle is dropped without an
/// explicit [`ForwardProcess::kill`].
pub struct KubectlProcess {
    child: Child,
    reaped: bool,
}

impl ForwardProcess for KubectlProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn kill(&mut self) -> std::io::Result<()> {
        if self.reaped {
            return Ok(());
        }
        debug!(pid = self.child.id(), "Stopping port-forward process");
        self.child.kill()?;
        self.child.wait()?;
        self.reaped = true;
        Ok(())
    }
}

impl Drop for KubectlProcess {
    fn drop(&mut self) {
        if !self.reaped {
            if let Err(e) = self.kill() {
                warn!(pid = self.child.id(), "Failed to kill dropped port-forward: {}", e);
            }
        }
    }
}

/// Stderr captured by a background reader during the launch checks
///
/// Capture is bounded and ends with [`StderrBuffer::close`]; the reader keeps
/// draining the pipe afterwards so kubectl never blocks on a full pipe.
#[derive(Clone)]
struct StderrBuffer {
    inner: Arc<Mutex<Capture>>,
}

struct Capture {
    bytes: Vec<u8>,
    open: bool,
}

impl Default for StderrBuffer {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Capture {
                bytes: Vec::new(),
                open: true,
            })),
        }
    }
}

impl StderrBuffer {
    fn drain(&self, mut pipe: ChildStderr, pid: u32) -> Option<JoinHandle<()>> {
        let buffer = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("kforward-stderr-{}", pid))
            .spawn(move || {
                let mut chunk = [0u8; 4096];
                loop {
                    match pipe.read(&mut chunk) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if !buffer.append(&chunk[..n]) {
                                debug!(
                                    pid,
                                    "port-forward stderr: {}",
                                    String::from_utf8_lossy(&chunk[..n]).trim_end()
                                );
                            }
                        }
                    }
                }
            });

        match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(pid, "Failed to start stderr reader: {}", e);
                None
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Capture> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Keep a chunk while capture is open; `false` once it is closed
    fn append(&self, chunk: &[u8]) -> bool {
        let mut capture = self.lock();
        if !capture.open {
            return false;
        }
        let room = STDERR_CAPTURE_LIMIT.saturating_sub(capture.bytes.len());
        let take = room.min(chunk.len());
        capture.bytes.extend_from_slice(&chunk[..take]);
        true
    }

    /// Stop capturing and free what was kept
    fn close(&self) {
        let mut capture = self.lock();
        capture.open = false;
        capture.bytes = Vec::new();
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.lock().bytes).into_owned()
    }
}

fn wait_for_reader(reader: &JoinHandle<()>) {
    let deadline = Instant::now() + STDERR_GRACE;
    while !reader.is_finished() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
}

fn reap(child: &mut Child) {
    if let Err(e) = child.kill() {
        warn!(pid = child.id(), "Failed to kill port-forward: {}", e);
        return;
    }
    let _ = child.wait();
}
