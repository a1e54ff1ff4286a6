//! External process helpers.
//!
//! Every collaborator of the pipeline (signing tool, keychain tool,
//! registration tool) is an external program. Blocking calls go through
//! [`run`]; signing jobs are started with [`spawn`] and joined later through
//! [`RunningProcess::wait`].

use crate::{Error, Result};
use std::io::{Read, Write};
use std::process::{Child, Command, Output, Stdio};
use std::thread::{self, JoinHandle};

/// Renders a command line for diagnostics.
pub fn describe(cmd: &Command) -> String {
    let mut line = cmd.get_program().to_string_lossy().into_owned();
    for arg in cmd.get_args() {
        line.push(' ');
        line.push_str(&arg.to_string_lossy());
    }
    line
}

/// Runs a command to completion with captured output.
///
/// A non-zero exit becomes [`Error::ExternalTool`] carrying the trimmed
/// stdout and stderr of the process.
pub fn run(cmd: &mut Command) -> Result<Output> {
    let label = describe(cmd);
    tracing::debug!(command = %label, "running");
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .map_err(|e| Error::Io(std::io::Error::new(e.kind(), format!("{label}: {e}"))))?;
    check(label, output)
}

/// Converts a finished process into `Ok(output)` or [`Error::ExternalTool`].
pub fn check(command: String, output: Output) -> Result<Output> {
    if output.status.success() {
        return Ok(output);
    }
    Err(Error::ExternalTool {
        command,
        status: output.status.code(),
        stdout: decode_clean(&output.stdout),
        stderr: decode_clean(&output.stderr),
    })
}

/// Starts a command without waiting for it.
///
/// Output is drained on background threads, so a chatty process never
/// blocks on a full pipe while nobody is waiting on it.
pub fn spawn(cmd: &mut Command) -> Result<RunningProcess> {
    start(cmd, Stdio::null())
}

/// Like [`spawn`], but keeps stdin open for [`RunningProcess::send_line`].
pub fn spawn_interactive(cmd: &mut Command) -> Result<RunningProcess> {
    start(cmd, Stdio::piped())
}

fn start(cmd: &mut Command, stdin: Stdio) -> Result<RunningProcess> {
    let label = describe(cmd);
    tracing::debug!(command = %label, "spawning");
    let mut child = cmd
        .stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Io(std::io::Error::new(e.kind(), format!("{label}: {e}"))))?;
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);
    Ok(RunningProcess {
        label,
        child,
        stdout,
        stderr,
    })
}

fn drain(mut pipe: impl Read + Send + 'static) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

/// Handle to a spawned external process.
pub struct RunningProcess {
    label: String,
    child: Child,
    stdout: Option<JoinHandle<Vec<u8>>>,
    stderr: Option<JoinHandle<Vec<u8>>>,
}

impl RunningProcess {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns `true` once the process has exited.
    pub fn has_exited(&mut self) -> Result<bool> {
        Ok(self.child.try_wait()?.is_some())
    }

    /// Writes one line to stdin and closes it.
    pub fn send_line(&mut self, line: &str) -> Result<()> {
        if let Some(mut stdin) = self.child.stdin.take() {
            writeln!(stdin, "{line}")?;
        }
        Ok(())
    }

    /// Kills the process and reaps it.
    pub fn kill(mut self) {
        if let Err(e) = self.child.kill() {
            tracing::debug!(command = %self.label, error = %e, "kill failed");
        }
        let _ = self.child.wait();
    }

    /// Blocks until the process exits and checks its status.
    pub fn wait(mut self) -> Result<Output> {
        drop(self.child.stdin.take());
        let status = self.child.wait()?;
        let output = Output {
            status,
            stdout: join(self.stdout.take()),
            stderr: join(self.stderr.take()),
        };
        check(self.label, output)
    }
}

fn join(reader: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    reader.and_then(|h| h.join().ok()).unwrap_or_default()
}

/// UTF-8 decodes process output, trimming surrounding whitespace.
pub fn decode_clean(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}
