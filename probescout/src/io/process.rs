//! Child processes as a stream of line events.
//!
//! [`spawn_lines`] starts a child (argv only, never a shell) and returns a
//! [`LineEvents`] iterator. Two reader threads drain stdout and stderr while a
//! waiter thread enforces the deadline. The iterator yields every line in
//! arrival order and ends with exactly one [`LineEvent::Exit`].

use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// How long readers may keep a pipe open after the child exited.
pub const READER_JOIN_GRACE: Duration = Duration::from_secs(5);

/// How long a timed-out child gets to exit after SIGTERM before it is killed.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitOutcome {
    /// Exit code, `None` when killed by a signal.
    pub code: Option<i32>,
    pub timed_out: bool,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.code == Some(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    Line(StreamKind, String),
    Exit(ExitOutcome),
}

enum Message {
    Line(StreamKind, String),
    Eof(StreamKind),
    Exited(Result<ExitOutcome>),
}

/// Lazy, finite, non-restartable sequence of line events.
pub struct LineEvents {
    rx: Receiver<Message>,
    open_streams: u8,
    exit: Option<ExitOutcome>,
    reader_deadline: Option<Instant>,
    finished: bool,
}

/// Spawn `program args..` with the given wall-clock timeout.
#[instrument(skip_all, fields(program = %program, timeout_secs = timeout.as_secs()))]
pub fn spawn_lines(program: &str, args: &[String], timeout: Duration) -> Result<LineEvents> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, program, "failed to spawn command");
            return Err(e).with_context(|| format!("spawn {program}"));
        }
    };
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (tx, rx) = mpsc::channel();
    spawn_reader(stdout, StreamKind::Stdout, tx.clone());
    spawn_reader(stderr, StreamKind::Stderr, tx.clone());

    thread::spawn(move || {
        let outcome = wait_child(&mut child, timeout);
        let _ = tx.send(Message::Exited(outcome));
    });

    Ok(LineEvents {
        rx,
        open_streams: 2,
        exit: None,
        reader_deadline: None,
        finished: false,
    })
}

fn wait_child(child: &mut Child, timeout: Duration) -> Result<ExitOutcome> {
    match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => Ok(ExitOutcome {
            code: status.code(),
            timed_out: false,
        }),
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, terminating");
            // `sudo` relays SIGTERM to the scanner but cannot relay SIGKILL.
            terminate(child);
            let status = match child
                .wait_timeout(TERMINATE_GRACE)
                .context("wait command after terminate")?
            {
                Some(status) => status,
                None => {
                    warn!("command ignored terminate, killing");
                    child.kill().context("kill command")?;
                    child.wait().context("wait command after kill")?
                }
            };
            Ok(ExitOutcome {
                code: status.code(),
                timed_out: true,
            })
        }
    }
}

#[cfg(unix)]
fn terminate(child: &Child) {
    let sent = Command::new("kill")
        .args(["-s", "TERM", &child.id().to_string()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match sent {
        Ok(status) if status.success() => {}
        Ok(status) => debug!(exit_code = ?status.code(), "kill -s TERM failed"),
        Err(e) => debug!(err = %e, "could not run kill"),
    }
}

#[cfg(not(unix))]
fn terminate(_child: &Child) {}

fn spawn_reader<R: Read + Send + 'static>(stream: R, kind: StreamKind, tx: Sender<Message>) {
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    if tx.send(Message::Line(kind, line)).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!(err = %e, ?kind, "stream read failed");
                    break;
                }
            }
        }
        let _ = tx.send(Message::Eof(kind));
    });
}

impl LineEvents {
    fn finish(&mut self) -> Option<LineEvent> {
        self.finished = true;
        Some(LineEvent::Exit(self.exit.unwrap_or_default()))
    }
}

impl Iterator for LineEvents {
    type Item = LineEvent;

    fn next(&mut self) -> Option<LineEvent> {
        if self.finished {
            return None;
        }
        loop {
            if self.exit.is_some() && self.open_streams == 0 {
                return self.finish();
            }
            let message = match self.reader_deadline {
                None => match self.rx.recv() {
                    Ok(message) => message,
                    Err(_) => return self.finish(),
                },
                Some(deadline) => {
                    let wait = deadline.saturating_duration_since(Instant::now());
                    match self.rx.recv_timeout(wait) {
                        Ok(message) => message,
                        Err(RecvTimeoutError::Timeout) => {
                            // A grandchild may still hold the pipe open.
                            warn!(
                                open_streams = self.open_streams,
                                "output readers did not finish, abandoning"
                            );
                            return self.finish();
                        }
                        Err(RecvTimeoutError::Disconnected) => return self.finish(),
                    }
                }
            };
            match message {
                Message::Line(kind, line) => return Some(LineEvent::Line(kind, line)),
                Message::Eof(_) => self.open_streams = self.open_streams.saturating_sub(1),
                Message::Exited(outcome) => {
                    let outcome = outcome.unwrap_or_else(|e| {
                        error!(err = %e, "waiting on child failed");
                        ExitOutcome {
                            code: None,
                            timed_out: false,
                        }
                    });
                    debug!(exit_code = ?outcome.code, timed_out = outcome.timed_out, "command finished");
                    self.exit = Some(outcome);
                    self.reader_deadline = Some(Instant::now() + READER_JOIN_GRACE);
                }
            }
        }
    }
}

/// Captured output of a short-lived command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit: ExitOutcome,
}

/// Run a command to completion, collecting both streams.
pub fn run_command_with_timeout(
    program: &str,
    args: &[String],
    timeout: Duration,
) -> Result<CommandOutput> {
    let mut output = CommandOutput::default();
    for event in spawn_lines(program, args, timeout)? {
        match event {
            LineEvent::Line(StreamKind::Stdout, line) => {
                output.stdout.push_str(&line);
                output.stdout.push('\n');
            }
            LineEvent::Line(StreamKind::Stderr, line) => {
                output.stderr.push_str(&line);
                output.stderr.push('\n');
            }
            LineEvent::Exit(exit) => output.exit = exit,
        }
    }
    Ok(output)
}
