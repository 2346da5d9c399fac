use anyhow::{Context, Result};
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// `None` when the process was killed by a signal or by the timeout.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub elapsed: Duration,
}

/// Runs `cmd` until it exits and its output pipes close, or until `timeout` elapses.
///
/// A background process that inherits the pipes keeps them open after the direct child exits;
/// the deadline covers that wait too. On timeout the output is discarded and reader threads are
/// left to finish on their own.
pub fn run_with_timeout(
    mut cmd: Command,
    stdin_bytes: Option<Vec<u8>>,
    timeout: Duration,
) -> Result<ProcessOutput> {
    cmd.stdin(if stdin_bytes.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let program = cmd.get_program().to_string_lossy().to_string();
    let started = Instant::now();
    let deadline = started + timeout;
    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {}", program))?;

    if let (Some(bytes), Some(mut stdin)) = (stdin_bytes, child.stdin.take()) {
        thread::spawn(move || {
            let _ = stdin.write_all(&bytes);
        });
    }
    let stdout_rx = spawn_reader(child.stdout.take());
    let stderr_rx = spawn_reader(child.stderr.take());

    loop {
        if let Some(status) = child
            .try_wait()
            .with_context(|| format!("waiting for {}", program))?
        {
            let stdout = receive_until(&stdout_rx, deadline);
            let stderr = receive_until(&stderr_rx, deadline);
            return Ok(match (stdout, stderr) {
                (Some(stdout), Some(stderr)) => ProcessOutput {
                    exit_code: status.code(),
                    stdout,
                    stderr,
                    timed_out: false,
                    elapsed: started.elapsed(),
                },
                _ => timed_out_output(started),
            });
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(timed_out_output(started));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn timed_out_output(started: Instant) -> ProcessOutput {
    ProcessOutput {
        exit_code: None,
        stdout: String::new(),
        stderr: String::new(),
        timed_out: true,
        elapsed: started.elapsed(),
    }
}

fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    match pipe {
        Some(mut pipe) => {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf);
                let _ = tx.send(buf);
            });
        }
        None => {
            let _ = tx.send(Vec::new());
        }
    }
    rx
}

fn receive_until(rx: &Receiver<Vec<u8>>, deadline: Instant) -> Option<String> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    match rx.recv_timeout(remaining) {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).to_string()),
        Err(RecvTimeoutError::Timeout) => None,
        Err(RecvTimeoutError::Disconnected) => Some(String::new()),
    }
}
