//! External lazifier invocation.
//!
//! The lazifier is an opaque program called as `program [args...] <root> <meta> <pool>`.
//! Only its exit status matters here; whatever it writes to `meta` and `pool`
//! is its own business. The child is polled rather than waited on so that a
//! timeout or a cancellation can kill it.

use anyhow::{Context, Result};
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::error::ConvertError;

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const STDERR_TAIL: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lazifier {
    program: String,
    args: Vec<String>,
}

/// What a successful run left behind.
#[derive(Debug, Clone)]
pub struct LazifierOutcome {
    pub exit_code: i32,
    pub elapsed: Duration,
    pub stdout: String,
    pub stderr: String,
}

impl Lazifier {
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Extra arguments placed before the `root meta pool` triple.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Runs the lazifier to completion.
    ///
    /// # Errors
    /// - [`ConvertError::LazifierNotFound`] if the program cannot be started
    /// - [`ConvertError::LazifierFailed`] on a non-zero exit or death by signal
    /// - [`ConvertError::LazifierTimeout`] when `timeout` elapses first (the child is killed)
    /// - [`ConvertError::Cancelled`] when `cancel` fires while it runs (the child is killed)
    pub fn invoke(
        &self,
        root: &Path,
        meta: &Path,
        pool: &Path,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> Result<LazifierOutcome> {
        cancel.checkpoint()?;

        log::debug!(
            "Running lazifier: {} {:?} {} {} {}",
            self.program,
            self.args,
            root.display(),
            meta.display(),
            pool.display()
        );

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(root)
            .arg(meta)
            .arg(pool)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ConvertError::LazifierNotFound {
                command: self.program.clone(),
                reason: e.to_string(),
            })?;

        // Drain both pipes on helper threads so a chatty child never blocks on a full pipe.
        let stdout = capture(child.stdout.take());
        let stderr = capture(child.stderr.take());

        let started = Instant::now();
        let status = self.wait(&mut child, started, timeout, cancel)?;
        let elapsed = started.elapsed();

        let stdout = join_capture(stdout);
        let stderr = join_capture(stderr);
        for line in stdout.lines() {
            log::debug!("lazifier: {}", line);
        }

        match status.code() {
            Some(0) => {
                log::info!("Lazifier finished in {:.2?}", elapsed);
                Ok(LazifierOutcome {
                    exit_code: 0,
                    elapsed,
                    stdout,
                    stderr,
                })
            }
            Some(code) => Err(ConvertError::LazifierFailed(format!(
                "status {} from {}{}",
                code,
                self.program,
                stderr_suffix(&stderr)
            ))
            .into()),
            None => Err(ConvertError::LazifierFailed(format!(
                "a signal ({}){}",
                self.program,
                stderr_suffix(&stderr)
            ))
            .into()),
        }
    }

    fn wait(
        &self,
        child: &mut Child,
        started: Instant,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> Result<ExitStatus> {
        loop {
            if let Some(status) = child
                .try_wait()
                .with_context(|| format!("Failed to poll lazifier {}", self.program))?
            {
                return Ok(status);
            }

            if cancel.is_cancelled() {
                log::warn!("Cancellation requested, killing lazifier {}", self.program);
                kill(child);
                return Err(ConvertError::Cancelled.into());
            }

            if let Some(limit) = timeout {
                if started.elapsed() >= limit {
                    log::warn!("Lazifier {} timed out after {:?}", self.program, limit);
                    kill(child);
                    return Err(ConvertError::LazifierTimeout(limit).into());
                }
            }

            thread::sleep(POLL_INTERVAL);
        }
    }
}

fn kill(child: &mut Child) {
    if let Err(e) = child.kill() {
        log::debug!("Failed to kill lazifier: {}", e);
    }
    let _ = child.wait();
}

fn capture<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn join_capture(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let start = trimmed.len().saturating_sub(STDERR_TAIL);
    let start = (start..trimmed.len())
        .find(|i| trimmed.is_char_boundary(*i))
        .unwrap_or(trimmed.len());
    format!(": {}", &trimmed[start..])
}
