//! Classification of `cloudflared` output.
//!
//! `cloudflared` logs lines such as
//! `2024-01-15T10:00:00Z INF Start Websocket listener host=localhost:8123`.
//! [`classify`] strips the timestamp and level tag and decides whether a line
//! is informational, a warning, an error, or an authentication failure.
//! [`OutputMonitor`] reads both streams of one process and turns lines into
//! [`OutputSignal`]s for the supervisor.

use std::io;

use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Split};

use crate::error::SpawnError;
use crate::process::ProcessHandle;

/// Lines that mention error-adjacent wording but are routine for `cloudflared`.
/// Matched case-insensitively against the whole line.
const BENIGN_PATTERNS: &[&str] = &[
    "start websocket listener",
    "start tcp listener",
    "registered tunnel connection",
    "connection established",
    "cannot determine default origin certificate path",
    "failed to sufficiently increase receive buffer size",
    "autoupdate",
];

/// Wording that, next to "token", marks a rejected credential.
const AUTH_FAILURE_WORDS: &[&str] = &[
    "fail",
    "invalid",
    "unauthorized",
    "denied",
    "expired",
    "rejected",
    "error",
    "forbidden",
];

const LEVEL_TAGS: &[&str] = &["DBG", "INF", "WRN", "ERR", "FTL"];

/// Message used when the output streams close without an earlier terminal signal.
pub const UNEXPECTED_TERMINATION: &str = "process terminated unexpectedly";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    Info,
    Warning,
    Error,
    AuthenticationFailure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedLine {
    /// The line as read, trimmed.
    pub raw: String,
    /// The line without timestamp and level tag.
    pub message: String,
    pub class: LineClass,
}

/// A status-relevant event observed on the output streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSignal {
    Error(String),
    AuthenticationFailure(String),
    /// The streams closed (process exited) without a prior terminal signal.
    UnexpectedTermination,
}

/// Classifies a single output line.
pub fn classify(line: &str) -> ClassifiedLine {
    let raw = line.trim().to_string();
    let (level, message) = split_level(&raw);
    let message = message.to_string();
    let lower = raw.to_lowercase();

    let class = if raw.is_empty() || BENIGN_PATTERNS.iter().any(|p| lower.contains(p)) {
        LineClass::Info
    } else if lower.contains("token") && AUTH_FAILURE_WORDS.iter().any(|w| lower.contains(w)) {
        LineClass::AuthenticationFailure
    } else if matches!(level, Some("ERR" | "FTL")) || lower.contains("error") {
        LineClass::Error
    } else if level == Some("WRN") {
        LineClass::Warning
    } else {
        LineClass::Info
    };

    ClassifiedLine {
        raw,
        message,
        class,
    }
}

/// Splits an optional leading timestamp and level tag off a log line.
fn split_level(line: &str) -> (Option<&str>, &str) {
    let mut rest = line;

    if let Some((first, tail)) = rest.split_once(char::is_whitespace)
        && looks_like_timestamp(first)
    {
        rest = tail.trim_start();
    }

    if let Some((tag, tail)) = rest.split_once(char::is_whitespace)
        && let Some(level) = LEVEL_TAGS.iter().copied().find(|l| *l == tag)
    {
        return (Some(level), tail.trim());
    }
    if let Some(level) = LEVEL_TAGS.iter().copied().find(|l| *l == rest) {
        return (Some(level), "");
    }

    (None, rest)
}

fn looks_like_timestamp(token: &str) -> bool {
    token.len() >= 10
        && token.as_bytes()[..4].iter().all(u8::is_ascii_digit)
        && token.as_bytes()[4] == b'-'
}

type LineReader = Split<BufReader<Box<dyn AsyncRead + Send + Unpin>>>;

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Reads one process's stdout and stderr concurrently, line by line.
///
/// A monitor belongs to exactly one process; a restarted process gets a new
/// monitor. Once both streams are closed it yields nothing further.
pub struct OutputMonitor {
    stdout: Option<LineReader>,
    stderr: Option<LineReader>,
    terminal_seen: bool,
    finished: bool,
}

impl OutputMonitor {
    pub fn new<O, E>(stdout: O, stderr: E) -> Self
    where
        O: AsyncRead + Send + Unpin + 'static,
        E: AsyncRead + Send + Unpin + 'static,
    {
        let stdout: Box<dyn AsyncRead + Send + Unpin> = Box::new(stdout);
        let stderr: Box<dyn AsyncRead + Send + Unpin> = Box::new(stderr);
        Self {
            stdout: Some(BufReader::new(stdout).split(b'\n')),
            stderr: Some(BufReader::new(stderr).split(b'\n')),
            terminal_seen: false,
            finished: false,
        }
    }

    /// Takes over the output pipes of `process`.
    pub fn attach(process: &mut ProcessHandle) -> Result<Self, SpawnError> {
        let (stdout, stderr) = process.take_output()?;
        Ok(Self::new(stdout, stderr))
    }

    /// Next classified line from either stream, or `None` once both are closed.
    ///
    /// Cancel safe: dropping the future loses no line.
    pub async fn next_line(&mut self) -> io::Result<Option<ClassifiedLine>> {
        loop {
            let (stream, read) = match (self.stdout.as_mut(), self.stderr.as_mut()) {
                (None, None) => return Ok(None),
                (Some(out), None) => (Stream::Stdout, out.next_segment().await),
                (None, Some(err)) => (Stream::Stderr, err.next_segment().await),
                (Some(out), Some(err)) => tokio::select! {
                    read = out.next_segment() => (Stream::Stdout, read),
                    read = err.next_segment() => (Stream::Stderr, read),
                },
            };

            match read? {
                Some(bytes) => {
                    // cloudflared output is not guaranteed to be UTF-8.
                    let line = String::from_utf8_lossy(&bytes);
                    debug!(target: "cloudflared", "{}", line.trim_end());
                    return Ok(Some(classify(&line)));
                }
                None => match stream {
                    Stream::Stdout => self.stdout = None,
                    Stream::Stderr => self.stderr = None,
                },
            }
        }
    }

    /// Next status-relevant signal. Informational lines are consumed silently.
    pub async fn next_signal(&mut self) -> Option<OutputSignal> {
        if self.finished {
            return None;
        }

        loop {
            match self.next_line().await {
                Ok(Some(line)) => match line.class {
                    LineClass::Info => {}
                    LineClass::Warning => warn!("cloudflared: {}", line.message),
                    LineClass::Error => return Some(OutputSignal::Error(line.message)),
                    LineClass::AuthenticationFailure => {
                        self.terminal_seen = true;
                        return Some(OutputSignal::AuthenticationFailure(line.message));
                    }
                },
                Ok(None) => {
                    self.finished = true;
                    if self.terminal_seen {
                        return None;
                    }
                    self.terminal_seen = true;
                    return Some(OutputSignal::UnexpectedTermination);
                }
                Err(e) => {
                    self.finished = true;
                    self.terminal_seen = true;
                    self.stdout = None;
                    self.stderr = None;
                    return Some(OutputSignal::Error(format!(
                        "error reading tunnel output: {e}"
                    )));
                }
            }
        }
    }
}
