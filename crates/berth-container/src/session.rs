//! Attach sessions.
//!
//! An [`AttachSession`] owns a hijacked client connection and binds it to a
//! container's standard streams until either side ends:
//!
//! ```text
//!                 ┌──────────── input loop ────────────┐
//! client conn ────┤ read ─► detach scan ─► stdin sink  │
//!   (raw)     ◄───┤ write ◄──────────── output stream  │
//!                 └──────────── output loop ───────────┘
//! ```
//!
//! Both loops watch one "session ended" token. Whichever loop finishes first
//! cancels it; the other stops at its next suspension point. The connection
//! is shut down once, after both loops have returned.

use crate::error::{ContainerError, Result};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::io;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const READ_BUF_SIZE: usize = 32 * 1024;

/// Byte stream that an attach session can own.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> RawStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// A hijacked client connection, exclusively owned by its session.
pub type Connection = Box<dyn RawStream>;

/// Which container stream a chunk of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// A chunk of container output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    /// Source stream.
    pub stream: StdStream,
    /// Payload.
    pub data: Bytes,
}

impl OutputChunk {
    /// Creates a stdout chunk.
    pub fn stdout(data: impl Into<Bytes>) -> Self {
        Self {
            stream: StdStream::Stdout,
            data: data.into(),
        }
    }

    /// Creates a stderr chunk.
    pub fn stderr(data: impl Into<Bytes>) -> Self {
        Self {
            stream: StdStream::Stderr,
            data: data.into(),
        }
    }
}

/// Combined container output. Ends when the container's output ends.
pub type OutputStream = BoxStream<'static, OutputChunk>;

/// Why an attach session finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client closed the connection.
    ClientClosed,
    /// The container's output reached end-of-stream.
    OutputClosed,
    /// The client sent the detach key sequence.
    Detached,
    /// The container no longer accepts input.
    StdinClosed,
}

impl std::fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClientClosed => write!(f, "client closed"),
            Self::OutputClosed => write!(f, "output closed"),
            Self::Detached => write!(f, "detached"),
            Self::StdinClosed => write!(f, "stdin closed"),
        }
    }
}

/// Key sequence that detaches a client without stopping the container.
///
/// Uses Docker's syntax: a comma separated list where each entry is either a
/// single character or `ctrl-<c>` with `<c>` in `a-z @ [ \ ] ^ _`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachKeys(Vec<u8>);

impl DetachKeys {
    /// Parses a detach key list such as `ctrl-p,ctrl-q`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for empty or unknown entries.
    pub fn parse(keys: &str) -> Result<Self> {
        let mut codes = Vec::new();
        for key in keys.split(',') {
            if let [byte] = key.as_bytes() {
                codes.push(*byte);
                continue;
            }
            let lower = key.to_ascii_lowercase();
            let code = match lower.strip_prefix("ctrl-").map(str::as_bytes) {
                Some([c]) => ctrl_code(*c),
                _ => None,
            };
            match code {
                Some(code) => codes.push(code),
                None => {
                    return Err(ContainerError::config(format!(
                        "invalid detach keys: unknown character '{key}'"
                    )))
                }
            }
        }
        Ok(Self(codes))
    }

    /// Returns the raw byte sequence.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Default for DetachKeys {
    /// `ctrl-p,ctrl-q`
    fn default() -> Self {
        Self(vec![0x10, 0x11])
    }
}

impl FromStr for DetachKeys {
    type Err = ContainerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

const fn ctrl_code(c: u8) -> Option<u8> {
    match c {
        b'@' => Some(0),
        b'a'..=b'z' => Some(c - b'a' + 1),
        b'[' => Some(27),
        b'\\' => Some(28),
        b']' => Some(29),
        b'^' => Some(30),
        b'_' => Some(31),
        _ => None,
    }
}

/// Scans client input for the detach sequence.
///
/// Bytes that could start the sequence are held back until the sequence
/// either completes (they are swallowed) or breaks (they are released).
/// A break falls back to the longest held suffix that is still a prefix of
/// the sequence, so `a,a,b` matches in `aaab`.
#[derive(Debug)]
struct DetachScanner<'a> {
    keys: &'a [u8],
    /// `fallback[i]`: length of the longest proper prefix of `keys[..=i]`
    /// that is also its suffix.
    fallback: Vec<usize>,
    matched: usize,
}

impl<'a> DetachScanner<'a> {
    fn new(keys: &'a DetachKeys) -> Self {
        let keys = keys.0.as_slice();
        let mut fallback = vec![0; keys.len()];
        let mut len = 0;
        for i in 1..keys.len() {
            while len > 0 && keys[i] != keys[len] {
                len = fallback[len - 1];
            }
            if keys[i] == keys[len] {
                len += 1;
            }
            fallback[i] = len;
        }
        Self {
            keys,
            fallback,
            matched: 0,
        }
    }

    /// Returns the bytes to forward and whether the sequence completed.
    /// Input after a completed sequence is dropped.
    fn feed(&mut self, input: &[u8]) -> (Bytes, bool) {
        let mut out = Vec::with_capacity(input.len() + self.matched);
        for &byte in input {
            while self.matched > 0 && self.keys[self.matched] != byte {
                let keep = self.fallback[self.matched - 1];
                out.extend_from_slice(&self.keys[..self.matched - keep]);
                self.matched = keep;
            }
            if self.keys.get(self.matched) == Some(&byte) {
                self.matched += 1;
                if self.matched == self.keys.len() {
                    self.matched = 0;
                    return (Bytes::from(out), true);
                }
            } else {
                out.push(byte);
            }
        }
        (Bytes::from(out), false)
    }

    /// Releases bytes held back for a sequence that can no longer complete.
    fn flush(&mut self) -> Bytes {
        let held = Bytes::copy_from_slice(&self.keys[..self.matched]);
        self.matched = 0;
        held
    }
}

/// A client connection bound to a container's standard streams.
pub struct AttachSession {
    name: String,
    connection: Connection,
    output: OutputStream,
    stdin: Option<mpsc::Sender<Bytes>>,
    detach_keys: Option<DetachKeys>,
}

impl AttachSession {
    /// Creates a session that relays `output` to `connection`.
    ///
    /// Client input is read and discarded unless a stdin sink is attached
    /// with [`AttachSession::with_stdin`].
    pub fn new(name: impl Into<String>, connection: Connection, output: OutputStream) -> Self {
        Self {
            name: name.into(),
            connection,
            output,
            stdin: None,
            detach_keys: None,
        }
    }

    /// Forwards client input to `stdin`.
    #[must_use]
    pub fn with_stdin(mut self, stdin: mpsc::Sender<Bytes>) -> Self {
        self.stdin = Some(stdin);
        self
    }

    /// Ends the session when the client sends `keys` on stdin.
    #[must_use]
    pub fn with_detach_keys(mut self, keys: DetachKeys) -> Self {
        self.detach_keys = Some(keys);
        self
    }

    /// Runs the session to completion.
    ///
    /// # Errors
    ///
    /// Returns an error if either direction fails with an I/O error other
    /// than a peer disconnect.
    pub async fn run(self) -> Result<SessionEnd> {
        let Self {
            name,
            connection,
            mut output,
            stdin,
            detach_keys,
        } = self;

        let (mut reader, mut writer) = tokio::io::split(connection);
        let ended = CancellationToken::new();

        let input = async {
            let end = pump_input(&mut reader, stdin, detach_keys.as_ref(), &ended).await;
            ended.cancel();
            end
        };
        let out = async {
            let end = pump_output(&mut output, &mut writer, &ended).await;
            ended.cancel();
            end
        };
        let (input_end, output_end) = tokio::join!(input, out);

        // Container-side handles go first so the stdin sink sees the drop
        // before the client sees EOF.
        drop(output);
        let mut connection = reader.unsplit(writer);
        if let Err(e) = connection.shutdown().await {
            if !is_disconnect(&e) {
                tracing::debug!(container = %name, error = %e, "attach connection shutdown failed");
            }
        }
        drop(connection);

        let result = settle(input_end, output_end);
        match &result {
            Ok(end) => tracing::debug!(container = %name, reason = %end, "attach session ended"),
            Err(e) => tracing::debug!(container = %name, error = %e, "attach session failed"),
        }
        result
    }
}

/// Client to container. `None` means the other loop ended the session.
async fn pump_input<R>(
    reader: &mut R,
    stdin: Option<mpsc::Sender<Bytes>>,
    detach_keys: Option<&DetachKeys>,
    ended: &CancellationToken,
) -> Option<Result<SessionEnd>>
where
    R: AsyncRead + Unpin,
{
    let mut scanner = stdin
        .as_ref()
        .and(detach_keys)
        .map(DetachScanner::new);
    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        let n = tokio::select! {
            biased;
            () = ended.cancelled() => return None,
            read = reader.read(&mut buf) => match read {
                Ok(n) => n,
                Err(e) if is_disconnect(&e) => 0,
                Err(e) => return Some(Err(e.into())),
            },
        };

        let Some(tx) = stdin.as_ref() else {
            if n == 0 {
                return Some(Ok(SessionEnd::ClientClosed));
            }
            continue;
        };

        if n == 0 {
            // A partial detach sequence is ordinary input once the client
            // is gone.
            let held = scanner.as_mut().map(DetachScanner::flush).unwrap_or_default();
            if !held.is_empty() {
                tokio::select! {
                    biased;
                    () = ended.cancelled() => return None,
                    _ = tx.send(held) => {}
                }
            }
            return Some(Ok(SessionEnd::ClientClosed));
        }

        let (data, detached) = match scanner.as_mut() {
            Some(scanner) => scanner.feed(&buf[..n]),
            None => (Bytes::copy_from_slice(&buf[..n]), false),
        };

        if !data.is_empty() {
            // A full sink must not keep the session alive once it has ended.
            tokio::select! {
                biased;
                () = ended.cancelled() => return None,
                sent = tx.send(data) => {
                    if sent.is_err() {
                        return Some(Ok(SessionEnd::StdinClosed));
                    }
                }
            }
        }

        if detached {
            return Some(Ok(SessionEnd::Detached));
        }
    }
}

/// Container to client. `None` means the other loop ended the session.
async fn pump_output<W>(
    output: &mut OutputStream,
    writer: &mut W,
    ended: &CancellationToken,
) -> Option<Result<SessionEnd>>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let chunk = tokio::select! {
            biased;
            () = ended.cancelled() => return None,
            next = output.next() => match next {
                Some(chunk) => chunk,
                None => return Some(Ok(SessionEnd::OutputClosed)),
            },
        };

        let written = async {
            writer.write_all(&chunk.data).await?;
            writer.flush().await
        };

        tokio::select! {
            biased;
            () = ended.cancelled() => return None,
            result = written => match result {
                Ok(()) => {}
                Err(e) if is_disconnect(&e) => return Some(Ok(SessionEnd::ClientClosed)),
                Err(e) => return Some(Err(e.into())),
            },
        }
    }
}

fn settle(
    input: Option<Result<SessionEnd>>,
    output: Option<Result<SessionEnd>>,
) -> Result<SessionEnd> {
    match (input, output) {
        (Some(Err(e)), _) | (_, Some(Err(e))) => Err(e),
        (Some(Ok(end)), _) | (None, Some(Ok(end))) => Ok(end),
        (None, None) => Err(ContainerError::runtime(
            "attach session ended without a cause",
        )),
    }
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}
