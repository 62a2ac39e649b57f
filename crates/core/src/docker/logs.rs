//! Log stream re-framing for the CLI runtime
//!
//! `docker logs` writes the two container streams to its own stdout and stderr.
//! The log demultiplexer expects the engine's multiplexed wire format, so the
//! output of the child process is packed back into frames: one byte stream kind,
//! three zero bytes, a big-endian `u32` payload length, then the payload.

use crate::errors::{Result, RuntimeError};
use crate::logs::{LogKind, HEADER_LEN};
use crate::runtime::{LogStream, LogStreamOptions};
use bytes::{BufMut, Bytes, BytesMut};
use chrono::SecondsFormat;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, trace};

const CHUNK: usize = 8 * 1024;
const PIPE_CAPACITY: usize = 64 * 1024;

/// Stream kind byte used in frame headers
fn kind_byte(kind: LogKind) -> u8 {
    match kind {
        LogKind::Stdout => 1,
        LogKind::Stderr => 2,
    }
}

/// Encode one frame
pub fn encode_frame(kind: LogKind, payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
    frame.put_u8(kind_byte(kind));
    frame.put_bytes(0, 3);
    frame.put_u32(payload.len() as u32);
    frame.put_slice(payload);
    frame.freeze()
}

/// Spawn `logs` for `id` and return its output as a framed stream.
///
/// The child is killed as soon as the returned stream is dropped, even when it
/// has been silent since.
pub(crate) fn spawn_reframed(
    runtime_path: &str,
    id: &str,
    options: LogStreamOptions,
) -> Result<LogStream> {
    let mut cmd = Command::new(runtime_path);
    cmd.arg("logs");
    if options.follow {
        cmd.arg("--follow");
    }
    if let Some(since) = options.since {
        cmd.arg("--since")
            .arg(since.to_rfc3339_opts(SecondsFormat::Nanos, true));
    }
    cmd.arg(id)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            RuntimeError::NotInstalled
        } else {
            RuntimeError::CLIError(format!("Failed to spawn log stream: {}", e))
        }
    })?;

    let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
        (Some(stdout), Some(stderr)) => (stdout, stderr),
        _ => {
            return Err(
                RuntimeError::CLIError("Log stream process has no output pipes".into()).into(),
            )
        }
    };

    let (stream, forward) = reframe(stdout, stderr);
    let container_id = id.to_string();
    tokio::spawn(async move {
        match forward.await {
            Ok(()) => debug!(container_id = %container_id, "Log process finished"),
            Err(e) => trace!(container_id = %container_id, error = %e, "Log pump stopped"),
        }
        reap(child).await;
    });

    Ok(Box::new(stream))
}

async fn reap(mut child: Child) {
    // Reader gone or output closed; the process has nothing left to say
    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// Framed read side of a log process; dropping it ends the forwarding future
struct ReframedStream {
    reader: DuplexStream,
    _dropped: oneshot::Sender<()>,
}

impl AsyncRead for ReframedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

/// Frame `stdout` and `stderr` into one stream.
///
/// The returned future forwards until both pipes close or the stream is
/// dropped, whichever comes first.
fn reframe<O, E>(
    stdout: O,
    stderr: E,
) -> (ReframedStream, impl Future<Output = std::io::Result<()>>)
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let (reader, writer) = tokio::io::duplex(PIPE_CAPACITY);
    let (dropped_tx, dropped_rx) = oneshot::channel::<()>();
    let forward = async move {
        tokio::select! {
            result = pump(stdout, stderr, writer) => result,
            _ = dropped_rx => {
                trace!("Log stream dropped by reader");
                Ok(())
            }
        }
    };
    (
        ReframedStream {
            reader,
            _dropped: dropped_tx,
        },
        forward,
    )
}

/// Copy both pipes into `writer` as frames until both reach EOF
async fn pump<O, E, W>(mut stdout: O, mut stderr: E, mut writer: W) -> std::io::Result<()>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut out_buf = vec![0u8; CHUNK];
    let mut err_buf = vec![0u8; CHUNK];
    let mut out_open = true;
    let mut err_open = true;

    while out_open || err_open {
        let (kind, read) = tokio::select! {
            read = stdout.read(&mut out_buf), if out_open => (LogKind::Stdout, read?),
            read = stderr.read(&mut err_buf), if err_open => (LogKind::Stderr, read?),
        };
        if read == 0 {
            match kind {
                LogKind::Stdout => out_open = false,
                LogKind::Stderr => err_open = false,
            }
            continue;
        }
        let payload = match kind {
            LogKind::Stdout => &out_buf[..read],
            LogKind::Stderr => &err_buf[..read],
        };
        writer.write_all(&encode_frame(kind, payload)).await?;
    }

    writer.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::decode_frame;

    #[test]
    fn test_encode_frame_header() {
        let frame = encode_frame(LogKind::Stderr, b"oops");
        assert_eq!(&frame[..HEADER_LEN], &[2, 0, 0, 0, 0, 0, 0, 4]);
        assert_eq!(&frame[HEADER_LEN..], b"oops");
    }

    #[tokio::test]
    async fn test_pump_frames_both_pipes() {
        let stdout: &[u8] = b"hello\n";
        let stderr: &[u8] = b"warning\n";
        let (mut reader, writer) = tokio::io::duplex(1024);

        pump(stdout, stderr, writer).await.unwrap();

        let mut raw = Vec::new();
        reader.read_to_end(&mut raw).await.unwrap();
        let mut buf = BytesMut::from(&raw[..]);
        let mut records = Vec::new();
        while let Some(record) = decode_frame(&mut buf) {
            records.push(record);
        }

        assert_eq!(records.len(), 2);
        let stdout_record = records.iter().find(|r| r.kind == LogKind::Stdout).unwrap();
        let stderr_record = records.iter().find(|r| r.kind == LogKind::Stderr).unwrap();
        assert_eq!(stdout_record.text(), "hello\n");
        assert_eq!(stderr_record.text(), "warning\n");
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_dropping_stream_ends_forwarding() {
        // Both pipes stay open and silent, as with an idle container
        let (_stdout_tx, stdout) = tokio::io::duplex(64);
        let (_stderr_tx, stderr) = tokio::io::duplex(64);
        let (stream, forward) = reframe(stdout, stderr);
        let forward = tokio::spawn(forward);

        drop(stream);
        tokio::time::timeout(std::time::Duration::from_secs(5), forward)
            .await
            .expect("forwarding outlived the stream")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_reframed_stream_reads_frames() {
        let stdout: &[u8] = b"out";
        let stderr: &[u8] = b"";
        let (mut stream, forward) = reframe(stdout, stderr);
        forward.await.unwrap();

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.unwrap();
        let mut buf = BytesMut::from(&raw[..]);
        assert_eq!(
            decode_frame(&mut buf),
            Some(crate::logs::LogRecord::new(LogKind::Stdout, &b"out"[..]))
        );
    }
}
