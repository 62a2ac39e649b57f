//! Log stream demultiplexing
//!
//! The engine delivers a container's stdout and stderr on one byte stream. Each
//! frame starts with an 8-byte header:
//!
//! ```text
//! [stream, 0, 0, 0, len_be_u32 ...] payload (len bytes)
//! ```
//!
//! `stream` is 1 for stdout and 2 for stderr; some engine versions also emit 3.
//! Anything but 2 is delivered as stdout. Each payload becomes one [`LogRecord`].
//!
//! Production runs as one spawned task per container. Decoding is buffered, so a
//! read that is interrupted by the window timeout or a stop request never loses
//! a partially received frame.

use crate::errors::{InternalError, LogError, Result, ScuttleError};
use crate::observability::{logs_produce_span, short_id};
use crate::runtime::{LogStream, LogStreamOptions, RuntimeClient};
use bytes::{Buf, Bytes, BytesMut};
use chrono::Utc;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument};

/// Size of a frame header
pub const HEADER_LEN: usize = 8;

pub const MIN_WINDOW: Duration = Duration::from_secs(5);
pub const MAX_WINDOW: Duration = Duration::from_secs(60);

/// Which stream a record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogKind {
    Stdout,
    Stderr,
}

impl LogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "STDOUT",
            Self::Stderr => "STDERR",
        }
    }
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub kind: LogKind,
    pub content: Bytes,
}

impl LogRecord {
    pub fn new(kind: LogKind, content: impl Into<Bytes>) -> Self {
        Self {
            kind,
            content: content.into(),
        }
    }

    /// Content as text, with invalid UTF-8 replaced
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.content)
    }
}

/// Receives every record of a production run, in stream order
pub trait LogConsumer: Send + Sync {
    fn accept(&self, record: &LogRecord);
}

impl<F> LogConsumer for F
where
    F: Fn(&LogRecord) + Send + Sync,
{
    fn accept(&self, record: &LogRecord) {
        self(record)
    }
}

/// Tuning for a production run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogProductionOptions {
    window: Duration,
}

impl Default for LogProductionOptions {
    fn default() -> Self {
        Self { window: MIN_WINDOW }
    }
}

impl LogProductionOptions {
    /// Per-read deadline, clamped to `[5s, 60s]`
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window.clamp(MIN_WINDOW, MAX_WINDOW);
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Consumers plus options, as attached to a container spec
#[derive(Clone, Default)]
pub struct LogConfig {
    pub consumers: Vec<Arc<dyn LogConsumer>>,
    pub options: LogProductionOptions,
}

impl LogConfig {
    pub fn with_consumer(mut self, consumer: impl LogConsumer + 'static) -> Self {
        self.consumers.push(Arc::new(consumer));
        self
    }

    pub fn with_options(mut self, options: LogProductionOptions) -> Self {
        self.options = options;
        self
    }
}

impl fmt::Debug for LogConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogConfig")
            .field("consumers", &self.consumers.len())
            .field("options", &self.options)
            .finish()
    }
}

/// Decode the next non-empty record from `buf`.
///
/// Returns `None` when `buf` does not hold a complete frame yet; the partial
/// frame stays in `buf`. Zero-length frames are consumed and skipped whatever
/// their stream byte. Stream 2 is stderr and every other value is stdout.
/// Header bytes 1 to 3 are ignored.
pub fn decode_frame(buf: &mut BytesMut) -> Option<LogRecord> {
    loop {
        if buf.len() < HEADER_LEN {
            return None;
        }

        let len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        if len == 0 {
            buf.advance(HEADER_LEN);
            continue;
        }
        if buf.len() < HEADER_LEN + len {
            buf.reserve(HEADER_LEN + len - buf.len());
            return None;
        }

        let kind = match buf[0] {
            2 => LogKind::Stderr,
            1 | 3 => LogKind::Stdout,
            other => {
                warn!(stream = other, "Unknown log stream type; delivering as stdout");
                LogKind::Stdout
            }
        };
        buf.advance(HEADER_LEN);
        let content = buf.split_to(len).freeze();
        return Some(LogRecord { kind, content });
    }
}

fn is_connection_closed(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

struct ActiveProduction {
    stop: oneshot::Sender<()>,
    task: JoinHandle<Result<()>>,
    /// Flips to `true` once the loop has returned
    finished: watch::Receiver<bool>,
}

impl ActiveProduction {
    async fn join(self) -> Result<()> {
        Self::join_task(self.task).await
    }

    async fn join_task(task: JoinHandle<Result<()>>) -> Result<()> {
        task.await.map_err(|e| {
            ScuttleError::from(InternalError::Join {
                message: e.to_string(),
            })
        })?
    }
}

/// Per-container production control: at most one loop, a stop signal, and the
/// loop's terminal result as the error slot
#[derive(Default)]
pub(crate) struct LogProduction {
    active: Mutex<Option<ActiveProduction>>,
}

impl LogProduction {
    pub(crate) async fn start(
        &self,
        runtime: Arc<dyn RuntimeClient>,
        container_id: String,
        consumers: Vec<Arc<dyn LogConsumer>>,
        options: LogProductionOptions,
    ) -> Result<()> {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            if !previous.task.is_finished() {
                *active = Some(previous);
                return Err(LogError::AlreadyActive { container_id }.into());
            }
            // Nobody collected the previous run's result; it ends here
            if let Err(error) = previous.join().await {
                warn!(container_id = %short_id(&container_id), %error, "Previous log production had failed");
            }
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let (finished_tx, finished_rx) = watch::channel(false);
        let span = logs_produce_span(&container_id);
        let task = tokio::spawn(
            async move {
                let result = produce(runtime, container_id, consumers, options.window(), stop_rx).await;
                let _ = finished_tx.send(true);
                result
            }
            .instrument(span),
        );
        *active = Some(ActiveProduction {
            stop: stop_tx,
            task,
            finished: finished_rx,
        });
        Ok(())
    }

    /// Signal the loop, wait for it to exit and return its terminal error, if any
    pub(crate) async fn stop(&self) -> Result<()> {
        let Some(production) = self.active.lock().await.take() else {
            return Ok(());
        };
        // The loop may already have ended on its own
        let ActiveProduction { stop, task, .. } = production;
        let _ = stop.send(());
        ActiveProduction::join_task(task).await
    }

    /// Wait for the loop to end on its own, then collect its terminal error.
    ///
    /// Returns immediately when nothing is producing.
    pub(crate) async fn finished(&self) -> Result<()> {
        let finished = match self.active.lock().await.as_ref() {
            Some(production) => production.finished.clone(),
            None => return Ok(()),
        };
        wait_finished(finished.clone()).await;

        let mut active = self.active.lock().await;
        // A stop or a restart may have got here first
        match active.as_ref() {
            Some(production) if production.finished.same_channel(&finished) => {}
            _ => return Ok(()),
        }
        match active.take() {
            Some(production) => production.join().await,
            None => Ok(()),
        }
    }

    pub(crate) async fn is_active(&self) -> bool {
        matches!(&*self.active.lock().await, Some(production) if !production.task.is_finished())
    }
}

async fn wait_finished(mut finished: watch::Receiver<bool>) {
    while !*finished.borrow_and_update() {
        // A dropped sender means the task is gone too
        if finished.changed().await.is_err() {
            return;
        }
    }
}

async fn open(
    runtime: &dyn RuntimeClient,
    container_id: &str,
    since: Option<chrono::DateTime<Utc>>,
) -> Result<LogStream> {
    runtime
        .open_log_stream(
            container_id,
            LogStreamOptions {
                since,
                follow: true,
            },
        )
        .await
}

async fn produce(
    runtime: Arc<dyn RuntimeClient>,
    container_id: String,
    consumers: Vec<Arc<dyn LogConsumer>>,
    window: Duration,
    mut stop: oneshot::Receiver<()>,
) -> Result<()> {
    let desync = |message: String| -> ScuttleError {
        LogError::Desync {
            container_id: container_id.clone(),
            message,
        }
        .into()
    };

    let mut stream = open(runtime.as_ref(), &container_id, None).await?;
    let mut buf = BytesMut::with_capacity(8 * 1024);
    debug!("Log production started");

    loop {
        while let Some(record) = decode_frame(&mut buf) {
            for consumer in &consumers {
                consumer.accept(&record);
            }
        }

        tokio::select! {
            biased;
            // A dropped sender (handle gone) stops the loop too
            _ = &mut stop => {
                debug!("Log production stopped");
                return Ok(());
            }
            read = tokio::time::timeout(window, stream.read_buf(&mut buf)) => match read {
                Err(_elapsed) => continue,
                Ok(Ok(0)) if buf.is_empty() => {
                    debug!("Log stream ended");
                    return Ok(());
                }
                Ok(Ok(0)) => {
                    return Err(desync(format!(
                        "stream ended inside a frame ({} bytes pending)",
                        buf.len()
                    )));
                }
                Ok(Ok(_)) => continue,
                Ok(Err(e)) if is_connection_closed(&e) => {
                    let since = Utc::now();
                    warn!(
                        container_id = %short_id(&container_id),
                        error = %e,
                        %since,
                        "Log stream closed; reopening"
                    );
                    buf.clear();
                    stream = open(runtime.as_ref(), &container_id, Some(since)).await?;
                }
                Ok(Err(e)) if matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::TimedOut) => {
                    continue;
                }
                Ok(Err(e)) => return Err(desync(e.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(stream: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![stream, 0, 0, 0];
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_decode_stdout_frame() {
        let mut buf = BytesMut::from(&[1u8, 0, 0, 0, 0, 0, 0, 5, b'h', b'e', b'l', b'l', b'o'][..]);
        let record = decode_frame(&mut buf).unwrap();
        assert_eq!(record.kind, LogKind::Stdout);
        assert_eq!(&record.content[..], b"hello");
        assert!(buf.is_empty());
        assert_eq!(decode_frame(&mut buf), None);
    }

    #[test]
    fn test_zero_length_frame_is_skipped() {
        let mut bytes = frame(1, b"");
        bytes.extend(frame(2, b"err"));
        let mut buf = BytesMut::from(&bytes[..]);
        let record = decode_frame(&mut buf).unwrap();
        assert_eq!(record, LogRecord::new(LogKind::Stderr, &b"err"[..]));
        assert_eq!(decode_frame(&mut buf), None);
    }

    #[test]
    fn test_zero_length_frame_with_odd_header_is_skipped() {
        let mut bytes = frame(9, b"");
        bytes.extend(frame(1, b"ok"));
        let mut buf = BytesMut::from(&bytes[..]);
        assert_eq!(
            decode_frame(&mut buf),
            Some(LogRecord::new(LogKind::Stdout, &b"ok"[..]))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_type_three_is_stdout() {
        let mut buf = BytesMut::from(&frame(3, b"odd")[..]);
        let record = decode_frame(&mut buf).unwrap();
        assert_eq!(record.kind, LogKind::Stdout);
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let full = frame(2, b"partial");
        let mut buf = BytesMut::from(&full[..10]);
        assert_eq!(decode_frame(&mut buf), None);
        assert_eq!(buf.len(), 10);
        buf.extend_from_slice(&full[10..]);
        assert_eq!(
            decode_frame(&mut buf),
            Some(LogRecord::new(LogKind::Stderr, &b"partial"[..]))
        );
    }

    #[test]
    fn test_unknown_stream_types_are_stdout() {
        for stream in [0u8, 4, 7, 255] {
            let mut buf = BytesMut::from(&frame(stream, b"hi")[..]);
            assert_eq!(
                decode_frame(&mut buf),
                Some(LogRecord::new(LogKind::Stdout, &b"hi"[..])),
                "stream type {stream}"
            );
        }
        let mut buf = BytesMut::from(&frame(2, b"hi")[..]);
        assert_eq!(decode_frame(&mut buf).unwrap().kind, LogKind::Stderr);
    }

    #[test]
    fn test_reserved_header_bytes_are_ignored() {
        let mut buf = BytesMut::from(&[1u8, 0, 0, 1, 0, 0, 0, 2, b'h', b'i'][..]);
        assert_eq!(
            decode_frame(&mut buf),
            Some(LogRecord::new(LogKind::Stdout, &b"hi"[..]))
        );
    }

    #[test]
    fn test_window_is_clamped() {
        assert_eq!(LogProductionOptions::default().window(), MIN_WINDOW);
        let opts = LogProductionOptions::default().with_window(Duration::from_secs(1));
        assert_eq!(opts.window(), MIN_WINDOW);
        let opts = LogProductionOptions::default().with_window(Duration::from_secs(600));
        assert_eq!(opts.window(), MAX_WINDOW);
        let opts = LogProductionOptions::default().with_window(Duration::from_secs(20));
        assert_eq!(opts.window(), Duration::from_secs(20));
    }

    #[test]
    fn test_closure_consumer() {
        let seen = std::sync::Mutex::new(Vec::new());
        let consumer = |record: &LogRecord| seen.lock().unwrap().push(record.text().into_owned());
        consumer.accept(&LogRecord::new(LogKind::Stdout, &b"line"[..]));
        assert_eq!(seen.lock().unwrap().as_slice(), ["line".to_string()]);
    }
}
