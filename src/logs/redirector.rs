use super::{LogSink, LogStream};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lines longer than this are written out in pieces
const MAX_LINE: usize = 64 * 1024;

/// Background copy of a child's stdout/stderr into its log sink
pub struct LogRedirector {
    task: JoinHandle<()>,
    cancel: CancellationToken,
}

impl LogRedirector {
    /// Start draining `stdout` and `stderr` into `sink`
    ///
    /// Both streams are read until they close or the redirector is cancelled.
    pub fn start<O, E>(stdout: O, stderr: E, sink: LogSink) -> Self
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let sink = Arc::new(Mutex::new(sink));

        let out = pump(stdout, LogStream::Stdout, sink.clone(), cancel.clone());
        let err = pump(stderr, LogStream::Stderr, sink, cancel.clone());

        let task = tokio::spawn(async move {
            tokio::join!(out, err);
        });

        Self { task, cancel }
    }

    /// Let the pumps drain for up to `grace`, then cancel and join them
    pub async fn finish(self, grace: Duration) {
        let Self { mut task, cancel } = self;

        if tokio::time::timeout(grace, &mut task).await.is_ok() {
            return;
        }

        debug!("Log streams still open after {:?}, cancelling", grace);
        cancel.cancel();
        if let Err(e) = task.await {
            if e.is_panic() {
                warn!("Log redirector task panicked: {}", e);
            }
        }
    }

    /// Whether both streams have closed
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

async fn pump<R>(
    reader: R,
    stream: LogStream,
    sink: Arc<Mutex<LogSink>>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => break,
            chunk = reader.fill_buf() => chunk,
        };

        let available = match chunk {
            Ok([]) => break,
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to read child {} stream: {}", stream, e);
                break;
            }
        };

        let (take, complete) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (available.len(), false),
        };
        pending.extend_from_slice(&available[..take]);
        reader.consume(take);

        if complete || pending.len() >= MAX_LINE {
            sink.lock().await.write(stream, &pending).await;
            pending.clear();
        }
    }

    if !pending.is_empty() {
        sink.lock().await.write(stream, &pending).await;
    }
}
