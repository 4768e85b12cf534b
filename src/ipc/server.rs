// IPC Server - Listens for client connections and handles requests

use crate::error::{ProcwardError, Result};
use crate::ipc::{Command, Request, Response, ResponseData};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// How long shutdown waits for connections that are still being served
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest request line the server will buffer
const MAX_REQUEST_BYTES: u64 = 1024 * 1024;

/// IPC server for handling client connections
pub struct IpcServer {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
}

impl IpcServer {
    /// Create a server for the socket at `path`
    pub fn with_socket_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            socket_path: path.as_ref().to_path_buf(),
            listener: None,
        }
    }

    /// Bind the Unix socket, replacing a stale socket file
    pub fn start(&mut self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| {
                ProcwardError::IpcError(format!("Failed to remove existing socket: {}", e))
            })?;
        }
        if let Some(parent) = self.socket_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let listener = UnixListener::bind(&self.socket_path)
            .map_err(|e| ProcwardError::IpcError(format!("Failed to bind to socket: {}", e)))?;

        // Set socket permissions to be accessible only by owner (0600)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.socket_path, permissions).map_err(|e| {
                ProcwardError::IpcError(format!("Failed to set socket permissions: {}", e))
            })?;
        }

        self.listener = Some(listener);
        Ok(())
    }

    /// Serve connections until `shutdown` is cancelled
    ///
    /// Each connection carries one request line and gets one response line.
    /// Connections are handled concurrently.
    pub async fn run<F, Fut>(&self, handler: F, shutdown: CancellationToken) -> Result<()>
    where
        F: Fn(Command) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ResponseData>> + Send + 'static,
    {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| ProcwardError::IpcError("Server not started".to_string()))?;
        let handler = Arc::new(handler);
        let mut connections = JoinSet::new();

        loop {
            let stream = tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(_) = connections.join_next() => continue,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => stream,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };

            let handler = Arc::clone(&handler);
            connections.spawn(async move {
                if let Err(e) = Self::handle_connection(stream, handler.as_ref()).await {
                    warn!("IPC connection failed: {}", e);
                }
            });
        }

        debug!("IPC server stopped accepting connections");
        // Let in-flight requests deliver their responses
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Dropping {} unfinished IPC connection(s)", connections.len());
        }
        Ok(())
    }

    async fn handle_connection<F, Fut>(stream: UnixStream, handler: &F) -> Result<()>
    where
        F: Fn(Command) -> Fut,
        Fut: Future<Output = Result<ResponseData>>,
    {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half.take(MAX_REQUEST_BYTES));
        let mut request_line = Vec::new();
        reader
            .read_until(b'\n', &mut request_line)
            .await
            .map_err(|e| ProcwardError::IpcError(format!("Failed to read request: {}", e)))?;

        let truncated =
            request_line.len() as u64 >= MAX_REQUEST_BYTES && !request_line.ends_with(b"\n");
        let response = if truncated {
            warn!("Rejecting IPC request larger than {} bytes", MAX_REQUEST_BYTES);
            Response::error(0, format!("Request exceeds {} bytes", MAX_REQUEST_BYTES))
        } else {
            Self::dispatch(&request_line, handler).await
        };

        let mut response_json = serde_json::to_string(&response).map_err(|e| {
            ProcwardError::SerializationError(format!("Failed to serialize response: {}", e))
        })?;
        response_json.push('\n');

        write_half
            .write_all(response_json.as_bytes())
            .await
            .map_err(|e| ProcwardError::IpcError(format!("Failed to write response: {}", e)))?;
        write_half
            .flush()
            .await
            .map_err(|e| ProcwardError::IpcError(format!("Failed to flush stream: {}", e)))?;

        Ok(())
    }

    async fn dispatch<F, Fut>(request_line: &[u8], handler: &F) -> Response
    where
        F: Fn(Command) -> Fut,
        Fut: Future<Output = Result<ResponseData>>,
    {
        match serde_json::from_slice::<Request>(request_line) {
            Ok(request) => {
                debug!("IPC request {}: {:?}", request.id, request.command);
                match handler(request.command).await {
                    Ok(data) => Response::success(request.id, data),
                    Err(e) => Response::error(request.id, e.to_string()),
                }
            }
            Err(e) => Response::error(0, format!("Failed to deserialize request: {}", e)),
        }
    }

    /// Stop listening and remove the socket file
    pub fn stop(&mut self) -> Result<()> {
        self.listener = None;

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| {
                ProcwardError::IpcError(format!("Failed to remove socket file: {}", e))
            })?;
        }

        Ok(())
    }

    /// Get the socket path being used
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if self.listener.is_some() {
            let _ = self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_server_start_stop() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("start_stop.sock");
        let mut server = IpcServer::with_socket_path(&socket_path);

        server.start().unwrap();
        assert!(socket_path.exists());

        server.stop().unwrap();
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_server_cleanup_on_drop() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("drop.sock");
        {
            let mut server = IpcServer::with_socket_path(&socket_path);
            server.start().unwrap();
            assert!(socket_path.exists());
        }
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_socket_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("perm.sock");
        let mut server = IpcServer::with_socket_path(&socket_path);
        server.start().unwrap();

        let mode = std::fs::metadata(&socket_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_oversized_request_is_rejected() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("big.sock");
        let mut server = IpcServer::with_socket_path(&socket_path);
        server.start().unwrap();

        let called = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&called);
        let shutdown = CancellationToken::new();
        let serving = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                server
                    .run(
                        move |_cmd| {
                            seen.store(true, Ordering::SeqCst);
                            async { Ok(ResponseData::Success("ok".to_string())) }
                        },
                        shutdown,
                    )
                    .await
            }
        });

        let stream = UnixStream::connect(&socket_path).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        // The server stops reading at the cap, so the tail of this write may fail
        let writer = tokio::spawn(async move {
            let body = vec![b'a'; MAX_REQUEST_BYTES as usize + 4096];
            let _ = write_half.write_all(&body).await;
        });

        let mut line = String::new();
        BufReader::new(read_half).read_line(&mut line).await.unwrap();
        let response: Response = serde_json::from_str(&line).unwrap();
        match response.result {
            Err(message) => assert!(message.contains("exceeds"), "got: {}", message),
            Ok(data) => panic!("unexpected response: {:?}", data),
        }
        assert!(!called.load(Ordering::SeqCst));

        writer.await.unwrap();
        shutdown.cancel();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_requires_start() {
        let temp_dir = TempDir::new().unwrap();
        let server = IpcServer::with_socket_path(temp_dir.path().join("idle.sock"));
        let result = server
            .run(
                |_cmd| async { Ok(ResponseData::Success("ok".to_string())) },
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(ProcwardError::IpcError(_))));
    }
}
