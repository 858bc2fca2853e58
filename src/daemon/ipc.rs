//! IPC server for the guard daemon.
//!
//! This module provides Unix Domain Socket IPC functionality:
//! - Server that listens on a Unix socket
//! - One JSON request per connection, answered with one JSON response
//! - Dispatch of requests to any [`EngineBackend`]
//! - Forwarding of bus messages to subscribed clients, one JSON line each

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::{timeout, Duration};

use crate::backend::EngineBackend;
use crate::bus::{BusSubscriber, EventBus};
use crate::error::GuardError;
use crate::types::{IpcRequest, IpcResponse};

// ============================================================================
// Constants
// ============================================================================

/// Maximum request size in bytes (1MB)
pub const MAX_REQUEST_SIZE: u64 = 1024 * 1024;

/// Read timeout in seconds
const READ_TIMEOUT_SECS: u64 = 5;

// ============================================================================
// IpcError
// ============================================================================

/// IPC-specific error types.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// Read error
    #[error("Failed to read request: {0}")]
    ReadError(String),

    /// Timeout error
    #[error("Operation timed out")]
    Timeout,

    /// Request too large
    #[error("Request too large (max {MAX_REQUEST_SIZE} bytes)")]
    RequestTooLarge,
}

// ============================================================================
// IpcServer
// ============================================================================

/// Unix Domain Socket IPC server.
pub struct IpcServer {
    /// Unix socket listener
    listener: UnixListener,
    /// Socket path (for cleanup)
    socket_path: PathBuf,
}

impl IpcServer {
    /// Creates a new IPC server bound to the specified socket path.
    ///
    /// If the socket file already exists, it will be removed before binding.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound.
    pub fn new(socket_path: &Path) -> Result<Self> {
        if socket_path.exists() {
            std::fs::remove_file(socket_path)
                .with_context(|| format!("Failed to remove existing socket: {:?}", socket_path))?;
        }

        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create socket directory: {:?}", parent))?;
        }

        let listener = UnixListener::bind(socket_path)
            .with_context(|| format!("Failed to bind Unix socket: {:?}", socket_path))?;

        tracing::info!(path = %socket_path.display(), "listening");
        Ok(Self {
            listener,
            socket_path: socket_path.to_path_buf(),
        })
    }

    /// Accepts an incoming client connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be accepted.
    pub async fn accept(&self) -> Result<UnixStream> {
        let (stream, _addr) = self
            .listener
            .accept()
            .await
            .context("Failed to accept connection")?;
        Ok(stream)
    }

    /// Receives and deserializes an IPC request from the stream.
    ///
    /// The client signals the end of its request by shutting down its write
    /// half. Applies a read timeout to prevent blocking indefinitely.
    ///
    /// # Errors
    ///
    /// Returns an error if reading or deserialization fails.
    pub async fn receive_request(stream: &mut UnixStream) -> Result<IpcRequest> {
        let mut buffer = Vec::new();
        let mut limited = (&mut *stream).take(MAX_REQUEST_SIZE + 1);

        let read_result = timeout(
            Duration::from_secs(READ_TIMEOUT_SECS),
            limited.read_to_end(&mut buffer),
        )
        .await;

        match read_result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(IpcError::ReadError(e.to_string()).into()),
            Err(_) => return Err(IpcError::Timeout.into()),
        }

        if buffer.len() as u64 > MAX_REQUEST_SIZE {
            return Err(IpcError::RequestTooLarge.into());
        }
        if buffer.is_empty() {
            anyhow::bail!("Connection closed by client");
        }

        let request: IpcRequest =
            serde_json::from_slice(&buffer).with_context(|| "Failed to deserialize IPC request")?;

        Ok(request)
    }

    /// Serializes and sends an IPC response to the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub async fn send_response(stream: &mut UnixStream, response: &IpcResponse) -> Result<()> {
        let json = serde_json::to_vec(response).context("Failed to serialize IPC response")?;

        stream
            .write_all(&json)
            .await
            .context("Failed to write response")?;
        stream.flush().await.context("Failed to flush response")?;
        stream
            .shutdown()
            .await
            .context("Failed to close response stream")?;

        Ok(())
    }

    /// Returns the socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

// ============================================================================
// RequestHandler
// ============================================================================

/// Handles IPC requests by dispatching to an engine.
pub struct RequestHandler<B> {
    backend: Arc<B>,
    events: Option<EventBus>,
}

impl<B: EngineBackend> RequestHandler<B> {
    /// Creates a new request handler over `backend`.
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            events: None,
        }
    }

    /// Lets clients subscribe to `bus`.
    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    /// Reads one request from `stream` and answers it. A subscription keeps
    /// the stream open and hands it to a forwarding task.
    ///
    /// # Errors
    ///
    /// Returns an error if the response could not be written.
    pub async fn serve(&self, mut stream: UnixStream) -> Result<()> {
        let response = match IpcServer::receive_request(&mut stream).await {
            Ok(IpcRequest::Subscribe) => return self.subscribe(stream).await,
            Ok(request) => self.handle(request).await,
            Err(e) => {
                tracing::warn!(error = %e, "bad request");
                IpcResponse::error(format!("{e:#}"))
            }
        };
        IpcServer::send_response(&mut stream, &response).await
    }

    async fn subscribe(&self, mut stream: UnixStream) -> Result<()> {
        let Some(bus) = &self.events else {
            let response = IpcResponse::error("Event forwarding is not enabled");
            return IpcServer::send_response(&mut stream, &response).await;
        };

        let subscriber = bus.subscribe();
        write_line(&mut stream, &IpcResponse::success("Subscribed", None)).await?;
        tracing::info!(subscribers = bus.subscriber_count(), "event subscriber attached");
        tokio::spawn(forward_events(stream, subscriber));
        Ok(())
    }

    /// Handles an IPC request and returns the appropriate response.
    pub async fn handle(&self, request: IpcRequest) -> IpcResponse {
        let b = &self.backend;
        tracing::debug!(?request, "handling");

        match request {
            IpcRequest::ReadBlockData => respond("", b.read_block_data().await),
            IpcRequest::WriteBlockData { data } => {
                acknowledge("Block list saved", b.write_block_data(&data).await)
            }
            IpcRequest::ListInstalledApps => respond("", b.list_installed_apps().await),
            IpcRequest::GetChangeStatus { setting_id } => {
                respond("", b.get_change_status(&setting_id).await)
            }
            IpcRequest::StartCountdown {
                setting_id,
                remaining_time,
                target_timeout,
            } => match b
                .start_countdown(&setting_id, remaining_time, target_timeout)
                .await
            {
                Ok(()) => respond(
                    format!("Countdown running for {setting_id}"),
                    b.get_change_status(&setting_id).await,
                ),
                Err(e) => IpcResponse::from_error(&e),
            },
            IpcRequest::CancelCountdown { setting_id } => acknowledge(
                format!("Countdown cancelled for {setting_id}"),
                b.cancel_countdown(&setting_id).await,
            ),
            IpcRequest::PrimeForDeletion { item_type, name } => acknowledge(
                format!("Unblock delay started for {item_type} '{name}'"),
                b.prime_for_deletion(item_type, &name).await,
            ),
            IpcRequest::ReadPreference { key } => respond("", b.read_preference(&key).await),
            IpcRequest::SavePreference { key, value } => acknowledge(
                format!("Saved {key}"),
                b.save_preference(&key, &value).await,
            ),
            IpcRequest::CloseConfirmationDialog => acknowledge(
                "Confirmation dialog close requested",
                b.close_confirmation_dialog().await,
            ),
            IpcRequest::CloseOverlayWindow => {
                acknowledge("Overlay close requested", b.close_overlay_window().await)
            }
            IpcRequest::CloseApp { process_name } => respond(
                format!("Close requested for {process_name}"),
                b.close_app(&process_name).await,
            ),
            IpcRequest::Subscribe => {
                IpcResponse::error("Subscriptions need a connection of their own")
            }
        }
    }
}

/// Writes every message published on the bus to `stream` until the client
/// goes away or the bus closes.
async fn forward_events(mut stream: UnixStream, mut subscriber: BusSubscriber) {
    while let Some(message) = subscriber.recv().await {
        if let Err(e) = write_line(&mut stream, &message).await {
            tracing::debug!(event = message.name(), error = %e, "event subscriber detached");
            return;
        }
    }
}

async fn write_line<T: Serialize>(stream: &mut UnixStream, value: &T) -> Result<()> {
    let mut line = serde_json::to_vec(value).context("Failed to serialize line")?;
    line.push(b'\n');
    stream.write_all(&line).await.context("Failed to write line")?;
    stream.flush().await.context("Failed to flush line")?;
    Ok(())
}

fn respond<T: Serialize>(message: impl Into<String>, result: Result<T, GuardError>) -> IpcResponse {
    match result.and_then(|value| serde_json::to_value(value).map_err(GuardError::from)) {
        Ok(data) => IpcResponse::success(message, Some(data)),
        Err(e) => {
            tracing::warn!(error = %e, "request failed");
            IpcResponse::from_error(&e)
        }
    }
}

fn acknowledge(message: impl Into<String>, result: Result<(), GuardError>) -> IpcResponse {
    match result {
        Ok(()) => IpcResponse::success(message, None),
        Err(e) => {
            tracing::warn!(error = %e, "request failed");
            IpcResponse::from_error(&e)
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
