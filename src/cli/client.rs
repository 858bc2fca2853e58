//! IPC Client for communicating with the guard daemon.
//!
//! This module provides:
//! - Unix Domain Socket client
//! - Request/response handling
//! - Timeout handling
//! - [`EngineBackend`] over the socket
//!
//! The client never retries. Reads are retried by the store that wraps it;
//! mutating commands are never retried at all.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;
use tokio::time::timeout;

use crate::backend::EngineBackend;
use crate::bus::BusMessage;
use crate::error::GuardError;
use crate::types::{BlockData, ChangeStatus, InstalledApp, IpcRequest, IpcResponse, ItemKind, SettingKey};

// ============================================================================
// Constants
// ============================================================================

/// Connection timeout in seconds
const CONNECTION_TIMEOUT_SECS: u64 = 5;

/// Read/write timeout in seconds
const IO_TIMEOUT_SECS: u64 = 5;

/// Maximum response size in bytes (1MB)
const MAX_RESPONSE_SIZE: u64 = 1024 * 1024;

// ============================================================================
// IpcClient
// ============================================================================

/// IPC client for daemon communication.
#[derive(Debug, Clone)]
pub struct IpcClient {
    /// Socket path
    socket_path: PathBuf,
    /// Connection timeout
    timeout: Duration,
}

impl IpcClient {
    /// Creates a new IPC client with a custom socket path.
    pub fn with_socket_path(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            timeout: Duration::from_secs(CONNECTION_TIMEOUT_SECS),
        }
    }

    /// Returns the socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Sends a single request to the daemon and returns its raw response.
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon cannot be reached or answers with
    /// something that is not a response.
    pub async fn send_request(&self, request: &IpcRequest) -> Result<IpcResponse> {
        let mut stream = self.open(request).await?;

        let mut buffer = Vec::new();
        let mut limited = (&mut stream).take(MAX_RESPONSE_SIZE);
        timeout(
            Duration::from_secs(IO_TIMEOUT_SECS),
            limited.read_to_end(&mut buffer),
        )
        .await
        .context("Read timed out")?
        .context("Failed to receive response")?;

        if buffer.is_empty() {
            anyhow::bail!("The daemon closed the connection without answering");
        }

        let response: IpcResponse =
            serde_json::from_slice(&buffer).context("Failed to parse response")?;
        Ok(response)
    }

    /// Subscribes to the daemon's bus. Every message the daemon publishes
    /// from now on arrives on the returned stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon cannot be reached or refuses.
    pub async fn subscribe(&self) -> Result<EventStream> {
        let stream = self.open(&IpcRequest::Subscribe).await?;
        let mut lines = BufReader::new(stream).lines();

        let ack = timeout(Duration::from_secs(IO_TIMEOUT_SECS), lines.next_line())
            .await
            .context("Read timed out")?
            .context("Failed to receive response")?
            .context("The daemon closed the connection without answering")?;
        let response: IpcResponse =
            serde_json::from_str(&ack).context("Failed to parse response")?;
        if response.is_error() {
            anyhow::bail!("Subscription refused: {}", response.message);
        }

        tracing::debug!("subscribed to daemon events");
        Ok(EventStream { lines })
    }

    /// Connects and sends `request`, leaving the read half open.
    async fn open(&self, request: &IpcRequest) -> Result<UnixStream> {
        // Connect with timeout
        let mut stream = timeout(self.timeout, UnixStream::connect(&self.socket_path))
            .await
            .context("Connection timed out")?
            .with_context(|| {
                format!(
                    "Cannot connect to the daemon at {:?}. Start it with 'eagle-guard daemon'",
                    self.socket_path
                )
            })?;

        let request_json = serde_json::to_vec(request).context("Failed to serialize request")?;

        timeout(
            Duration::from_secs(IO_TIMEOUT_SECS),
            stream.write_all(&request_json),
        )
        .await
        .context("Write timed out")?
        .context("Failed to send request")?;

        // Shutdown write side to signal end of request
        stream
            .shutdown()
            .await
            .context("Failed to finish request")?;

        Ok(stream)
    }

    /// Sends `request` and returns the payload of a successful response.
    async fn call(
        &self,
        command: &'static str,
        request: IpcRequest,
    ) -> Result<Option<Value>, GuardError> {
        let is_read = request.is_read_only();
        let response = self.send_request(&request).await.map_err(|e| {
            tracing::debug!(command, error = %e, "transport failure");
            GuardError::Transport(format!("{e:#}"))
        })?;

        if response.is_error() {
            return Err(response.to_error(command, is_read));
        }
        Ok(response.data)
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        command: &'static str,
        request: IpcRequest,
    ) -> Result<T, GuardError> {
        let data = self
            .call(command, request)
            .await?
            .ok_or_else(|| GuardError::fetch(command, "response carried no data"))?;
        serde_json::from_value(data).map_err(|e| GuardError::fetch(command, e.to_string()))
    }
}

// ============================================================================
// EventStream
// ============================================================================

/// Bus messages forwarded by the daemon, one JSON object per line.
#[derive(Debug)]
pub struct EventStream {
    lines: Lines<BufReader<UnixStream>>,
}

impl EventStream {
    /// Waits for the next message. Returns `None` once the daemon goes away.
    pub async fn next(&mut self) -> Option<BusMessage> {
        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) => match serde_json::from_str(&line) {
                    Ok(message) => return Some(message),
                    Err(e) => tracing::warn!(error = %e, "skipping unreadable event"),
                },
                Ok(None) => return None,
                Err(e) => {
                    tracing::debug!(error = %e, "event stream failed");
                    return None;
                }
            }
        }
    }
}

impl EngineBackend for IpcClient {
    async fn read_block_data(&self) -> Result<BlockData, GuardError> {
        self.fetch("read_block_data", IpcRequest::ReadBlockData).await
    }

    async fn write_block_data(&self, data: &BlockData) -> Result<(), GuardError> {
        self.call(
            "write_block_data",
            IpcRequest::WriteBlockData { data: data.clone() },
        )
        .await
        .map(drop)
    }

    async fn list_installed_apps(&self) -> Result<Vec<InstalledApp>, GuardError> {
        self.fetch("list_installed_apps", IpcRequest::ListInstalledApps)
            .await
    }

    async fn get_change_status(&self, key: &SettingKey) -> Result<ChangeStatus, GuardError> {
        self.fetch(
            "get_change_status",
            IpcRequest::GetChangeStatus {
                setting_id: key.clone(),
            },
        )
        .await
    }

    async fn start_countdown(
        &self,
        key: &SettingKey,
        remaining_ms: Option<u64>,
        target: Option<u64>,
    ) -> Result<(), GuardError> {
        self.call(
            "start_countdown",
            IpcRequest::StartCountdown {
                setting_id: key.clone(),
                remaining_time: remaining_ms,
                target_timeout: target,
            },
        )
        .await
        .map(drop)
    }

    async fn cancel_countdown(&self, key: &SettingKey) -> Result<(), GuardError> {
        self.call(
            "cancel_countdown",
            IpcRequest::CancelCountdown {
                setting_id: key.clone(),
            },
        )
        .await
        .map(drop)
    }

    async fn prime_for_deletion(&self, kind: ItemKind, name: &str) -> Result<(), GuardError> {
        self.call(
            "prime_for_deletion",
            IpcRequest::PrimeForDeletion {
                item_type: kind,
                name: name.to_string(),
            },
        )
        .await
        .map(drop)
    }

    async fn read_preference(&self, key: &str) -> Result<Value, GuardError> {
        let data = self
            .call(
                "read_preference",
                IpcRequest::ReadPreference {
                    key: key.to_string(),
                },
            )
            .await?;
        Ok(data.unwrap_or(Value::Null))
    }

    async fn save_preference(&self, key: &str, value: &Value) -> Result<(), GuardError> {
        self.call(
            "save_preference",
            IpcRequest::SavePreference {
                key: key.to_string(),
                value: value.clone(),
            },
        )
        .await
        .map(drop)
    }

    async fn close_confirmation_dialog(&self) -> Result<(), GuardError> {
        self.call("close_confirmation_dialog", IpcRequest::CloseConfirmationDialog)
            .await
            .map(drop)
    }

    async fn close_overlay_window(&self) -> Result<(), GuardError> {
        self.call("close_overlay_window", IpcRequest::CloseOverlayWindow)
            .await
            .map(drop)
    }

    async fn close_app(&self, process_name: &str) -> Result<bool, GuardError> {
        let data = self
            .call(
                "close_app",
                IpcRequest::CloseApp {
                    process_name: process_name.to_string(),
                },
            )
            .await?;
        Ok(data.as_ref().and_then(Value::as_bool).unwrap_or(false))
    }
}

// ============================================================================
// Tests
// ============================================================================
