//! QMP (QEMU Machine Protocol) client: a thin JSON-lines-over-Unix-socket
//! reader/writer (§4.5 "Lifecycle control via QMP").
//!
//! No HTTP framework is involved here — this is the one place in the Runner
//! that talks a plain line-delimited socket protocol directly, so the
//! client stays a bare `UnixStream` reader/writer rather than reaching for
//! an RPC crate.

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::{timeout, Duration};

use crate::error::VmError;

pub struct QmpClient {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl QmpClient {
    /// Connect to a QMP Unix socket and complete the capabilities handshake.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::Qmp`] if the socket cannot be reached or the
    /// handshake does not complete.
    pub async fn connect(socket_path: &str) -> Result<Self, VmError> {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(|err| VmError::Qmp(format!("connect {socket_path}: {err}")))?;
        let (read_half, write_half) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        };

        // QEMU greets with a banner line before accepting commands.
        client.read_line().await?;
        client.send(json!({"execute": "qmp_capabilities"})).await?;
        Ok(client)
    }

    async fn read_line(&mut self) -> Result<Value, VmError> {
        let mut line = String::new();
        timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .map_err(|_| VmError::Qmp("timed out waiting for qmp response".to_owned()))?
            .map_err(|err| VmError::Qmp(err.to_string()))?;
        serde_json::from_str(line.trim()).map_err(|err| VmError::Qmp(err.to_string()))
    }

    async fn send(&mut self, command: Value) -> Result<Value, VmError> {
        let mut line = command.to_string();
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|err| VmError::Qmp(err.to_string()))?;

        // Skip any asynchronous event lines until the command's own reply.
        loop {
            let reply = self.read_line().await?;
            if reply.get("return").is_some() || reply.get("error").is_some() {
                if let Some(error) = reply.get("error") {
                    return Err(VmError::Qmp(error.to_string()));
                }
                return Ok(reply);
            }
        }
    }

    /// Request a graceful ACPI shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::Qmp`] if the command is rejected.
    pub async fn system_powerdown(&mut self) -> Result<(), VmError> {
        self.send(json!({"execute": "system_powerdown"})).await?;
        Ok(())
    }

    /// Request a guest reset.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::Qmp`] if the command is rejected.
    pub async fn system_reset(&mut self) -> Result<(), VmError> {
        self.send(json!({"execute": "system_reset"})).await?;
        Ok(())
    }

    /// Query whether the QEMU process is still responsive.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::Qmp`] if the query fails.
    pub async fn query_status(&mut self) -> Result<String, VmError> {
        let reply = self.send(json!({"execute": "query-status"})).await?;
        Ok(reply
            .get("return")
            .and_then(|r| r.get("status"))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_owned())
    }
}
