//! Async wrapper around the blocking client.
//!
//! Each call runs on tokio's blocking pool. Calls still serialize in the
//! request engine, so at most one exchange is ever outstanding.

use serde::Serialize;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use crate::bpio::packet::{
    ConfigurationRequest, MessageCodec, PostcardCodec, RequestContents, ResponseContents,
    StatusResponse,
};
use crate::bpio::{
    BpioClient, BpioError, BpioResult, ClientConfig, ModeKind, ModeState, ReadSummary,
    SerialTransport, TransferEvent, Transport, WriteSummary,
};

/// Progress event forwarded to async callers during flash transfers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgressEvent {
    /// Current stage name.
    pub stage: String,
    /// Bytes done (chunk and failure events).
    pub offset: Option<usize>,
    /// Total bytes (all but the erase event).
    pub total: Option<usize>,
    /// Progress percentage (0-100).
    pub percent: f32,
    /// Human-readable message.
    pub message: String,
    /// Whether this is the last event of the job.
    pub terminal: bool,
}

impl From<TransferEvent> for TransferProgressEvent {
    fn from(event: TransferEvent) -> Self {
        let (stage_name, offset, total) = match &event {
            TransferEvent::Erasing => ("erasing", None, None),
            TransferEvent::Chunk { offset, total } => ("transferring", Some(*offset), Some(*total)),
            TransferEvent::Complete { total } => ("complete", Some(*total), Some(*total)),
            TransferEvent::Failed { offset, total } => ("failed", Some(*offset), Some(*total)),
        };

        Self {
            stage: stage_name.to_string(),
            offset,
            total,
            percent: event.percent(),
            message: event.message(),
            terminal: event.is_terminal(),
        }
    }
}

/// Shared client whose operations can be awaited.
pub struct AsyncClient<T: Transport + 'static = SerialTransport> {
    client: Arc<BpioClient<T>>,
}

impl<T: Transport + 'static> Clone for AsyncClient<T> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
        }
    }
}

impl AsyncClient<SerialTransport> {
    /// Open the BPIO2 port at `port_name` on the blocking pool, using the
    /// postcard codec.
    pub async fn open(port_name: String, config: ClientConfig) -> BpioResult<Self> {
        Self::open_with_codec(port_name, Box::new(PostcardCodec), config).await
    }

    /// Open the BPIO2 port at `port_name` on the blocking pool, encoding
    /// messages with `codec`.
    pub async fn open_with_codec(
        port_name: String,
        codec: Box<dyn MessageCodec>,
        config: ClientConfig,
    ) -> BpioResult<Self> {
        let client = tokio::task::spawn_blocking(move || {
            BpioClient::open_with_codec(&port_name, codec, &config)
        })
        .await
        .map_err(|e| task_error("open", e))??;
        Ok(Self::new(client))
    }
}

impl<T: Transport + 'static> AsyncClient<T> {
    pub fn new(client: BpioClient<T>) -> Self {
        Self {
            client: Arc::new(client),
        }
    }

    /// The wrapped blocking client.
    pub fn blocking(&self) -> &BpioClient<T> {
        &self.client
    }

    pub fn state(&self) -> ModeState {
        self.client.state()
    }

    pub async fn status(&self) -> BpioResult<StatusResponse> {
        self.run("status", |client| client.status()).await
    }

    pub async fn configure(&self, request: ConfigurationRequest) -> BpioResult<()> {
        self.run("configure", move |client| client.configure(request))
            .await
    }

    pub async fn enter_mode(&self, kind: ModeKind, request: ConfigurationRequest) -> BpioResult<()> {
        self.run("enter_mode", move |client| client.enter_mode(kind, request))
            .await
    }

    pub async fn exit_mode(&self) -> BpioResult<()> {
        self.run("exit_mode", |client| client.exit_mode()).await
    }

    pub async fn send_command(&self, request: RequestContents) -> BpioResult<ResponseContents> {
        self.run("send_command", move |client| client.send_command(request))
            .await
    }

    /// Read `size` bytes of flash, forwarding progress to `progress` if given.
    pub async fn read_flash(
        &self,
        size: usize,
        chunk_size: Option<usize>,
        progress: Option<Sender<TransferProgressEvent>>,
    ) -> BpioResult<(Vec<u8>, ReadSummary)> {
        self.run("read_flash", move |client| {
            let mut image = Vec::new();
            let summary = client.read_flash_to(size, chunk_size, &mut image, |event| {
                forward(&progress, event)
            })?;
            Ok((image, summary))
        })
        .await
    }

    /// Program `data` from address 0, forwarding progress to `progress` if given.
    pub async fn write_flash(
        &self,
        data: Vec<u8>,
        chunk_size: Option<usize>,
        erase: bool,
        verify: bool,
        progress: Option<Sender<TransferProgressEvent>>,
    ) -> BpioResult<WriteSummary> {
        self.run("write_flash", move |client| {
            client.write_flash_with_progress(&data, chunk_size, erase, verify, |event| {
                forward(&progress, event)
            })
        })
        .await
    }

    pub async fn close(&self) -> BpioResult<()> {
        self.run("close", |client| client.close()).await
    }

    async fn run<R, F>(&self, operation: &str, f: F) -> BpioResult<R>
    where
        F: FnOnce(&BpioClient<T>) -> BpioResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let client = Arc::clone(&self.client);
        tokio::task::spawn_blocking(move || f(&client))
            .await
            .map_err(|e| task_error(operation, e))?
    }
}

fn forward(progress: &Option<Sender<TransferProgressEvent>>, event: TransferEvent) {
    if let Some(tx) = progress {
        // Receiver may have hung up; the transfer carries on regardless.
        let _ = tx.send(TransferProgressEvent::from(event));
    }
}

fn task_error(operation: &str, e: tokio::task::JoinError) -> BpioError {
    BpioError::Task {
        operation: operation.to_string(),
        reason: e.to_string(),
    }
}
