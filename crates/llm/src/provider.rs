use std::fmt;
use std::future::Future;
use std::pin::Pin;

use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::model::ChatModel;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMessage {
    pub role: Role,
    pub content: String,
}

impl ProviderMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Identity of one generation; every event it produces is tagged with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamSessionId(Uuid);

impl StreamSessionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for StreamSessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StreamSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub session: StreamSessionId,
    pub model: ChatModel,
    pub messages: Vec<ProviderMessage>,
    pub temperature: Option<f64>,
}

impl StreamRequest {
    pub fn new(session: StreamSessionId, model: ChatModel, messages: Vec<ProviderMessage>) -> Self {
        Self {
            session,
            model,
            messages,
            temperature: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Delta(String),
    Done,
    Failed(ProviderError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamEventMapped {
    pub session: StreamSessionId,
    pub event: StreamEvent,
}

pub type ProviderWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Typed stream failure; the display text is what ends up in the transcript.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("Missing API key"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("Invalid URL: {endpoint}"))]
    InvalidEndpoint {
        stage: &'static str,
        endpoint: String,
        details: String,
    },
    #[snafu(display("stream request {session} has no messages"))]
    EmptyMessageSet {
        stage: &'static str,
        session: StreamSessionId,
    },
    #[snafu(display("Network failed: {details}"))]
    Transport {
        stage: &'static str,
        details: String,
    },
    #[snafu(display(
        "Invalid response, error code: {}",
        code.as_deref().unwrap_or("unknown")
    ))]
    Rejected {
        stage: &'static str,
        code: Option<String>,
        details: String,
    },
    #[snafu(display("Invalid content: {details}"))]
    MalformedResponse {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("Empty response"))]
    EmptyResponse { stage: &'static str },
}

impl ProviderError {
    pub fn stage(&self) -> &'static str {
        match self {
            Self::MissingApiKey { stage, .. }
            | Self::UnsupportedProvider { stage, .. }
            | Self::InvalidEndpoint { stage, .. }
            | Self::EmptyMessageSet { stage, .. }
            | Self::Transport { stage, .. }
            | Self::Rejected { stage, .. }
            | Self::MalformedResponse { stage, .. }
            | Self::EmptyResponse { stage } => stage,
        }
    }
}

/// Cancelable pull side of one generation's event channel.
///
/// Dropping the stream signals cancellation to the worker.
#[derive(Debug)]
pub struct DeltaStream {
    session: StreamSessionId,
    events: mpsc::UnboundedReceiver<StreamEventMapped>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct ProviderStreamHandle {
    pub stream: DeltaStream,
    pub worker: ProviderWorker,
}

impl fmt::Debug for ProviderStreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderStreamHandle")
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

impl DeltaStream {
    fn new(
        session: StreamSessionId,
        events: mpsc::UnboundedReceiver<StreamEventMapped>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            session,
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub fn session(&self) -> StreamSessionId {
        self.session
    }

    pub async fn recv(&mut self) -> Option<StreamEventMapped> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StreamEventMapped> {
        self.events.try_recv().ok()
    }

    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for DeltaStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// Source of streamed completions, one [`ProviderStreamHandle`] per generation.
///
/// `open` must not block; network work belongs in the returned worker.
pub trait ChatStream: Send + Sync {
    fn open(
        &self,
        config: &ProviderConfig,
        request: StreamRequest,
    ) -> ProviderResult<ProviderStreamHandle>;
}

/// Builds the channel triple behind a [`DeltaStream`]: event sender, stream, cancel receiver.
pub fn make_event_stream(
    session: StreamSessionId,
) -> (
    mpsc::UnboundedSender<StreamEventMapped>,
    DeltaStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        DeltaStream::new(session, event_rx, cancel_tx),
        cancel_rx,
    )
}
