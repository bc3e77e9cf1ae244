use futures::StreamExt;
use rig::completion::{CompletionError, CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::ensure;
use tokio::sync::{mpsc, oneshot};

use super::provider::{
    ChatStream, EmptyMessageSetSnafu, MissingApiKeySnafu, ProviderConfig, ProviderError,
    ProviderMessage, ProviderResult, ProviderStreamHandle, ProviderWorker, Role, StreamEvent,
    StreamEventMapped, StreamRequest, StreamSessionId, make_event_stream,
};

pub const RIG_OPENAI_PROVIDER_ID: &str = "openai";

type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::responses_api::streaming::StreamingCompletionResponse,
>;

/// OpenAI-compatible [`ChatStream`] backed by rig's streaming completions.
#[derive(Debug, Clone, Copy, Default)]
pub struct RigChatStream;

impl RigChatStream {
    pub fn new() -> Self {
        Self
    }

    fn build_client(config: &ProviderConfig) -> ProviderResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder
            .build()
            .map_err(|source| ProviderError::InvalidEndpoint {
                stage: "build-client",
                endpoint: config.endpoint.clone(),
                details: source.to_string(),
            })
    }

    fn to_rig_message(message: &ProviderMessage) -> Option<RigMessage> {
        match message.role {
            Role::System => None,
            Role::User => Some(RigMessage::user(message.content.clone())),
            Role::Assistant => Some(RigMessage::assistant(message.content.clone())),
        }
    }

    fn merged_preamble(request: &StreamRequest) -> Option<String> {
        // Rig exposes a single preamble field, so system-role messages are folded into it.
        let preamble_parts = request
            .messages
            .iter()
            .filter(|message| matches!(message.role, Role::System))
            .filter(|message| !message.content.trim().is_empty())
            .map(|message| message.content.clone())
            .collect::<Vec<_>>();

        if preamble_parts.is_empty() {
            None
        } else {
            Some(preamble_parts.join("\n\n"))
        }
    }

    async fn open_stream(
        config: &ProviderConfig,
        request: &StreamRequest,
    ) -> ProviderResult<RigStreamingResponse> {
        let client = Self::build_client(config)?;
        let model = client.completion_model(request.model.as_str().to_string());

        let mut messages = request
            .messages
            .iter()
            .filter_map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let Some(prompt) = messages.pop() else {
            tracing::warn!(
                session = %request.session,
                model = %request.model,
                total_message_count = request.messages.len(),
                "cannot open stream because no user/assistant messages remain after filtering"
            );
            return EmptyMessageSetSnafu {
                stage: "open-stream-pop-prompt",
                session: request.session,
            }
            .fail();
        };
        let mut builder = model.completion_request(prompt).messages(messages);

        if let Some(preamble) = Self::merged_preamble(request) {
            builder = builder.preamble(preamble);
        }

        if let Some(temperature) = request.temperature {
            builder = builder.temperature(temperature);
        }

        builder
            .stream()
            .await
            .map_err(|error| classify_completion_error("open-stream", error))
    }

    fn emit(
        event_tx: &mpsc::UnboundedSender<StreamEventMapped>,
        session: StreamSessionId,
        event: StreamEvent,
    ) -> bool {
        event_tx.send(StreamEventMapped { session, event }).is_ok()
    }

    fn map_stream_item<R>(item: StreamedAssistantContent<R>) -> Option<StreamEvent>
    where
        R: Clone + Unpin,
    {
        match item {
            StreamedAssistantContent::Text(text) if !text.text.is_empty() => {
                Some(StreamEvent::Delta(text.text))
            }
            // Reasoning, tool calls and the final usage frame carry no transcript text.
            _ => None,
        }
    }

    async fn run_stream_worker(
        config: ProviderConfig,
        request: StreamRequest,
        event_tx: mpsc::UnboundedSender<StreamEventMapped>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let session = request.session;
        let mut stream = match Self::open_stream(&config, &request).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::warn!(
                    session = %session,
                    provider_id = %config.provider_id,
                    model = %request.model,
                    stage = error.stage(),
                    error = %error,
                    "failed to open provider stream"
                );
                Self::emit(&event_tx, session, StreamEvent::Failed(error));
                return;
            }
        };

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    // Cancel the upstream Rig stream so provider IO stops promptly.
                    tracing::debug!(session = %session, "provider stream cancelled");
                    stream.cancel();
                    return;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            if let Some(event) = Self::map_stream_item(item)
                                && !Self::emit(&event_tx, session, event)
                            {
                                return;
                            }
                        }
                        Some(Err(source)) => {
                            tracing::warn!(
                                session = %session,
                                error = %source,
                                "provider stream emitted an error chunk"
                            );
                            let error = classify_completion_error("stream-chunk", source);
                            Self::emit(&event_tx, session, StreamEvent::Failed(error));
                            return;
                        }
                        None => break,
                    }
                }
            }
        }

        Self::emit(&event_tx, session, StreamEvent::Done);
    }
}

impl ChatStream for RigChatStream {
    fn open(
        &self,
        config: &ProviderConfig,
        request: StreamRequest,
    ) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-chat-stream-open",
                provider_id: config.provider_id.clone(),
            }
        );
        ensure!(
            request
                .messages
                .iter()
                .any(|message| !matches!(message.role, Role::System)),
            EmptyMessageSetSnafu {
                stage: "rig-chat-stream-open",
                session: request.session,
            }
        );

        let (event_tx, stream, cancel_rx) = make_event_stream(request.session);
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            config.clone(),
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }
}

/// Sorts rig's completion failures into the transcript-facing taxonomy.
fn classify_completion_error(stage: &'static str, error: CompletionError) -> ProviderError {
    match error {
        CompletionError::ProviderError(body) => ProviderError::Rejected {
            stage,
            code: extract_error_code(&body),
            details: body,
        },
        CompletionError::ResponseError(details) => {
            ProviderError::MalformedResponse { stage, details }
        }
        CompletionError::JsonError(source) => ProviderError::MalformedResponse {
            stage,
            details: source.to_string(),
        },
        other => ProviderError::Transport {
            stage,
            details: other.to_string(),
        },
    }
}

/// Reads `error.code` (or a top-level `code`) from an OpenAI-style error body.
fn extract_error_code(body: &str) -> Option<String> {
    let json = match (body.find('{'), body.rfind('}')) {
        (Some(open), Some(close)) if open < close => &body[open..=close],
        _ => return None,
    };
    let value = serde_json::from_str::<serde_json::Value>(json).ok()?;
    let code = value
        .pointer("/error/code")
        .filter(|code| !code.is_null())
        .or_else(|| value.get("code"))?;

    let code = match code {
        serde_json::Value::String(code) => code.trim().to_string(),
        serde_json::Value::Number(code) => code.to_string(),
        _ => return None,
    };
    (!code.is_empty()).then_some(code)
}
