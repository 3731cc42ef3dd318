//! Request handling: route, translate, call the backend, translate back.
//!
//! Streaming requests are driven by a spawned task that owns the [`StreamTranslator`] and
//! the [`UpstreamStream`]. It races upstream chunks against the heartbeat timer and the
//! cancellation token, and pushes framed events into a channel the HTTP layer reads from.

use std::pin::Pin;
use std::time::Duration;

use futures::stream::Stream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backends, UpstreamEvent, UpstreamStream};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::tiers::ModelRouter;
use crate::translate::anthropic_types::{MessagesRequest, MessagesResponse, StreamEvent};
use crate::translate::errors::{classify, classify_stream_payload};
use crate::translate::request::{anthropic_to_openai, TranslateOptions};
use crate::translate::response::openai_to_anthropic;
use crate::translate::streaming::StreamTranslator;

/// Events of one streaming response, in emission order.
pub type SseStream = Pin<Box<dyn Stream<Item = SseEvent> + Send>>;

const EVENT_BUFFER: usize = 64;

/// One framed server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

impl SseEvent {
    pub fn from_event(event: &StreamEvent) -> std::result::Result<Self, serde_json::Error> {
        Ok(Self {
            event: event.event_name().to_string(),
            data: serde_json::to_string(event)?,
        })
    }

    /// `event:` / `data:` framing, terminated by a blank line.
    pub fn to_frame(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.event, self.data)
    }
}

/// The request-handling entry point. Cheap to clone; everything inside is read-only.
#[derive(Debug, Clone)]
pub struct Gateway {
    router: ModelRouter,
    options: TranslateOptions,
    backends: Backends,
    heartbeat: Duration,
}

impl Gateway {
    pub fn new(
        router: ModelRouter,
        options: TranslateOptions,
        backends: Backends,
        heartbeat: Duration,
    ) -> Self {
        Self {
            router,
            options,
            backends,
            heartbeat,
        }
    }

    pub fn from_config(config: &GatewayConfig, backends: Backends) -> Self {
        Self::new(
            ModelRouter::new(&config.tiers),
            TranslateOptions {
                limits: config.tokens,
                multimodal: config.backend.multimodal,
            },
            backends,
            config.heartbeat_interval(),
        )
    }

    pub fn router(&self) -> &ModelRouter {
        &self.router
    }

    /// Forward a non-streaming request.
    pub async fn complete(&self, req: &MessagesRequest) -> Result<MessagesResponse> {
        let routed = self.router.route(&req.model);
        let backend_req = anthropic_to_openai(req, &routed, &self.options)?;

        let backend_resp = self
            .backends
            .for_tier(routed.tier)
            .complete(&backend_req)
            .await?;
        let resp = openai_to_anthropic(&backend_resp, &req.model)?;

        tracing::info!(
            tier = %routed.tier,
            model = %routed.model,
            input_tokens = resp.usage.input_tokens,
            output_tokens = resp.usage.output_tokens,
            "Completed"
        );
        Ok(resp)
    }

    /// Forward a streaming request. Setup failures (translation, backend refusing the
    /// request) come back as `Err` so the caller can answer with a single error envelope;
    /// anything after that arrives as events on the returned stream.
    ///
    /// Cancelling `cancel` at any point ends the stream with a `client_disconnected_error`
    /// event and aborts the backend connection once.
    pub async fn stream(
        &self,
        req: &MessagesRequest,
        cancel: CancellationToken,
    ) -> Result<SseStream> {
        if cancel.is_cancelled() {
            return Err(GatewayError::ClientDisconnected);
        }

        let routed = self.router.route(&req.model);
        let backend_req = anthropic_to_openai(req, &routed, &self.options)?;
        let backend = self.backends.for_tier(routed.tier);

        let upstream = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(GatewayError::ClientDisconnected),
            result = backend.stream(&backend_req) => result?,
        };

        tracing::info!(tier = %routed.tier, model = %routed.model, "Streaming started");

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let driver = StreamDriver {
            upstream,
            translator: StreamTranslator::new(&req.model),
            tx,
            cancel,
            heartbeat: self.heartbeat,
        };
        tokio::spawn(driver.run());

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

enum Step {
    Cancelled,
    Upstream(Option<Result<UpstreamEvent>>),
    Heartbeat,
}

struct StreamDriver {
    upstream: UpstreamStream,
    translator: StreamTranslator,
    tx: mpsc::Sender<SseEvent>,
    cancel: CancellationToken,
    heartbeat: Duration,
}

impl StreamDriver {
    async fn run(mut self) {
        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.heartbeat, self.heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let step = tokio::select! {
                biased;
                () = self.cancel.cancelled() => Step::Cancelled,
                () = self.tx.closed() => Step::Cancelled,
                item = self.upstream.next() => Step::Upstream(item),
                _ = ticker.tick() => Step::Heartbeat,
            };

            let events = match step {
                Step::Cancelled => {
                    self.shut_down();
                    return;
                }
                Step::Heartbeat => self.translator.heartbeat().into_iter().collect(),
                Step::Upstream(item) => {
                    ticker.reset();
                    self.on_upstream(item)
                }
            };

            for event in events {
                if !self.send(&event).await {
                    self.shut_down();
                    return;
                }
            }

            if self.translator.state().is_terminal() {
                tracing::debug!(message_id = self.translator.message_id(), "Stream finished");
                return;
            }
        }
    }

    fn on_upstream(&mut self, item: Option<Result<UpstreamEvent>>) -> Vec<StreamEvent> {
        match item {
            Some(Ok(UpstreamEvent::Chunk(chunk))) => self.translator.process_chunk(&chunk),
            Some(Ok(UpstreamEvent::Error(payload))) => {
                let classified = classify_stream_payload(&payload);
                tracing::warn!(kind = %classified.kind, "Backend sent an error mid-stream");
                self.translator.fail(&classified)
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "Backend stream failed");
                self.translator.fail(&classify(&e))
            }
            None => self.translator.finish(),
        }
    }

    /// Abort the backend and emit the terminal event. Runs once; the caller returns after.
    fn shut_down(&mut self) {
        if self.upstream.abort() {
            tracing::info!(
                message_id = self.translator.message_id(),
                "Client disconnected, backend stream aborted"
            );
        }
        self.cancel.cancel();
        // The receiver may already be gone, so delivery is best-effort.
        for event in self.translator.cancel() {
            match SseEvent::from_event(&event) {
                Ok(sse) => {
                    if self.tx.try_send(sse).is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Failed to serialize stream event"),
            }
        }
    }

    /// Returns `false` once the receiving side is gone or the stream is cancelled while
    /// waiting for room in the channel.
    async fn send(&mut self, event: &StreamEvent) -> bool {
        let sse = match SseEvent::from_event(event) {
            Ok(sse) => sse,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize stream event");
                return true;
            }
        };
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            sent = self.tx.send(sse) => sent.is_ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::anthropic_types::Delta;

    #[test]
    fn test_sse_framing() {
        let event = StreamEvent::ContentBlockDelta {
            index: 0,
            delta: Delta::TextDelta {
                text: "Hi".to_string(),
            },
        };
        let sse = SseEvent::from_event(&event).unwrap();
        assert_eq!(sse.event, "content_block_delta");
        assert_eq!(
            sse.to_frame(),
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n"
        );
    }

    #[test]
    fn test_message_stop_frame() {
        let sse = SseEvent::from_event(&StreamEvent::MessageStop).unwrap();
        assert_eq!(sse.to_frame(), "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n");
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_driver_future_is_send() {
        let (tx, _rx) = mpsc::channel(1);
        let driver = StreamDriver {
            upstream: UpstreamStream::new(futures::stream::empty::<Result<UpstreamEvent>>()),
            translator: StreamTranslator::new("m"),
            tx,
            cancel: CancellationToken::new(),
            heartbeat: Duration::from_secs(15),
        };
        assert_send(&driver.run());
    }
}
