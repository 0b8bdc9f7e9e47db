//! Outbound call lifecycle for every provider: adapter selection, timeouts,
//! the single transparent retry and SSE relay.
//!
//! Callers get an ordered stream of [`ChatEvent`]s. Dropping the stream drops the
//! in-flight response body, which is how a disconnected client cancels generation.

use async_stream::stream;
use eventsource_stream::EventStreamError;
use futures::stream::BoxStream;
use futures::StreamExt;
use rand::Rng;
use reqwest::{Client, Response};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::errors::{ChatError, ProxyResult};
use crate::providers::base::{ChatEvent, ChatInvocation, ChatResult, Provider, Usage};
use crate::providers::configs::ProviderConfigs;
use crate::providers::factory::{get_provider, ProviderAdapter};
use crate::providers::sse::sse_events;
use crate::providers::utils::{malformed, map_transport_error};

pub type ChatStream = BoxStream<'static, Result<ChatEvent, ChatError>>;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Time allowed until response headers arrive
    pub request_timeout: Duration,
    /// Longest silence tolerated between stream chunks
    pub stream_idle_timeout: Duration,
    /// Upper bound on any retry delay, including a provider's `Retry-After`
    pub max_retry_delay: Duration,
    /// Delay before the retry when the provider gave no hint; jitter of up to the same amount is added
    pub base_retry_delay: Duration,
    pub providers: ProviderConfigs,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            stream_idle_timeout: Duration::from_secs(30),
            max_retry_delay: Duration::from_secs(10),
            base_retry_delay: Duration::from_millis(500),
            providers: ProviderConfigs::default(),
        }
    }
}

impl ProxyConfig {
    fn retry_delay(&self, err: &ChatError) -> Duration {
        let delay = match err.retry_after() {
            Some(hint) => hint,
            None => {
                let base = self.base_retry_delay.as_millis() as u64;
                let jitter = rand::thread_rng().gen_range(0..=base);
                Duration::from_millis(base + jitter)
            }
        };
        delay.min(self.max_retry_delay)
    }
}

#[derive(Debug, Clone)]
pub struct ProviderProxy {
    client: Client,
    config: Arc<ProxyConfig>,
}

impl ProviderProxy {
    pub fn new(config: ProxyConfig) -> ProxyResult<Self> {
        let client = Client::builder()
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(|err| {
                ChatError::new(
                    crate::errors::ErrorKind::Unknown,
                    format!("Could not build HTTP client: {}", err),
                )
            })?;
        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Send an invocation and relay the response as normalized events.
    ///
    /// The stream ends after the first event with `is_final` set, or after the first error.
    pub fn dispatch(&self, invocation: ChatInvocation) -> ChatStream {
        let client = self.client.clone();
        let config = Arc::clone(&self.config);
        let adapter = get_provider(&invocation, &config.providers);

        Box::pin(stream! {
            debug!(
                provider = %invocation.provider,
                adapter = %adapter.kind(),
                model = %invocation.model,
                stream = invocation.stream,
                "dispatching chat invocation"
            );

            let mut retried = invocation.is_retry;
            loop {
                let mut emitted = false;
                let mut failure = None;

                match send(&client, &config, &adapter, &invocation).await {
                    Err(err) => failure = Some(err),
                    Ok(response) if !invocation.stream => {
                        match read_complete(&config, &adapter, &invocation, response).await {
                            Ok(event) => {
                                yield Ok(event);
                                return;
                            }
                            Err(err) => failure = Some(err),
                        }
                    }
                    Ok(response) => {
                        let mut relay = relay_stream(&config, &adapter, &invocation, response);
                        while let Some(item) = relay.next().await {
                            match item {
                                Ok(event) => {
                                    emitted = true;
                                    let done = event.is_final;
                                    yield Ok(event);
                                    if done {
                                        return;
                                    }
                                }
                                Err(err) => {
                                    failure = Some(err);
                                    break;
                                }
                            }
                        }
                    }
                }

                let Some(err) = failure else {
                    return;
                };
                warn!(
                    provider = %adapter.kind(),
                    kind = %err.kind,
                    diagnostic = err.diagnostic.as_deref().unwrap_or_default(),
                    "provider call failed"
                );

                if retried || emitted || !err.kind.is_retryable() {
                    yield Err(err);
                    return;
                }
                retried = true;
                let delay = config.retry_delay(&err);
                debug!(provider = %adapter.kind(), delay_ms = delay.as_millis() as u64, "retrying once");
                sleep(delay).await;
            }
        })
    }

    /// Drain a dispatch into a single result
    pub async fn complete(&self, invocation: ChatInvocation) -> ProxyResult<ChatResult> {
        let started = Instant::now();
        let provider = invocation.provider;
        let model = invocation.model.clone();

        let mut events = self.dispatch(invocation);
        let mut content = String::new();
        let mut usage = Usage::default();
        while let Some(event) = events.next().await {
            let event = event?;
            content.push_str(&event.delta);
            if let Some(reported) = &event.usage {
                usage.merge(reported);
            }
            if event.is_final {
                break;
            }
        }

        Ok(ChatResult {
            provider,
            model,
            content,
            usage,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }
}

async fn send(
    client: &Client,
    config: &ProxyConfig,
    adapter: &ProviderAdapter,
    invocation: &ChatInvocation,
) -> ProxyResult<Response> {
    let kind = adapter.kind();
    let secret = invocation.credential.expose();
    adapter.validate(invocation)?;
    let request = adapter.build_request(client, invocation);

    let response = match timeout(config.request_timeout, request.send()).await {
        Err(_) => return Err(ChatError::timeout(kind)),
        Ok(Err(err)) => return Err(map_transport_error(kind, &err, secret)),
        Ok(Ok(response)) => response,
    };

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let headers = response.headers().clone();
    let body = match timeout(config.request_timeout, response.text()).await {
        Ok(Ok(body)) => body,
        _ => String::new(),
    };
    Err(adapter.map_error(status, &headers, &body, secret))
}

async fn read_complete(
    config: &ProxyConfig,
    adapter: &ProviderAdapter,
    invocation: &ChatInvocation,
    response: Response,
) -> ProxyResult<ChatEvent> {
    let kind = adapter.kind();
    let body = match timeout(config.request_timeout, response.bytes()).await {
        Err(_) => return Err(ChatError::timeout(kind)),
        Ok(Err(err)) => {
            return Err(map_transport_error(
                kind,
                &err,
                invocation.credential.expose(),
            ))
        }
        Ok(Ok(body)) => body,
    };
    let value: Value =
        serde_json::from_slice(&body).map_err(|_| malformed(kind, "response is not JSON"))?;
    Ok(adapter.parse_response(&value)?.finished())
}

/// Re-frame an SSE body. Usage-only events are folded into the final event,
/// and a body that ends without a terminal marker gets a synthetic one.
fn relay_stream<'a>(
    config: &'a ProxyConfig,
    adapter: &'a ProviderAdapter,
    invocation: &'a ChatInvocation,
    response: Response,
) -> BoxStream<'a, ProxyResult<ChatEvent>> {
    Box::pin(stream! {
        let kind = adapter.kind();
        let secret = invocation.credential.expose();
        let mut events = Box::pin(sse_events(response.bytes_stream()));
        let mut usage = Usage::default();

        loop {
            let sse = match timeout(config.stream_idle_timeout, events.next()).await {
                Err(_) => {
                    yield Err(ChatError::timeout(kind));
                    return;
                }
                Ok(Some(Err(EventStreamError::Transport(err)))) => {
                    yield Err(map_transport_error(kind, &err, secret));
                    return;
                }
                Ok(Some(Err(err))) => {
                    debug!(provider = %kind, error = %err, "unreadable event stream");
                    yield Err(malformed(kind, "unreadable event stream"));
                    return;
                }
                Ok(Some(Ok(sse))) => sse,
                Ok(None) => break,
            };

            let event = match adapter.parse_stream_event(&sse) {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };
            if let Some(reported) = &event.usage {
                usage.merge(reported);
            }
            if event.is_final {
                let mut last = ChatEvent::delta(event.delta).finished();
                if !usage.is_empty() {
                    last = last.with_usage(usage.clone());
                }
                yield Ok(last);
                return;
            }
            if !event.delta.is_empty() {
                yield Ok(ChatEvent::delta(event.delta));
            }
        }

        let mut last = ChatEvent::final_event();
        if !usage.is_empty() {
            last = last.with_usage(usage);
        }
        yield Ok(last);
    })
}
