use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tracing::{info, warn};
use uuid::Uuid;

use aigate_protocol::{
    ContentBlockDelta, MessageDeltaBody, MessagesRequest, StartContentBlock, StopReason,
    StreamEvent, StreamMessage, Usage,
};
use aigate_provider_core::{
    AdapterStream, ProviderError, ProviderInstance, ProviderResult, ProviderType, RetryPolicy,
    UpstreamAdapter, classify_status, classify_transport,
};

use crate::auth::{KiroAuth, machine_id, urls_for_region};
use crate::cache::{CacheEstimatorRegistry, CacheSplit, estimate_request_tokens};
use crate::request::build_request_body;
use crate::stream::{KiroEvent, KiroEventParser};
use crate::thinking::{TextSegment, ThinkingTagSplitter};
use crate::tools::recover_tool_calls;
use crate::usage::UsageLimits;
use crate::KiroConfig;

const PROVIDER_NAME: &str = "kiro";
const AGENT_MODE_HEADER: &str = "x-amzn-kiro-agent-mode";
const AGENT_MODE: &str = "vibe";

pub struct KiroAdapter {
    config: KiroConfig,
    client: wreq::Client,
    auths: Mutex<HashMap<String, Arc<KiroAuth>>>,
    estimators: CacheEstimatorRegistry,
}

impl KiroAdapter {
    pub fn new(config: KiroConfig) -> ProviderResult<Self> {
        let mut builder = wreq::Client::builder()
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(5);
        if !config.use_system_proxy {
            builder = builder.no_proxy();
        }
        if let Some(proxy) = &config.outbound_proxy {
            builder = builder.proxy(
                wreq::Proxy::all(proxy).map_err(|err| ProviderError::Other(err.to_string()))?,
            );
        }
        let client = builder
            .build()
            .map_err(|err| ProviderError::Other(err.to_string()))?;
        let estimators = CacheEstimatorRegistry::new(config.optimistic_cache, config.cache_debug);
        Ok(Self {
            config,
            client,
            auths: Mutex::new(HashMap::new()),
            estimators,
        })
    }

    async fn auth_for(&self, instance: &ProviderInstance) -> ProviderResult<Arc<KiroAuth>> {
        let mut auths = self.auths.lock().await;
        if let Some(auth) = auths.get(&instance.uuid) {
            return Ok(auth.clone());
        }
        let auth = KiroAuth::for_instance(&self.config, self.client.clone(), instance).await?;
        auths.insert(instance.uuid.clone(), auth.clone());
        Ok(auth)
    }

    fn user_agent(instance: &ProviderInstance) -> String {
        format!(
            "aws-sdk-js/3.738.0 ua/2.1 api/codewhispererstreaming kiro/1.0 md/machine-id#{}",
            machine_id(instance)
        )
    }

    fn generate_url(auth: &KiroAuth, model: &str) -> String {
        let urls = urls_for_region(auth.region());
        if model.starts_with("amazonq") {
            urls.generate_amazonq
        } else {
            urls.generate
        }
    }

    /// Execute one upstream call under the full ladder: proactive refresh,
    /// one transparent 401 refresh+retry, backoff on transient failures.
    async fn send_request(
        &self,
        instance: &ProviderInstance,
        auth: &KiroAuth,
        url: &str,
        body: &Value,
        policy: RetryPolicy,
    ) -> ProviderResult<wreq::Response> {
        let user_agent = Self::user_agent(instance);
        let mut attempt = 0u32;
        let mut refreshed = false;
        loop {
            let token = auth.access_token().await?;
            let sent = self
                .client
                .post(url)
                .header("Authorization", format!("Bearer {token}"))
                .header("Content-Type", "application/json")
                .header("User-Agent", user_agent.clone())
                .header(AGENT_MODE_HEADER, AGENT_MODE)
                .json(body)
                .send()
                .await;

            let error = match sent {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status().as_u16();
                    let text = response.text().await.unwrap_or_default();
                    match status {
                        401 if !refreshed => {
                            // One transparent refresh+retry; a refresh failure
                            // surfaces as AuthFatal from force_refresh.
                            auth.force_refresh().await?;
                            refreshed = true;
                            continue;
                        }
                        401 => {
                            return Err(ProviderError::AuthFatal(format!(
                                "401 after token refresh: {text}"
                            )));
                        }
                        403 => {
                            return Err(ProviderError::AuthFatal(format!("403 forbidden: {text}")));
                        }
                        _ => classify_status(status, text),
                    }
                }
                Err(err) => {
                    let message = err.to_string();
                    match classify_transport(&message) {
                        Some(kind) => ProviderError::Network { kind, message },
                        None => ProviderError::Other(message),
                    }
                }
            };

            if policy.should_retry(&error, attempt) {
                let delay = policy.delay_for(attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "kiro request failed, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }
            return Err(error);
        }
    }

    /// Operational diagnostics; failures here are never a health signal.
    pub async fn usage_limits(&self, instance: &ProviderInstance) -> ProviderResult<UsageLimits> {
        let auth = self.auth_for(instance).await?;
        let url = urls_for_region(auth.region()).usage_limits;
        let mut body = serde_json::json!({});
        if let Some(profile_arn) = auth.profile_arn().await {
            body["profileArn"] = Value::String(profile_arn);
        }
        let response = self
            .send_request(instance, &auth, &url, &body, RetryPolicy::new(1, self.config.retry.base_delay))
            .await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|err| ProviderError::UpstreamMalformed(err.to_string()))?;
        serde_json::from_slice(&bytes)
            .map_err(|err| ProviderError::UpstreamMalformed(err.to_string()))
    }
}

#[async_trait]
impl UpstreamAdapter for KiroAdapter {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::ClaudeKiroOAuth
    }

    async fn generate(
        &self,
        instance: &ProviderInstance,
        request: MessagesRequest,
    ) -> ProviderResult<AdapterStream> {
        let auth = self.auth_for(instance).await?;
        let conversation_id = Uuid::new_v4().to_string();
        let profile_arn = auth.profile_arn().await;
        let body = build_request_body(&request, profile_arn.as_deref(), &conversation_id);
        let url = Self::generate_url(&auth, &request.model);

        let response = self
            .send_request(instance, &auth, &url, &body, self.config.retry)
            .await?;

        let total_tokens = estimate_request_tokens(&request);
        let split = self
            .estimators
            .estimate(&instance.uuid, &request, total_tokens);
        let thinking_enabled = request
            .thinking
            .as_ref()
            .map(|thinking| thinking.is_enabled())
            .unwrap_or(false);
        info!(
            model = %request.model,
            input_tokens = total_tokens,
            cache_read = split.cache_read,
            cache_creation = split.cache_creation,
            "kiro stream started"
        );

        let (tx, rx) = mpsc::channel(32);
        let model = request.model.clone();
        tokio::spawn(stream_response(response, tx, split, model, thinking_enabled));
        Ok(rx)
    }

    async fn check_health(&self, instance: &ProviderInstance, model: &str) -> ProviderResult<()> {
        let auth = self.auth_for(instance).await?;
        let probe = MessagesRequest {
            model: model.to_string(),
            system: None,
            messages: vec![aigate_protocol::Message::user("Hi")],
            tools: Vec::new(),
            tool_choice: None,
            thinking: None,
            max_tokens: Some(1),
            stream: Some(true),
        };
        let conversation_id = Uuid::new_v4().to_string();
        let profile_arn = auth.profile_arn().await;
        let body = build_request_body(&probe, profile_arn.as_deref(), &conversation_id);
        let url = Self::generate_url(&auth, model);
        // Single attempt; the probe scheduler owns pacing and backoff.
        let response = self
            .send_request(
                instance,
                &auth,
                &url,
                &body,
                RetryPolicy::new(1, self.config.retry.base_delay),
            )
            .await?;
        drop(response);
        Ok(())
    }
}

async fn stream_response(
    response: wreq::Response,
    tx: mpsc::Sender<StreamEvent>,
    split: CacheSplit,
    model: String,
    thinking_enabled: bool,
) {
    let usage = Usage {
        input_tokens: split.uncached,
        output_tokens: 0,
        cache_creation_input_tokens: Some(split.cache_creation),
        cache_read_input_tokens: Some(split.cache_read),
    };
    let message_id = format!("msg_{}", Uuid::new_v4().simple());
    let start = StreamEvent::MessageStart {
        message: StreamMessage::start(message_id, model, usage.clone()),
    };
    if tx.send(start).await.is_err() {
        return;
    }

    let mut emitter = EventEmitter::new(tx, thinking_enabled);
    let mut parser = KiroEventParser::new();
    let mut bytes = response.bytes_stream();
    while let Some(chunk) = bytes.next().await {
        match chunk {
            Ok(chunk) => {
                for event in parser.push(&chunk) {
                    if !emitter.handle(event).await {
                        return;
                    }
                }
            }
            Err(err) => {
                // Surface what was parsed so far; the request itself already
                // succeeded, so this is not retried here.
                warn!(error = %err, "kiro stream interrupted");
                break;
            }
        }
    }
    emitter.finish(usage).await;
}

enum OpenBlock {
    Text,
    Thinking,
    ToolUse,
}

/// Turns parsed upstream events into Anthropic-compatible frames, one content
/// block at a time.
struct EventEmitter {
    tx: mpsc::Sender<StreamEvent>,
    thinking_enabled: bool,
    splitter: ThinkingTagSplitter,
    next_index: u32,
    open: Option<(u32, OpenBlock)>,
    visible_text: String,
    saw_tool_use: bool,
    send_failed: bool,
}

impl EventEmitter {
    fn new(tx: mpsc::Sender<StreamEvent>, thinking_enabled: bool) -> Self {
        Self {
            tx,
            thinking_enabled,
            splitter: ThinkingTagSplitter::new(),
            next_index: 0,
            open: None,
            visible_text: String::new(),
            saw_tool_use: false,
            send_failed: false,
        }
    }

    async fn send(&mut self, event: StreamEvent) -> bool {
        if self.send_failed {
            return false;
        }
        if self.tx.send(event).await.is_err() {
            self.send_failed = true;
            return false;
        }
        true
    }

    async fn handle(&mut self, event: KiroEvent) -> bool {
        match event {
            KiroEvent::Content(text) => {
                if self.thinking_enabled {
                    let segments = self.splitter.push(&text);
                    self.emit_segments(segments).await
                } else {
                    self.visible_text.push_str(&text);
                    self.emit_text_delta(text).await
                }
            }
            KiroEvent::ToolUseStart {
                tool_use_id,
                name,
                input,
            } => {
                self.saw_tool_use = true;
                if !self.flush_splitter().await {
                    return false;
                }
                if !self.close_open_block().await {
                    return false;
                }
                let id = if tool_use_id.is_empty() {
                    format!("toolu_{}", Uuid::new_v4().simple())
                } else {
                    tool_use_id
                };
                let index = self.next_index;
                self.open = Some((index, OpenBlock::ToolUse));
                self.next_index += 1;
                if !self
                    .send(StreamEvent::ContentBlockStart {
                        index,
                        content_block: StartContentBlock::ToolUse {
                            id,
                            name,
                            input: serde_json::json!({}),
                        },
                    })
                    .await
                {
                    return false;
                }
                match input {
                    Some(partial) if !partial.is_empty() => {
                        self.send(StreamEvent::ContentBlockDelta {
                            index,
                            delta: ContentBlockDelta::InputJsonDelta {
                                partial_json: partial,
                            },
                        })
                        .await
                    }
                    _ => true,
                }
            }
            KiroEvent::ToolUseInput(partial) => match self.open {
                Some((index, OpenBlock::ToolUse)) => {
                    self.send(StreamEvent::ContentBlockDelta {
                        index,
                        delta: ContentBlockDelta::InputJsonDelta {
                            partial_json: partial,
                        },
                    })
                    .await
                }
                _ => true,
            },
            KiroEvent::ToolUseStop => self.close_open_block().await,
            // Context usage is upstream telemetry with no outgoing frame.
            KiroEvent::ContextUsage(_) => true,
        }
    }

    async fn emit_segments(&mut self, segments: Vec<TextSegment>) -> bool {
        for segment in segments {
            let ok = match segment {
                TextSegment::Thinking(text) => self.emit_thinking_delta(text).await,
                TextSegment::Text(text) => {
                    self.visible_text.push_str(&text);
                    self.emit_text_delta(text).await
                }
            };
            if !ok {
                return false;
            }
        }
        true
    }

    async fn ensure_block(&mut self, wanted: OpenBlock) -> Option<u32> {
        let compatible = match (&self.open, &wanted) {
            (Some((_, OpenBlock::Text)), OpenBlock::Text) => true,
            (Some((_, OpenBlock::Thinking)), OpenBlock::Thinking) => true,
            _ => false,
        };
        if compatible {
            return self.open.as_ref().map(|(index, _)| *index);
        }
        if !self.close_open_block().await {
            return None;
        }
        let index = self.next_index;
        self.next_index += 1;
        let content_block = match wanted {
            OpenBlock::Text => StartContentBlock::Text {
                text: String::new(),
            },
            OpenBlock::Thinking => StartContentBlock::Thinking {
                thinking: String::new(),
                signature: None,
            },
            OpenBlock::ToolUse => unreachable!("tool blocks open explicitly"),
        };
        self.open = Some((index, wanted));
        if !self
            .send(StreamEvent::ContentBlockStart {
                index,
                content_block,
            })
            .await
        {
            return None;
        }
        Some(index)
    }

    async fn emit_text_delta(&mut self, text: String) -> bool {
        if text.is_empty() {
            return true;
        }
        let Some(index) = self.ensure_block(OpenBlock::Text).await else {
            return false;
        };
        self.send(StreamEvent::ContentBlockDelta {
            index,
            delta: ContentBlockDelta::TextDelta { text },
        })
        .await
    }

    async fn emit_thinking_delta(&mut self, thinking: String) -> bool {
        if thinking.is_empty() {
            return true;
        }
        let Some(index) = self.ensure_block(OpenBlock::Thinking).await else {
            return false;
        };
        self.send(StreamEvent::ContentBlockDelta {
            index,
            delta: ContentBlockDelta::ThinkingDelta { thinking },
        })
        .await
    }

    async fn flush_splitter(&mut self) -> bool {
        if !self.thinking_enabled {
            return true;
        }
        let segments = self.splitter.finish();
        self.emit_segments(segments).await
    }

    async fn close_open_block(&mut self) -> bool {
        if let Some((index, _)) = self.open.take() {
            return self.send(StreamEvent::ContentBlockStop { index }).await;
        }
        true
    }

    async fn finish(mut self, mut usage: Usage) {
        if !self.flush_splitter().await {
            return;
        }
        if !self.close_open_block().await {
            return;
        }

        // Some answers encode tool calls as bracketed text; lift them into
        // synthetic tool_use blocks with freshly minted ids.
        let recovered = recover_tool_calls(&self.visible_text);
        for call in &recovered {
            let index = self.next_index;
            self.next_index += 1;
            let started = self
                .send(StreamEvent::ContentBlockStart {
                    index,
                    content_block: StartContentBlock::ToolUse {
                        id: format!("toolu_{}", Uuid::new_v4().simple()),
                        name: call.name.clone(),
                        input: serde_json::json!({}),
                    },
                })
                .await;
            if !started {
                return;
            }
            let delta_sent = self
                .send(StreamEvent::ContentBlockDelta {
                    index,
                    delta: ContentBlockDelta::InputJsonDelta {
                        partial_json: call.arguments.to_string(),
                    },
                })
                .await;
            if !delta_sent {
                return;
            }
            if !self.send(StreamEvent::ContentBlockStop { index }).await {
                return;
            }
        }

        let stop_reason = if self.saw_tool_use || !recovered.is_empty() {
            StopReason::ToolUse
        } else {
            StopReason::EndTurn
        };
        usage.output_tokens = crate::cache::count_output_tokens(&self.visible_text);
        let delta_sent = self
            .send(StreamEvent::MessageDelta {
                delta: MessageDeltaBody {
                    stop_reason: Some(stop_reason),
                    stop_sequence: None,
                },
                usage,
            })
            .await;
        if !delta_sent {
            return;
        }
        let _ = self.send(StreamEvent::MessageStop).await;
    }
}
