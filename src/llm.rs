use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{Instant, timeout, timeout_at};

use crate::error::LlmError;
use crate::message::{ChatMessage, Role};
use crate::stats::CallStats;

/// A single system message starting with this prefix bypasses the
/// last-message-must-be-user guard; the profile updater and guide selection
/// use it for JSON-only analytic calls.
pub const ANALYSIS_TASK_PREFIX: &str = "[ANALYSIS_TASK]";

pub const NONSTREAM_TIMEOUT: Duration = Duration::from_secs(60);
pub const STREAM_TIMEOUT: Duration = Duration::from_secs(120);

/// Preferred-provider model aliases. A model on the left is tried against
/// the preferred provider first; on any failure the call is retried against
/// the generic provider under the right-hand identifier.
const MODEL_ALIASES: &[(&str, &str)] = &[
    ("veil-chat-large", "gpt-4o"),
    ("veil-chat-small", "gpt-4o-mini"),
];

fn alias_for(model: &str) -> Option<&'static str> {
    MODEL_ALIASES
        .iter()
        .find(|(preferred, _)| *preferred == model)
        .map(|(_, generic)| *generic)
}

#[derive(Debug)]
pub struct GenerateRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub stream: bool,
    pub collect_stats: bool,
    /// Incremental sink for streamed tokens. Ignored when `stream` is false.
    pub sink: Option<UnboundedSender<String>>,
}

impl GenerateRequest {
    pub fn new(messages: Vec<ChatMessage>, model: impl Into<String>) -> Self {
        Self {
            messages,
            model: model.into(),
            stream: false,
            collect_stats: true,
            sink: None,
        }
    }
}

/// Outbound contract to any LLM provider. The production implementation is
/// [`LlmGateway`]; tests substitute [`ScriptedGateway`].
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Never returns an error: failures surface as in-band marker strings
    /// with `stats.error` populated.
    async fn generate(&self, req: GenerateRequest) -> (String, Option<CallStats>);
}

struct Provider {
    name: String,
    client: Client<OpenAIConfig>,
}

/// Dual-provider gateway with declarative fallback. Holds one pooled HTTP
/// client per configured provider for the whole process.
pub struct LlmGateway {
    preferred: Option<Provider>,
    generic: Option<Provider>,
}

impl LlmGateway {
    /// `generic_key` configures the OpenAI-compatible default provider;
    /// `preferred` optionally configures a provider tried first for aliased
    /// models.
    pub fn new(generic_key: Option<String>, preferred: Option<(String, String)>) -> Self {
        let generic = generic_key.map(|key| Provider {
            name: "openai".to_string(),
            client: Client::with_config(OpenAIConfig::new().with_api_key(key)),
        });
        let preferred = preferred.map(|(base, key)| Provider {
            name: "preferred".to_string(),
            client: Client::with_config(
                OpenAIConfig::new().with_api_base(base).with_api_key(key),
            ),
        });
        Self { preferred, generic }
    }

    fn guard(messages: &[ChatMessage]) -> Result<(), LlmError> {
        let Some(last) = messages.last() else {
            return Err(LlmError::Skipped("empty message list".into()));
        };
        if last.role == Role::User {
            return Ok(());
        }
        if messages.len() == 1
            && last.role == Role::System
            && last.content.starts_with(ANALYSIS_TASK_PREFIX)
        {
            return Ok(());
        }
        Err(LlmError::Skipped(
            "last message is not a user message".into(),
        ))
    }

    fn to_request_messages(
        messages: &[ChatMessage],
    ) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        let mut out = Vec::with_capacity(messages.len());
        for msg in messages {
            let converted: ChatCompletionRequestMessage = match msg.role {
                Role::System => ChatCompletionRequestSystemMessageArgs::default()
                    .content(msg.content.clone())
                    .build()?
                    .into(),
                Role::User => ChatCompletionRequestUserMessageArgs::default()
                    .content(msg.content.clone())
                    .build()?
                    .into(),
                Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                    .content(msg.content.clone())
                    .build()?
                    .into(),
            };
            out.push(converted);
        }
        Ok(out)
    }

    async fn call_provider(
        provider: &Provider,
        model: &str,
        req: &GenerateRequest,
    ) -> Result<(String, CallStats), LlmError> {
        let started = Instant::now();
        let request = CreateChatCompletionRequestArgs::default()
            .model(model)
            .messages(Self::to_request_messages(&req.messages)?)
            .build()?;

        let mut stats = CallStats {
            model: model.to_string(),
            ..Default::default()
        };

        if req.stream {
            // One deadline for the whole stream; a slow drip may not
            // stretch past the documented bound.
            let deadline = started + STREAM_TIMEOUT;
            let mut stream = timeout_at(deadline, provider.client.chat().create_stream(request))
                .await
                .map_err(|_| LlmError::Timeout)??;
            let mut text = String::new();
            loop {
                let chunk = match timeout_at(deadline, stream.next()).await {
                    Err(_) => return Err(LlmError::Timeout),
                    Ok(None) => break,
                    Ok(Some(chunk)) => chunk?,
                };
                if let Some(delta) = chunk
                    .choices
                    .first()
                    .and_then(|choice| choice.delta.content.clone())
                {
                    if stats.time_to_first_token.is_none() {
                        stats.time_to_first_token = Some(started.elapsed().as_secs_f64());
                    }
                    if let Some(sink) = &req.sink {
                        let _ = sink.send(delta.clone());
                    }
                    text.push_str(&delta);
                }
            }
            stats.total_time = started.elapsed().as_secs_f64();
            fill_approx_tokens(&mut stats, &req.messages, &text);
            Ok((text, stats))
        } else {
            let response = timeout(NONSTREAM_TIMEOUT, provider.client.chat().create(request))
                .await
                .map_err(|_| LlmError::Timeout)??;
            let text = response
                .choices
                .first()
                .and_then(|choice| choice.message.content.clone())
                .unwrap_or_default();
            stats.total_time = started.elapsed().as_secs_f64();
            match response.usage {
                Some(usage) => {
                    stats.input_tokens = usage.prompt_tokens;
                    stats.output_tokens = usage.completion_tokens;
                    stats.total_tokens = usage.total_tokens;
                }
                None => fill_approx_tokens(&mut stats, &req.messages, &text),
            }
            Ok((text, stats))
        }
    }
}

/// Provider-reported usage is preferred; whitespace word counts approximate
/// it when absent.
fn fill_approx_tokens(stats: &mut CallStats, messages: &[ChatMessage], output: &str) {
    let input: usize = messages
        .iter()
        .map(|m| m.content.split_whitespace().count())
        .sum();
    stats.input_tokens = input as u32;
    stats.output_tokens = output.split_whitespace().count() as u32;
    stats.total_tokens = stats.input_tokens + stats.output_tokens;
}

#[async_trait]
impl TextGenerator for LlmGateway {
    async fn generate(&self, req: GenerateRequest) -> (String, Option<CallStats>) {
        let mut stats = CallStats {
            model: req.model.clone(),
            ..Default::default()
        };

        if let Err(err) = Self::guard(&req.messages) {
            log::warn!("gateway skipped call: {err}");
            stats.error = Some("skipped".to_string());
            return (String::new(), req.collect_stats.then_some(stats));
        }

        // Attempt order: preferred provider for aliased models, then the
        // generic provider under the aliased identifier.
        let mut attempts: Vec<(&Provider, String)> = Vec::new();
        let generic_model = alias_for(&req.model).unwrap_or(&req.model).to_string();
        if alias_for(&req.model).is_some() {
            if let Some(preferred) = &self.preferred {
                attempts.push((preferred, req.model.clone()));
            }
        }
        if let Some(generic) = &self.generic {
            attempts.push((generic, generic_model));
        }

        if attempts.is_empty() {
            stats.error = Some(LlmError::ConfigMissing.to_string());
            return (
                "[LLM_ERROR: missing API credentials]".to_string(),
                req.collect_stats.then_some(stats),
            );
        }

        let mut last_error = String::new();
        for (provider, model) in attempts {
            match Self::call_provider(provider, &model, &req).await {
                Ok((text, call_stats)) => {
                    return (text, req.collect_stats.then_some(call_stats));
                }
                Err(err) => {
                    log::warn!("provider {} failed for {model}: {err}", provider.name);
                    last_error = err.to_string();
                }
            }
        }

        stats.error = Some(last_error.clone());
        (
            format!("[LLM_ERROR: {last_error}]"),
            req.collect_stats.then_some(stats),
        )
    }
}

/// Deterministic gateway for tests and offline runs: replies are served
/// from a queue, with a canned fallback once the queue drains.
#[derive(Debug, Default)]
pub struct ScriptedGateway {
    replies: Mutex<VecDeque<String>>,
    fallback: String,
}

impl ScriptedGateway {
    pub fn new(replies: Vec<String>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback: String::new(),
        }
    }

    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = fallback.into();
        self
    }

    pub fn push(&self, reply: impl Into<String>) {
        self.replies
            .lock()
            .expect("scripted gateway poisoned")
            .push_back(reply.into());
    }
}

#[async_trait]
impl TextGenerator for ScriptedGateway {
    async fn generate(&self, req: GenerateRequest) -> (String, Option<CallStats>) {
        let mut stats = CallStats {
            model: req.model.clone(),
            total_time: 0.01,
            ..Default::default()
        };
        if let Err(err) = LlmGateway::guard(&req.messages) {
            stats.error = Some("skipped".to_string());
            log::debug!("scripted gateway skipped call: {err}");
            return (String::new(), req.collect_stats.then_some(stats));
        }
        let text = self
            .replies
            .lock()
            .expect("scripted gateway poisoned")
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        if let Some(sink) = &req.sink {
            let _ = sink.send(text.clone());
        }
        fill_approx_tokens(&mut stats, &req.messages, &text);
        (text, req.collect_stats.then_some(stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn guard_refuses_trailing_assistant_message() {
        let gateway = ScriptedGateway::new(vec!["should not appear".into()]);
        let req = GenerateRequest::new(
            vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")],
            "test-model",
        );
        let (text, stats) = gateway.generate(req).await;
        assert!(text.is_empty());
        assert_eq!(stats.unwrap().error.as_deref(), Some("skipped"));
    }

    #[tokio::test]
    async fn guard_allows_single_analysis_system_message() {
        let gateway = ScriptedGateway::new(vec!["{}".into()]);
        let req = GenerateRequest::new(
            vec![ChatMessage::system(format!(
                "{ANALYSIS_TASK_PREFIX} analyze this"
            ))],
            "test-model",
        );
        let (text, stats) = gateway.generate(req).await;
        assert_eq!(text, "{}");
        assert!(stats.unwrap().error.is_none());
    }

    #[tokio::test]
    async fn unconfigured_gateway_returns_error_marker() {
        let gateway = LlmGateway::new(None, None);
        let req = GenerateRequest::new(vec![ChatMessage::user("hi")], "gpt-4o-mini");
        let (text, stats) = gateway.generate(req).await;
        assert!(text.starts_with("[LLM_ERROR:"));
        assert!(stats.unwrap().error.is_some());
    }

    #[test]
    fn aliases_route_to_generic_models() {
        assert_eq!(alias_for("veil-chat-large"), Some("gpt-4o"));
        assert_eq!(alias_for("gpt-4o"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_deadline_is_absolute_not_per_chunk() {
        let deadline = Instant::now() + STREAM_TIMEOUT;
        // Chunks 90 s apart each fit a per-chunk window, but the second
        // waits past the absolute deadline and must time out.
        tokio::time::advance(STREAM_TIMEOUT - Duration::from_secs(30)).await;
        assert!(timeout_at(deadline, std::future::ready(())).await.is_ok());
        assert!(
            timeout_at(deadline, std::future::pending::<()>())
                .await
                .is_err()
        );
    }
}
