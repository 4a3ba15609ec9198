//! OpenAI completion binding over streamed Server-Sent Events.
//!
//! Chat models (`gpt-3.5-turbo*`, `gpt-4*`) are called through
//! `/chat/completions` with a fixed system message; every other model goes
//! through the legacy `/completions` endpoint with the bare prompt. Both
//! produce the same [`Fragment`] stream.

use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::provider::{
    CompletionProvider, CompletionRequest, Fragment, FragmentStream, ProviderError,
};
use super::sse;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

const SYSTEM_MESSAGE: &str = "You are a helpful assistant.";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Which OpenAI endpoint a model is served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiStyle {
    Chat,
    Completion,
}

impl ApiStyle {
    pub fn for_model(model: &str) -> Self {
        if model.starts_with("gpt-3.5-turbo") || model.starts_with("gpt-4") {
            Self::Chat
        } else {
            Self::Completion
        }
    }

    fn path(self) -> &'static str {
        match self {
            Self::Chat => "/chat/completions",
            Self::Completion => "/completions",
        }
    }
}

pub struct OpenAiProvider {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    style: ApiStyle,
    api_key: SecretString,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("style", &self.style)
            .finish_non_exhaustive()
    }
}

impl OpenAiProvider {
    /// # Errors
    ///
    /// [`ProviderError::Http`] if the HTTP client cannot be built.
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        api_key: SecretString,
    ) -> Result<Self, ProviderError> {
        let model = model.into();
        let style = ApiStyle::for_model(&model);
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        let endpoint = format!("{}{}", base_url.trim_end_matches('/'), style.path());
        info!(model = %model, endpoint = %endpoint, ?style, "OpenAI provider initialized");

        Ok(Self {
            client,
            endpoint,
            model,
            style,
            api_key,
        })
    }

    fn body(&self, request: &CompletionRequest) -> Value {
        match self.style {
            ApiStyle::Chat => json!({
                "model": self.model,
                "messages": [
                    { "role": "system", "content": SYSTEM_MESSAGE },
                    { "role": "user", "content": request.prompt },
                ],
                "temperature": request.temperature,
                "max_tokens": request.max_tokens,
                "stream": true,
            }),
            ApiStyle::Completion => json!({
                "model": self.model,
                "prompt": request.prompt,
                "temperature": request.temperature,
                "max_tokens": request.max_tokens,
                "stream": true,
            }),
        }
    }
}

impl CompletionProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.model
    }

    fn generate(&self, request: CompletionRequest, cancel: CancellationToken) -> FragmentStream {
        let pending = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "text/event-stream")
            .json(&self.body(&request));

        Box::pin(async_stream::stream! {
            let sent = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                sent = pending.send() => sent,
            };
            let response = match sent {
                Ok(response) => response,
                Err(err) => {
                    yield Err(ProviderError::Http(err));
                    return;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                yield Err(ProviderError::Api {
                    status: status.as_u16(),
                    message: api_error_message(&body),
                });
                return;
            }
            debug!(status = status.as_u16(), "provider stream opened");

            let mut events = Box::pin(sse::data_lines(response.bytes_stream()));
            loop {
                let event = tokio::select! {
                    biased;
                    () = cancel.cancelled() => return,
                    event = events.next() => event,
                };
                match event {
                    None => return,
                    Some(Err(err)) => {
                        yield Err(err);
                        return;
                    }
                    Some(Ok(data)) => match parse_event(&data) {
                        Ok(fragment) => yield Ok(fragment),
                        Err(err) => {
                            yield Err(err);
                            return;
                        }
                    },
                }
            }
        })
    }
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    delta: Option<Delta>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

/// Decodes one `data:` payload of either endpoint.
fn parse_event(data: &str) -> Result<Fragment, ProviderError> {
    let event: StreamEvent = serde_json::from_str(data)?;
    if let Some(error) = event.error {
        return Ok(Fragment::failed(error_text(&error)));
    }

    let text = event
        .choices
        .into_iter()
        .filter_map(|choice| choice.delta.and_then(|d| d.content).or(choice.text))
        .collect::<String>();
    Ok(Fragment::ok(text))
}

fn error_text(error: &Value) -> String {
    error
        .get("message")
        .and_then(Value::as_str)
        .map_or_else(|| error.to_string(), str::to_owned)
}

fn api_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").map(error_text))
        .unwrap_or_else(|| body.trim().to_owned())
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn request(prompt: &str) -> CompletionRequest {
        CompletionRequest {
            prompt: prompt.into(),
            temperature: 0.5,
            max_tokens: 64,
        }
    }

    fn provider(server: &MockServer, model: &str) -> OpenAiProvider {
        OpenAiProvider::new(&server.uri(), model, SecretString::from("sk-test")).unwrap()
    }

    async fn texts(provider: &OpenAiProvider, prompt: &str) -> Vec<Result<Fragment, ProviderError>> {
        provider
            .generate(request(prompt), CancellationToken::new())
            .collect()
            .await
    }

    #[test]
    fn model_selects_endpoint_style() {
        assert_eq!(ApiStyle::for_model("gpt-3.5-turbo"), ApiStyle::Chat);
        assert_eq!(ApiStyle::for_model("gpt-3.5-turbo-16k"), ApiStyle::Chat);
        assert_eq!(ApiStyle::for_model("gpt-4o"), ApiStyle::Chat);
        assert_eq!(ApiStyle::for_model("text-davinci-003"), ApiStyle::Completion);
    }

    #[test]
    fn parses_chat_and_completion_events() {
        let chat = r#"{"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert_eq!(parse_event(chat).unwrap(), Fragment::ok("Hel"));

        let completion = r#"{"choices":[{"text":"lo"}]}"#;
        assert_eq!(parse_event(completion).unwrap(), Fragment::ok("lo"));

        let role_only = r#"{"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_event(role_only).unwrap(), Fragment::ok(""));
    }

    #[test]
    fn error_object_is_an_unsuccessful_fragment() {
        let fragment = parse_event(r#"{"error":{"message":"overloaded"}}"#).unwrap();
        assert!(!fragment.successful);
        assert_eq!(fragment.text, "overloaded");
    }

    #[test]
    fn garbage_event_is_a_decode_error() {
        assert!(matches!(parse_event("not json"), Err(ProviderError::Decode(_))));
    }

    #[tokio::test]
    async fn streams_chat_completion() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" there\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({
                "model": "gpt-3.5-turbo",
                "stream": true,
                "max_tokens": 64,
                "messages": [
                    { "role": "system", "content": SYSTEM_MESSAGE },
                    { "role": "user", "content": "greet me" },
                ],
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .expect(1)
            .mount(&server)
            .await;

        let fragments = texts(&provider(&server, "gpt-3.5-turbo"), "greet me").await;
        let text: String = fragments.into_iter().map(|f| f.unwrap().text).collect();
        assert_eq!(text, "Hello there");
    }

    #[tokio::test]
    async fn streams_legacy_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/completions"))
            .and(body_partial_json(json!({ "prompt": "count", "model": "davinci-002" })))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "data: {\"choices\":[{\"text\":\"1 2\"}]}\n\ndata: {\"choices\":[{\"text\":\" 3\"}]}\n\ndata: [DONE]\n\n",
            ))
            .mount(&server)
            .await;

        let fragments = texts(&provider(&server, "davinci-002"), "count").await;
        let text: String = fragments.into_iter().map(|f| f.unwrap().text).collect();
        assert_eq!(text, "1 2 3");
    }

    #[tokio::test]
    async fn non_success_status_is_an_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": { "message": "Incorrect API key provided" }
            })))
            .mount(&server)
            .await;

        let fragments = texts(&provider(&server, "gpt-4"), "hi").await;
        assert_eq!(fragments.len(), 1);
        match &fragments[0] {
            Err(ProviderError::Api { status, message }) => {
                assert_eq!(*status, 401);
                assert_eq!(message, "Incorrect API key provided");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelled_before_send_makes_no_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let fragments: Vec<_> = provider(&server, "gpt-4")
            .generate(request("hi"), cancel)
            .collect()
            .await;
        assert!(fragments.is_empty());
    }
}
