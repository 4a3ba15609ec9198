//! The streaming relay: one admitted completion, from sub-queries to chunks.
//!
//! A [`StreamingRelay`] is only ever constructed after the [`QuotaGate`] has
//! admitted it. [`StreamingRelay::stream`] assembles and length-checks the
//! prompt synchronously, then returns a lazy [`RelayStream`] that drives the
//! provider, regroups its fragments with a [`ChunkBuffer`], throttles each
//! emission and stops at the first sign of cancellation.
//!
//! Every relay writes exactly one audit line when it ends, whatever the
//! outcome, carrying the full prompt and everything the provider produced.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::chunker::ChunkBuffer;
use super::error::RelayError;
use super::prompt::{self, PromptTemplate};
use super::provider::{CompletionProvider, CompletionRequest};
use crate::config::ConfigError;
use crate::quota::QuotaGate;

pub const DEFAULT_TEMPERATURE: f32 = 0.8;
pub const DEFAULT_MAX_RESPONSE_TOKENS: u32 = 500;
pub const DEFAULT_MIN_CHUNK_SIZE: usize = 1;

/// Upper bound accepted for `MaxResponseTokens`.
pub const MAX_RESPONSE_TOKENS_LIMIT: u32 = 4096;

/// Immutable per-process relay configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RelaySettings {
    pub template: Option<PromptTemplate>,
    pub temperature: f32,
    pub max_response_tokens: u32,
    /// Maximum assembled prompt length in characters.
    pub max_prompt_length: Option<usize>,
    /// Zero disables batching.
    pub min_chunk_size: usize,
    pub inter_chunk_delay: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            template: None,
            temperature: DEFAULT_TEMPERATURE,
            max_response_tokens: DEFAULT_MAX_RESPONSE_TOKENS,
            max_prompt_length: None,
            min_chunk_size: DEFAULT_MIN_CHUNK_SIZE,
            inter_chunk_delay: Duration::ZERO,
        }
    }
}

impl RelaySettings {
    /// Checks numeric ranges; never clamps.
    ///
    /// # Errors
    ///
    /// [`ConfigError::OutOfRange`] naming the offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.temperature) {
            return Err(ConfigError::OutOfRange {
                key: "Temperature",
                value: self.temperature.to_string(),
                range: "[0, 1]",
            });
        }
        if !(1..=MAX_RESPONSE_TOKENS_LIMIT).contains(&self.max_response_tokens) {
            return Err(ConfigError::OutOfRange {
                key: "MaxResponseTokens",
                value: self.max_response_tokens.to_string(),
                range: "[1, 4096]",
            });
        }
        Ok(())
    }
}

/// Lifecycle of one relay.
///
/// `Admitted → Assembling → Generating → Draining → Completed`, with
/// `Cancelled` and `Failed` reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Admitted,
    Assembling,
    Generating,
    Draining,
    Completed,
    Cancelled,
    Failed,
}

impl RelayState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admitted => "admitted",
            Self::Assembling => "assembling",
            Self::Generating => "generating",
            Self::Draining => "draining",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A completion request that has been admitted by the quota gate.
pub struct StreamingRelay {
    settings: Arc<RelaySettings>,
    provider: Arc<dyn CompletionProvider>,
    state: watch::Sender<RelayState>,
}

impl fmt::Debug for StreamingRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingRelay")
            .field("provider", &self.provider.name())
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl StreamingRelay {
    /// Validates `settings` and reserves one unit of quota.
    ///
    /// Settings are checked first so a misconfigured relay never spends quota.
    ///
    /// # Errors
    ///
    /// [`RelayError::Configuration`] for out-of-range settings,
    /// [`RelayError::QuotaExceeded`] when the gate refuses admission.
    pub fn admit(
        gate: &QuotaGate,
        settings: Arc<RelaySettings>,
        provider: Arc<dyn CompletionProvider>,
    ) -> Result<Self, RelayError> {
        settings.validate()?;
        if !gate.admit() {
            debug!(used = gate.used(), limit = gate.limit(), "admission refused");
            return Err(RelayError::QuotaExceeded);
        }
        let (state, _) = watch::channel(RelayState::Admitted);
        Ok(Self {
            settings,
            provider,
            state,
        })
    }

    pub fn state(&self) -> RelayState {
        *self.state.borrow()
    }

    /// Builds the prompt for `queries` and returns the chunk stream.
    ///
    /// Assembly and the length guard run before this returns, so their
    /// errors never involve the provider. The provider is first contacted
    /// when the returned stream is polled.
    ///
    /// # Errors
    ///
    /// [`RelayError::TemplateMismatch`] or [`RelayError::PromptTooLong`].
    pub fn stream(
        self,
        queries: &[String],
        cancel: CancellationToken,
    ) -> Result<RelayStream, RelayError> {
        let Self {
            settings,
            provider,
            state,
        } = self;
        let watcher = state.subscribe();
        let mut session = AuditSession::new(provider.name().to_owned(), state);
        session.set(RelayState::Assembling);

        let prompt = match prompt::assemble(settings.template.as_ref(), queries) {
            Ok(prompt) => prompt,
            Err(err) => {
                session.fail(&err);
                return Err(err);
            }
        };
        session.prompt.clone_from(&prompt);
        if let Err(err) = prompt::check_length(&prompt, settings.max_prompt_length) {
            session.fail(&err);
            return Err(err);
        }

        let request = CompletionRequest {
            prompt,
            temperature: settings.temperature,
            max_tokens: settings.max_response_tokens,
        };
        let min_chunk_size = settings.min_chunk_size;
        let delay = settings.inter_chunk_delay;

        let chunks = async_stream::stream! {
            let mut session = session;
            let mut buffer = ChunkBuffer::new(min_chunk_size);

            if cancel.is_cancelled() {
                session.set(RelayState::Cancelled);
                return;
            }
            session.set(RelayState::Generating);
            let mut fragments = provider.generate(request, cancel.clone());

            loop {
                let next = tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        session.set(RelayState::Cancelled);
                        return;
                    }
                    next = fragments.next() => next,
                };

                let fragment = match next {
                    None => break,
                    Some(Ok(fragment)) => fragment,
                    Some(Err(err)) => {
                        let err = RelayError::Provider(err);
                        session.fail(&err);
                        yield Err(err);
                        return;
                    }
                };

                if session.state() == RelayState::Generating {
                    session.set(RelayState::Draining);
                }
                if !fragment.successful {
                    debug!(reason = %fragment.text, "dropping unsuccessful fragment");
                    continue;
                }
                session.response.push_str(&fragment.text);

                if let Some(chunk) = buffer.push(&fragment.text) {
                    if !pause(delay, &cancel).await {
                        session.set(RelayState::Cancelled);
                        return;
                    }
                    yield Ok(chunk);
                }
            }

            if let Some(chunk) = buffer.finish() {
                if !pause(delay, &cancel).await {
                    session.set(RelayState::Cancelled);
                    return;
                }
                yield Ok(chunk);
            }
            session.set(RelayState::Completed);
        };

        Ok(RelayStream {
            inner: Box::pin(chunks),
            state: watcher,
        })
    }
}

/// Waits out the inter-chunk delay; `false` if cancelled first.
async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

/// Per-relay accumulator for the terminal audit line.
///
/// Dropping a session that never reached a terminal state marks the relay
/// cancelled: that is what happens when the consumer abandons the stream.
struct AuditSession {
    provider: String,
    prompt: String,
    response: String,
    error: Option<String>,
    state: watch::Sender<RelayState>,
}

impl AuditSession {
    fn new(provider: String, state: watch::Sender<RelayState>) -> Self {
        Self {
            provider,
            prompt: String::new(),
            response: String::new(),
            error: None,
            state,
        }
    }

    fn state(&self) -> RelayState {
        *self.state.borrow()
    }

    fn set(&self, next: RelayState) {
        self.state.send_replace(next);
    }

    fn fail(&mut self, err: &RelayError) {
        self.error = Some(err.to_string());
        self.set(RelayState::Failed);
    }
}

impl Drop for AuditSession {
    fn drop(&mut self) {
        let mut outcome = self.state();
        if !outcome.is_terminal() {
            outcome = RelayState::Cancelled;
            self.set(outcome);
        }

        match &self.error {
            Some(error) => warn!(
                provider = %self.provider,
                outcome = %outcome,
                error = %error,
                prompt = %self.prompt,
                response = %self.response,
                "completion finished"
            ),
            None => info!(
                provider = %self.provider,
                outcome = %outcome,
                prompt = %self.prompt,
                response = %self.response,
                "completion finished"
            ),
        }
    }
}

/// Lazy, cancellable sequence of output chunks.
///
/// Ends without an error item when the relay is cancelled; check
/// [`state`](Self::state) to tell that apart from completion.
pub struct RelayStream {
    inner: Pin<Box<dyn Stream<Item = Result<String, RelayError>> + Send>>,
    state: watch::Receiver<RelayState>,
}

impl fmt::Debug for RelayStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayStream")
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl RelayStream {
    pub fn state(&self) -> RelayState {
        *self.state.borrow()
    }

    /// A receiver that outlives the stream, for observing the final state.
    pub fn subscribe(&self) -> watch::Receiver<RelayState> {
        self.state.clone()
    }

    /// Drains the stream into one string.
    ///
    /// # Errors
    ///
    /// The first provider error, or [`RelayError::Cancelled`].
    pub async fn collect_text(mut self) -> Result<String, RelayError> {
        let mut text = String::new();
        while let Some(chunk) = self.next().await {
            text.push_str(&chunk?);
        }
        if self.state() == RelayState::Cancelled {
            return Err(RelayError::Cancelled);
        }
        Ok(text)
    }
}

impl Stream for RelayStream {
    type Item = Result<String, RelayError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.as_mut().poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::stream;
    use tracing::field::{Field, Visit};
    use tracing_subscriber::Layer;
    use tracing_subscriber::layer::SubscriberExt;

    use super::*;
    use crate::llm::provider::{Fragment, FragmentStream, ProviderError};
    use crate::llm::replay::ReplayProvider;

    #[derive(Clone, Copy)]
    enum Step {
        Text(&'static str),
        Unsuccessful,
        Error,
    }

    struct ScriptedProvider {
        script: Vec<Step>,
        hang: bool,
        calls: AtomicUsize,
        last_prompt: std::sync::Mutex<Option<String>>,
    }

    impl ScriptedProvider {
        fn new(script: &[Step]) -> Arc<Self> {
            Arc::new(Self {
                script: script.to_vec(),
                hang: false,
                calls: AtomicUsize::new(0),
                last_prompt: std::sync::Mutex::new(None),
            })
        }

        fn texts(fragments: &[&'static str]) -> Arc<Self> {
            let script: Vec<Step> = fragments.iter().map(|t| Step::Text(*t)).collect();
            Self::new(&script)
        }

        fn hanging(fragments: &[&'static str]) -> Arc<Self> {
            Arc::new(Self {
                script: fragments.iter().map(|t| Step::Text(*t)).collect(),
                hang: true,
                calls: AtomicUsize::new(0),
                last_prompt: std::sync::Mutex::new(None),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl CompletionProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn generate(&self, request: CompletionRequest, _cancel: CancellationToken) -> FragmentStream {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_prompt.lock().unwrap() = Some(request.prompt);
            let items: Vec<Result<Fragment, ProviderError>> = self
                .script
                .iter()
                .map(|step| match step {
                    Step::Text(text) => Ok(Fragment::ok(*text)),
                    Step::Unsuccessful => Ok(Fragment::failed("content filtered")),
                    Step::Error => Err(ProviderError::Stream("connection reset".into())),
                })
                .collect();
            if self.hang {
                Box::pin(stream::iter(items).chain(stream::pending()))
            } else {
                Box::pin(stream::iter(items))
            }
        }
    }

    fn settings(min_chunk_size: usize) -> Arc<RelaySettings> {
        Arc::new(RelaySettings {
            min_chunk_size,
            ..RelaySettings::default()
        })
    }

    fn queries(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    async fn chunks_of(stream: RelayStream) -> Vec<String> {
        stream.map(|chunk| chunk.unwrap()).collect().await
    }

    #[tokio::test]
    async fn regroups_fragments_to_minimum_size() {
        let provider = ScriptedProvider::texts(&["ab", "cde", "f"]);
        let gate = QuotaGate::new(10);
        let relay = StreamingRelay::admit(&gate, settings(5), provider.clone()).unwrap();

        let stream = relay.stream(&queries(&["q"]), CancellationToken::new()).unwrap();
        let watcher = stream.subscribe();
        assert_eq!(chunks_of(stream).await, vec!["abcde", "f"]);
        assert_eq!(*watcher.borrow(), RelayState::Completed);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn zero_min_size_forwards_each_fragment() {
        let provider = ScriptedProvider::texts(&["ab", "cde", "f"]);
        let relay = StreamingRelay::admit(&QuotaGate::new(1), settings(0), provider).unwrap();
        let stream = relay.stream(&queries(&["q"]), CancellationToken::new()).unwrap();
        assert_eq!(chunks_of(stream).await, vec!["ab", "cde", "f"]);
    }

    #[tokio::test]
    async fn provider_receives_assembled_prompt_and_parameters() {
        let provider = ScriptedProvider::texts(&["ok"]);
        let settings = Arc::new(RelaySettings {
            template: Some("Compare {0} with {1}".parse().unwrap()),
            ..RelaySettings::default()
        });
        let relay = StreamingRelay::admit(&QuotaGate::new(1), settings, provider.clone()).unwrap();
        let text = relay
            .stream(&queries(&["tea", "coffee"]), CancellationToken::new())
            .unwrap()
            .collect_text()
            .await
            .unwrap();
        assert_eq!(text, "ok");
        assert_eq!(
            provider.last_prompt.lock().unwrap().as_deref(),
            Some("Compare tea with coffee")
        );
    }

    #[tokio::test]
    async fn cancelling_after_n_chunks_yields_exactly_n() {
        let provider = ScriptedProvider::hanging(&["a", "b", "c"]);
        let cancel = CancellationToken::new();
        let relay = StreamingRelay::admit(&QuotaGate::new(1), settings(0), provider).unwrap();
        let mut stream = relay.stream(&queries(&["q"]), cancel.clone()).unwrap();

        assert_eq!(stream.next().await.unwrap().unwrap(), "a");
        assert_eq!(stream.next().await.unwrap().unwrap(), "b");
        cancel.cancel();

        assert!(stream.next().await.is_none());
        assert_eq!(stream.state(), RelayState::Cancelled);
    }

    #[tokio::test]
    async fn cancelled_before_first_poll_never_calls_provider() {
        let provider = ScriptedProvider::texts(&["a"]);
        let cancel = CancellationToken::new();
        let relay = StreamingRelay::admit(&QuotaGate::new(1), settings(1), provider.clone()).unwrap();
        let stream = relay.stream(&queries(&["q"]), cancel.clone()).unwrap();
        cancel.cancel();

        let err = stream.collect_text().await.unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn dropping_the_stream_marks_it_cancelled() {
        let provider = ScriptedProvider::hanging(&["a"]);
        let relay = StreamingRelay::admit(&QuotaGate::new(1), settings(1), provider).unwrap();
        let mut stream = relay.stream(&queries(&["q"]), CancellationToken::new()).unwrap();
        let watcher = stream.subscribe();

        assert_eq!(stream.next().await.unwrap().unwrap(), "a");
        assert_eq!(*watcher.borrow(), RelayState::Draining);
        drop(stream);
        assert_eq!(*watcher.borrow(), RelayState::Cancelled);
    }

    #[tokio::test]
    async fn oversized_prompt_never_reaches_provider() {
        let provider = ScriptedProvider::texts(&["never"]);
        let settings = Arc::new(RelaySettings {
            max_prompt_length: Some(8),
            ..RelaySettings::default()
        });
        let relay = StreamingRelay::admit(&QuotaGate::new(1), settings, provider.clone()).unwrap();

        let err = relay
            .stream(&queries(&["quite", "long"]), CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, RelayError::PromptTooLong { length: 11, max: 8 }));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn template_mismatch_fails_before_provider() {
        let provider = ScriptedProvider::texts(&["never"]);
        let settings = Arc::new(RelaySettings {
            template: Some("{0} vs {1}".parse().unwrap()),
            ..RelaySettings::default()
        });
        let relay = StreamingRelay::admit(&QuotaGate::new(1), settings, provider.clone()).unwrap();
        let err = relay.stream(&queries(&["one"]), CancellationToken::new()).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(provider.calls(), 0);
    }

    #[test]
    fn admission_requires_quota() {
        let gate = QuotaGate::new(1);
        let provider = ScriptedProvider::texts(&[]);
        assert!(StreamingRelay::admit(&gate, settings(1), provider.clone()).is_ok());
        let err = StreamingRelay::admit(&gate, settings(1), provider).unwrap_err();
        assert!(matches!(err, RelayError::QuotaExceeded));
    }

    #[test]
    fn invalid_settings_fail_closed_without_spending_quota() {
        let gate = QuotaGate::new(1);
        let provider = ScriptedProvider::texts(&[]);
        for bad in [
            RelaySettings { temperature: 1.5, ..RelaySettings::default() },
            RelaySettings { temperature: f32::NAN, ..RelaySettings::default() },
            RelaySettings { max_response_tokens: 0, ..RelaySettings::default() },
            RelaySettings { max_response_tokens: 4097, ..RelaySettings::default() },
        ] {
            let err = StreamingRelay::admit(&gate, Arc::new(bad), provider.clone()).unwrap_err();
            assert!(matches!(err, RelayError::Configuration(ConfigError::OutOfRange { .. })));
        }
        assert_eq!(gate.used(), 0);
    }

    #[tokio::test]
    async fn unsuccessful_fragments_are_dropped() {
        let provider = ScriptedProvider::new(&[Step::Text("a"), Step::Unsuccessful, Step::Text("b")]);
        let relay = StreamingRelay::admit(&QuotaGate::new(1), settings(0), provider).unwrap();
        let stream = relay.stream(&queries(&["q"]), CancellationToken::new()).unwrap();
        assert_eq!(chunks_of(stream).await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn provider_error_is_surfaced_and_marks_failed() {
        let provider = ScriptedProvider::new(&[Step::Text("partial"), Step::Error, Step::Text("lost")]);
        let relay = StreamingRelay::admit(&QuotaGate::new(1), settings(0), provider).unwrap();
        let mut stream = relay.stream(&queries(&["q"]), CancellationToken::new()).unwrap();

        assert_eq!(stream.next().await.unwrap().unwrap(), "partial");
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, RelayError::Provider(ProviderError::Stream(_))));
        assert!(stream.next().await.is_none());
        assert_eq!(stream.state(), RelayState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn every_emission_waits_for_the_delay() {
        let provider = ScriptedProvider::texts(&["x", "y"]);
        let settings = Arc::new(RelaySettings {
            min_chunk_size: 0,
            inter_chunk_delay: Duration::from_millis(100),
            ..RelaySettings::default()
        });
        let relay = StreamingRelay::admit(&QuotaGate::new(1), settings, provider).unwrap();
        let mut stream = relay.stream(&queries(&["q"]), CancellationToken::new()).unwrap();

        let start = tokio::time::Instant::now();
        assert_eq!(stream.next().await.unwrap().unwrap(), "x");
        let first = start.elapsed();
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(200));
        assert_eq!(stream.next().await.unwrap().unwrap(), "y");
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_delay() {
        let provider = ScriptedProvider::texts(&["x"]);
        let settings = Arc::new(RelaySettings {
            inter_chunk_delay: Duration::from_secs(60),
            ..RelaySettings::default()
        });
        let cancel = CancellationToken::new();
        let relay = StreamingRelay::admit(&QuotaGate::new(1), settings, provider).unwrap();
        let mut stream = relay.stream(&queries(&["q"]), cancel.clone()).unwrap();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });
        assert!(stream.next().await.is_none());
        assert_eq!(stream.state(), RelayState::Cancelled);
    }

    /// One captured `completion finished` event.
    #[derive(Debug)]
    struct AuditLine {
        level: tracing::Level,
        fields: HashMap<String, String>,
    }

    #[derive(Clone, Default)]
    struct AuditCapture(Arc<std::sync::Mutex<Vec<AuditLine>>>);

    impl AuditCapture {
        fn install(&self) -> tracing::subscriber::DefaultGuard {
            tracing::subscriber::set_default(tracing_subscriber::registry().with(self.clone()))
        }

        fn take(&self) -> Vec<AuditLine> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    #[derive(Default)]
    struct Fields(HashMap<String, String>);

    impl Visit for Fields {
        fn record_str(&mut self, field: &Field, value: &str) {
            self.0.insert(field.name().to_owned(), value.to_owned());
        }

        fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
            self.0.insert(field.name().to_owned(), format!("{value:?}"));
        }
    }

    impl<S: tracing::Subscriber> Layer<S> for AuditCapture {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
            let mut fields = Fields::default();
            event.record(&mut fields);
            if fields.0.get("message").map(String::as_str) == Some("completion finished") {
                self.0.lock().unwrap().push(AuditLine {
                    level: *event.metadata().level(),
                    fields: fields.0,
                });
            }
        }
    }

    #[tokio::test]
    async fn audit_line_carries_prompt_and_successful_response() {
        let capture = AuditCapture::default();
        let _guard = capture.install();

        let provider = ScriptedProvider::new(&[Step::Text("a"), Step::Unsuccessful, Step::Text("b")]);
        let relay = StreamingRelay::admit(&QuotaGate::new(1), settings(0), provider).unwrap();
        let text = relay
            .stream(&queries(&["x", "y"]), CancellationToken::new())
            .unwrap()
            .collect_text()
            .await
            .unwrap();
        assert_eq!(text, "ab");

        let lines = capture.take();
        assert_eq!(lines.len(), 1);
        let line = &lines[0];
        assert_eq!(line.level, tracing::Level::INFO);
        assert_eq!(line.fields["outcome"], "completed");
        assert_eq!(line.fields["prompt"], "x, y");
        assert_eq!(line.fields["response"], "ab");
        assert!(!line.fields.contains_key("error"));
        assert!(line.fields.values().all(|v| !v.contains("content filtered")));
    }

    #[tokio::test]
    async fn cancelled_relay_is_audited_at_info() {
        let capture = AuditCapture::default();
        let _guard = capture.install();

        let provider = ScriptedProvider::hanging(&["a"]);
        let cancel = CancellationToken::new();
        let relay = StreamingRelay::admit(&QuotaGate::new(1), settings(0), provider).unwrap();
        let mut stream = relay.stream(&queries(&["q"]), cancel.clone()).unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "a");
        cancel.cancel();
        assert!(stream.next().await.is_none());
        drop(stream);

        let lines = capture.take();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].level, tracing::Level::INFO);
        assert_eq!(lines[0].fields["outcome"], "cancelled");
        assert_eq!(lines[0].fields["response"], "a");
        assert!(!lines[0].fields.contains_key("error"));
    }

    #[tokio::test]
    async fn rejected_prompt_is_audited_with_its_text() {
        let capture = AuditCapture::default();
        let _guard = capture.install();

        let settings = Arc::new(RelaySettings {
            max_prompt_length: Some(8),
            ..RelaySettings::default()
        });
        let relay =
            StreamingRelay::admit(&QuotaGate::new(1), settings, ScriptedProvider::texts(&[])).unwrap();
        assert!(relay.stream(&queries(&["quite", "long"]), CancellationToken::new()).is_err());

        let lines = capture.take();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].level, tracing::Level::WARN);
        assert_eq!(lines[0].fields["outcome"], "failed");
        assert_eq!(lines[0].fields["prompt"], "quite, long");
        assert!(lines[0].fields["error"].contains("11"));
    }

    #[tokio::test]
    async fn replay_runs_through_the_same_pipeline() {
        let provider = Arc::new(ReplayProvider::new("Hello, world"));
        let relay = StreamingRelay::admit(&QuotaGate::new(1), settings(5), provider).unwrap();
        let stream = relay.stream(&queries(&["ignored"]), CancellationToken::new()).unwrap();
        assert_eq!(chunks_of(stream).await, vec!["Hello", ", wor", "ld"]);
    }
}
