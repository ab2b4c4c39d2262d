//! Per-exchange workflow: mark the user active, route, read the window, call
//! the provider, update the caches and hand the record to the history sink.
//!
//! Only validation problems surface as errors. Provider failures become the
//! configured fallback reply with no cache, window or history side effects;
//! fast-store and persistence failures are logged and otherwise ignored.

use bytes::Bytes;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use super::providers::{ImageInput, LlmProvider, ProviderError, ProviderRegistry, ProviderReply};
use super::routing::{route_text, split_directive, Route};
use crate::cache::{ConversationWindowCache, ResultCache};
use crate::config::ProvidersConfig;
use crate::history::{HistorySink, InteractionKind, InteractionRecord};
use crate::models::{
    ConversationTurn, ImageReply, ImageUpload, InboundMessage, InboundPayload, OutboundReply,
    ReplySource, TextReply, UserKey,
};
use crate::utils::image::{ImagePolicy, PreparedImage, UNDECODABLE_IMAGE};
use crate::utils::limiters::Limiters;
use crate::utils::{fingerprint, ContentFingerprint};

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown model provider: {0}")]
    UnknownProvider(String),
}

/// Timeouts and user-facing fallback texts.
#[derive(Debug, Clone)]
pub struct ExchangeSettings {
    pub provider_timeout: Duration,
    pub fallback_message: String,
    pub image_fallback_message: String,
}

impl From<&ProvidersConfig> for ExchangeSettings {
    fn from(cfg: &ProvidersConfig) -> Self {
        Self {
            provider_timeout: cfg.request_timeout(),
            fallback_message: cfg.fallback_message.clone(),
            image_fallback_message: cfg.image_fallback_message.clone(),
        }
    }
}

/// What gets recorded about an accepted upload.
struct UploadMeta<'a> {
    file_name: &'a str,
    ext: &'a str,
    description: Option<&'a str>,
    fingerprint: &'a ContentFingerprint,
}

pub struct Orchestrator {
    registry: ProviderRegistry,
    window: ConversationWindowCache,
    results: ResultCache,
    history: Arc<dyn HistorySink>,
    images: ImagePolicy,
    limiters: Limiters,
    settings: ExchangeSettings,
}

impl Orchestrator {
    pub fn new(
        registry: ProviderRegistry,
        window: ConversationWindowCache,
        results: ResultCache,
        history: Arc<dyn HistorySink>,
        images: ImagePolicy,
        limiters: Limiters,
        settings: ExchangeSettings,
    ) -> Self {
        Self {
            registry,
            window,
            results,
            history,
            images,
            limiters,
            settings,
        }
    }

    pub async fn handle(&self, message: InboundMessage) -> Result<OutboundReply, ExchangeError> {
        if message.user.is_blank() {
            return Err(ExchangeError::Validation("line_user_id is required".to_string()));
        }
        self.history.touch(&message.user);

        let explicit = self.explicit_provider(message.directive.as_deref())?;

        match message.payload {
            InboundPayload::Text(text) => self
                .handle_text(&message.user, &text, explicit, message.context)
                .await
                .map(OutboundReply::Text),
            InboundPayload::Image(upload) => self
                .handle_image(&message.user, upload, explicit)
                .await
                .map(OutboundReply::Image),
        }
    }

    /// Out-of-band provider choice. Blank means "none given".
    fn explicit_provider(&self, directive: Option<&str>) -> Result<Option<String>, ExchangeError> {
        match directive.map(str::trim).filter(|d| !d.is_empty()) {
            None => Ok(None),
            Some(id) if self.registry.contains(id) => Ok(Some(id.to_lowercase())),
            Some(id) => Err(ExchangeError::UnknownProvider(id.to_string())),
        }
    }

    fn provider(&self, id: &str) -> Result<Arc<dyn LlmProvider>, ExchangeError> {
        self.registry
            .get(id)
            .ok_or_else(|| ExchangeError::UnknownProvider(id.to_string()))
    }

    /// Starts `call` once a permit is held and bounds it by the call timeout.
    async fn call_provider<F, Fut>(&self, op: &'static str, call: F) -> Result<ProviderReply, ProviderError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<ProviderReply, ProviderError>>,
    {
        let (_permit, waited) = Limiters::acquire_timed(
            self.limiters.provider.clone(),
            self.limiters.acquire_timeout,
            op,
        )
        .await
        .map_err(|e| ProviderError::Saturated(e.to_string()))?;

        if waited > Duration::from_millis(100) {
            warn!("{} waited {:?} for a provider permit", op, waited);
        }

        tokio::time::timeout(self.settings.provider_timeout, call())
            .await
            .map_err(|_| ProviderError::Timeout(self.settings.provider_timeout))?
    }

    async fn handle_text(
        &self,
        user: &UserKey,
        text: &str,
        explicit: Option<String>,
        context: Option<Map<String, Value>>,
    ) -> Result<TextReply, ExchangeError> {
        let Route { provider_id, input } = match explicit {
            // A recognised prefix is still stripped; the explicit choice wins.
            Some(id) => Route {
                provider_id: id,
                input: match split_directive(text) {
                    Some((prefix, rest)) if self.registry.contains(prefix) => rest,
                    _ => text,
                },
            },
            None => route_text(text, &self.registry),
        };

        let input = input.trim();
        if input.is_empty() {
            return Err(ExchangeError::Validation("message is required".to_string()));
        }
        let provider = self.provider(&provider_id)?;

        let history = self.window.read(user).await;
        info!(
            "Text exchange for {} via {} ({} prior turns)",
            user,
            provider_id,
            history.len()
        );

        let reply = match self
            .call_provider("generate", || provider.generate(user, input, &history))
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!(
                    "Provider {} failed for {} (transient={}): {}",
                    provider_id,
                    user,
                    e.is_transient(),
                    e
                );
                return Ok(TextReply {
                    text: self.settings.fallback_message.clone(),
                    provider: provider_id,
                    source: ReplySource::Fallback,
                });
            }
        };

        // Soft failures are already logged by the cache.
        let _ = self.window.append(user, ConversationTurn::user(input)).await;
        let _ = self
            .window
            .append(user, ConversationTurn::assistant(reply.text.clone()))
            .await;

        self.history.enqueue(
            InteractionRecord::builder(user.clone(), InteractionKind::Text)
                .input(input)
                .output(reply.text.clone())
                .provider(reply.provider_id.clone())
                .context(context.unwrap_or_default())
                .custom("provider", reply.provider_id.clone())
                .custom("model", reply.model.clone())
                .build(),
        );

        Ok(TextReply {
            text: reply.text,
            provider: reply.provider_id,
            source: ReplySource::Provider,
        })
    }

    async fn handle_image(
        &self,
        user: &UserKey,
        upload: ImageUpload,
        explicit: Option<String>,
    ) -> Result<ImageReply, ExchangeError> {
        let ext = self
            .images
            .check(&upload.file_name, upload.data.len())
            .map_err(ExchangeError::Validation)?;

        let provider_id = explicit.unwrap_or_else(|| self.registry.default_image().to_string());
        let provider = self.provider(&provider_id)?;

        let fp = fingerprint(&upload.data);
        let description = upload
            .description
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty());
        let meta = UploadMeta {
            file_name: &upload.file_name,
            ext: &ext,
            description,
            fingerprint: &fp,
        };

        if let Some(hit) = self.results.get(user, &fp).await {
            info!("Serving cached analysis for {} ({})", user, fp);
            self.record_image(user, &meta, &hit.output, true);
            return Ok(ImageReply {
                analysis: hit.output.text,
                model: Some(hit.output.model),
                provider: hit.output.provider_id,
                cached: true,
                source: ReplySource::Cache,
            });
        }

        let prepared = self.prepare_image(&upload.data, &ext).await?;
        let image = ImageInput {
            data: prepared.data,
            mime_type: prepared.mime_type,
            description: description.map(str::to_string),
        };

        let reply = match self
            .call_provider("analyze_image", || provider.analyze_image(&image))
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!(
                    "Image analysis via {} failed for {} (transient={}): {}",
                    provider_id,
                    user,
                    e.is_transient(),
                    e
                );
                return Ok(ImageReply {
                    analysis: self.settings.image_fallback_message.clone(),
                    model: None,
                    provider: provider_id,
                    cached: false,
                    source: ReplySource::Fallback,
                });
            }
        };

        let _ = self.results.put(user, &fp, &reply).await;
        self.record_image(user, &meta, &reply, false);

        Ok(ImageReply {
            analysis: reply.text,
            model: Some(reply.model),
            provider: reply.provider_id,
            cached: false,
            source: ReplySource::Provider,
        })
    }

    /// Decode and thumbnail on the blocking pool; undecodable uploads are
    /// validation errors.
    async fn prepare_image(&self, data: &Bytes, ext: &str) -> Result<PreparedImage, ExchangeError> {
        let policy = self.images.clone();
        let data = data.clone();
        let ext = ext.to_string();

        tokio::task::spawn_blocking(move || policy.prepare(&data, &ext))
            .await
            .map_err(|e| {
                warn!("Image preparation task failed: {}", e);
                ExchangeError::Validation(UNDECODABLE_IMAGE.to_string())
            })?
            .map_err(ExchangeError::Validation)
    }

    fn record_image(&self, user: &UserKey, meta: &UploadMeta<'_>, output: &ProviderReply, cached: bool) {
        let input = meta
            .description
            .map(str::to_string)
            .unwrap_or_else(|| format!("[image] {}", meta.file_name));

        self.history.enqueue(
            InteractionRecord::builder(user.clone(), InteractionKind::Image)
                .input(input)
                .output(output.text.clone())
                .provider(output.provider_id.clone())
                .custom("description", meta.description)
                .custom("fingerprint", meta.fingerprint.as_str())
                .custom("cached", cached)
                .custom("model", output.model.clone())
                .custom("image_ref", format!("local:{}.{}", meta.fingerprint, meta.ext))
                .build(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::testing::DownStore;
    use crate::cache::{FastStore, MemoryStore};
    use crate::config::{ImageConfig, LimitsConfig, ResultScope};
    use crate::history::testing::RecordingSink;
    use crate::services::providers::MockLlmProvider;
    use crate::utils::image::sample_png;
    use async_trait::async_trait;

    fn png() -> Vec<u8> {
        sample_png(8, 8)
    }

    struct Harness {
        orchestrator: Orchestrator,
        window: ConversationWindowCache,
        sink: Arc<RecordingSink>,
    }

    fn dyn_provider(provider: impl LlmProvider + 'static) -> Arc<dyn LlmProvider> {
        Arc::new(provider)
    }

    fn settings(timeout: Duration) -> ExchangeSettings {
        ExchangeSettings {
            provider_timeout: timeout,
            fallback_message: "fallback".to_string(),
            image_fallback_message: "image fallback".to_string(),
        }
    }

    fn harness_with(
        store: Arc<dyn FastStore>,
        providers: Vec<(&str, Arc<dyn LlmProvider>)>,
        window_size: usize,
        limits: LimitsConfig,
        timeout: Duration,
    ) -> Harness {
        let mut registry = ProviderRegistry::new("openai", "gemini");
        for (id, provider) in providers {
            registry.register(id, provider);
        }

        let window = ConversationWindowCache::new(store.clone(), window_size, Duration::from_secs(3600));
        let results = ResultCache::new(store, ResultScope::PerUser, Duration::from_secs(3600));
        let sink = Arc::new(RecordingSink::default());
        let images = ImagePolicy::new(&ImageConfig {
            allowed_extensions: vec!["jpg".into(), "jpeg".into(), "png".into(), "gif".into()],
            max_bytes: 1024 * 1024,
            max_dimension: 64,
        });

        let orchestrator = Orchestrator::new(
            registry,
            window.clone(),
            results,
            sink.clone(),
            images,
            Limiters::new(&limits),
            settings(timeout),
        );

        Harness {
            orchestrator,
            window,
            sink,
        }
    }

    fn harness(openai: MockLlmProvider, gemini: MockLlmProvider, window_size: usize) -> Harness {
        harness_with(
            Arc::new(MemoryStore::new()),
            vec![("openai", dyn_provider(openai)), ("gemini", dyn_provider(gemini))],
            window_size,
            LimitsConfig {
                provider_concurrency: 4,
                acquire_timeout_ms: 50,
            },
            Duration::from_secs(5),
        )
    }

    fn echo_provider(id: &'static str) -> MockLlmProvider {
        let mut provider = MockLlmProvider::new();
        provider
            .expect_generate()
            .returning(move |_, input, _| Ok(ProviderReply::new(format!("re:{}", input), id, "m")));
        provider
    }

    fn text(user: &str, body: &str) -> InboundMessage {
        InboundMessage::text(user, body)
    }

    fn unwrap_text(reply: OutboundReply) -> TextReply {
        match reply {
            OutboundReply::Text(reply) => reply,
            other => panic!("expected text reply, got {other:?}"),
        }
    }

    fn unwrap_image(reply: OutboundReply) -> ImageReply {
        match reply {
            OutboundReply::Image(reply) => reply,
            other => panic!("expected image reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_window_holds_min_of_2n_and_bound() {
        let h = harness(echo_provider("openai"), MockLlmProvider::new(), 4);
        let user = UserKey::new("U1");

        h.orchestrator.handle(text("U1", "m1")).await.unwrap();
        assert_eq!(h.window.read(&user).await.len(), 2);

        h.orchestrator.handle(text("U1", "m2")).await.unwrap();
        h.orchestrator.handle(text("U1", "m3")).await.unwrap();

        let contents: Vec<String> = h.window.read(&user).await.into_iter().map(|t| t.content).collect();
        assert_eq!(contents, vec!["m2", "re:m2", "m3", "re:m3"]);
    }

    #[tokio::test]
    async fn test_history_is_passed_to_provider() {
        let mut openai = MockLlmProvider::new();
        openai
            .expect_generate()
            .withf(|_, input, history| input == "first" && history.is_empty())
            .times(1)
            .returning(|_, _, _| Ok(ProviderReply::new("one", "openai", "m")));
        openai
            .expect_generate()
            .withf(|_, input, history| {
                input == "second"
                    && history == [ConversationTurn::user("first"), ConversationTurn::assistant("one")]
            })
            .times(1)
            .returning(|_, _, _| Ok(ProviderReply::new("two", "openai", "m")));

        let h = harness(openai, MockLlmProvider::new(), 10);
        h.orchestrator.handle(text("U1", "first")).await.unwrap();
        h.orchestrator.handle(text("U1", "second")).await.unwrap();
    }

    #[tokio::test]
    async fn test_gemini_prefix_routes_and_strips() {
        let mut openai = MockLlmProvider::new();
        openai.expect_generate().never();
        let mut gemini = MockLlmProvider::new();
        gemini
            .expect_generate()
            .withf(|_, input, _| input == "你好")
            .times(1)
            .returning(|_, _, _| Ok(ProviderReply::new("哈囉!", "gemini", "gemini-pro")));

        let h = harness(openai, gemini, 10);
        let reply = unwrap_text(h.orchestrator.handle(text("U1", "/gemini 你好")).await.unwrap());

        assert_eq!(reply.text, "哈囉!");
        assert_eq!(reply.provider, "gemini");
        assert_eq!(
            h.window.read(&UserKey::new("U1")).await,
            vec![ConversationTurn::user("你好"), ConversationTurn::assistant("哈囉!")]
        );

        let records = h.sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].provider_id, "gemini");
        assert_eq!(records[0].input_summary, "你好");
    }

    #[tokio::test]
    async fn test_unknown_prefix_is_plain_text_for_default() {
        let h = harness(echo_provider("openai"), MockLlmProvider::new(), 10);
        let reply = unwrap_text(h.orchestrator.handle(text("U1", "/claude hi")).await.unwrap());
        assert_eq!(reply.text, "re:/claude hi");
        assert_eq!(reply.provider, "openai");
    }

    #[tokio::test]
    async fn test_explicit_provider_wins_over_prefix() {
        let mut gemini = MockLlmProvider::new();
        gemini.expect_generate().never();
        let h = harness(echo_provider("openai"), gemini, 10);

        let message = text("U1", "/gemini 你好").with_directive("openai");
        let reply = unwrap_text(h.orchestrator.handle(message).await.unwrap());
        assert_eq!(reply.provider, "openai");
        assert_eq!(reply.text, "re:你好");
    }

    #[tokio::test]
    async fn test_explicit_unknown_provider_is_rejected() {
        let h = harness(MockLlmProvider::new(), MockLlmProvider::new(), 10);
        let err = h
            .orchestrator
            .handle(text("U1", "hi").with_directive("claude"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::UnknownProvider(id) if id == "claude"));
    }

    #[tokio::test]
    async fn test_every_inbound_message_marks_user_active() {
        let mut openai = MockLlmProvider::new();
        openai.expect_generate().times(1).returning(|_, _, _| {
            Err(ProviderError::Network("connection reset".to_string()))
        });
        let h = harness(openai, MockLlmProvider::new(), 10);

        h.orchestrator.handle(text("U1", "hi")).await.unwrap();
        h.orchestrator
            .handle(text("U2", "hi").with_directive("claude"))
            .await
            .unwrap_err();
        h.orchestrator.handle(text(" ", "hi")).await.unwrap_err();

        let touched: Vec<String> = h.sink.touched().iter().map(|u| u.to_string()).collect();
        assert_eq!(touched, vec!["U1", "U2"]);
        assert!(h.sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_blank_input_is_validation_error() {
        let h = harness(MockLlmProvider::new(), MockLlmProvider::new(), 10);
        for message in [text("U1", "   "), text("", "hi"), text("U1", "/gemini   ")] {
            let err = h.orchestrator.handle(message).await.unwrap_err();
            assert!(matches!(err, ExchangeError::Validation(_)));
        }
        assert!(h.sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_provider_error_leaves_window_unchanged() {
        let mut openai = MockLlmProvider::new();
        let mut calls = 0;
        openai.expect_generate().times(2).returning(move |_, _, _| {
            calls += 1;
            if calls == 1 {
                Ok(ProviderReply::new("ok", "openai", "m"))
            } else {
                Err(ProviderError::Upstream {
                    status: reqwest::StatusCode::BAD_GATEWAY,
                    body: "bad gateway".to_string(),
                })
            }
        });

        let h = harness(openai, MockLlmProvider::new(), 10);
        let user = UserKey::new("U1");
        h.orchestrator.handle(text("U1", "first")).await.unwrap();
        let before = h.window.read(&user).await;

        let reply = unwrap_text(h.orchestrator.handle(text("U1", "second")).await.unwrap());
        assert_eq!(reply.text, "fallback");
        assert_eq!(reply.source, ReplySource::Fallback);
        assert_eq!(h.window.read(&user).await, before);
        assert_eq!(h.sink.records().len(), 1);
    }

    struct SlowProvider;

    #[async_trait]
    impl LlmProvider for SlowProvider {
        async fn generate(
            &self,
            _user: &UserKey,
            _input: &str,
            _history: &[ConversationTurn],
        ) -> Result<ProviderReply, ProviderError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ProviderReply::new("too late", "openai", "m"))
        }

        async fn analyze_image(&self, _image: &ImageInput) -> Result<ProviderReply, ProviderError> {
            Err(ProviderError::Unsupported("image analysis"))
        }
    }

    #[tokio::test]
    async fn test_provider_timeout_falls_back() {
        let h = harness_with(
            Arc::new(MemoryStore::new()),
            vec![("openai", dyn_provider(SlowProvider))],
            10,
            LimitsConfig {
                provider_concurrency: 4,
                acquire_timeout_ms: 50,
            },
            Duration::from_millis(30),
        );

        let reply = unwrap_text(h.orchestrator.handle(text("U1", "hi")).await.unwrap());
        assert_eq!(reply.source, ReplySource::Fallback);
        assert!(h.window.read(&UserKey::new("U1")).await.is_empty());
        assert!(h.sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_saturated_limiter_falls_back() {
        let mut openai = MockLlmProvider::new();
        openai.expect_generate().never();
        let h = harness_with(
            Arc::new(MemoryStore::new()),
            vec![("openai", dyn_provider(openai))],
            10,
            LimitsConfig {
                provider_concurrency: 1,
                acquire_timeout_ms: 20,
            },
            Duration::from_secs(5),
        );

        let _held = h.orchestrator.limiters.provider.clone().acquire_owned().await.unwrap();
        let reply = unwrap_text(h.orchestrator.handle(text("U1", "hi")).await.unwrap());
        assert_eq!(reply.text, "fallback");
    }

    #[tokio::test]
    async fn test_store_down_still_replies() {
        let h = harness_with(
            Arc::new(DownStore),
            vec![("openai", dyn_provider(echo_provider("openai")))],
            10,
            LimitsConfig {
                provider_concurrency: 4,
                acquire_timeout_ms: 50,
            },
            Duration::from_secs(5),
        );

        let reply = unwrap_text(h.orchestrator.handle(text("U1", "hi")).await.unwrap());
        assert_eq!(reply.text, "re:hi");
        assert_eq!(reply.source, ReplySource::Provider);
        assert!(h.window.read(&UserKey::new("U1")).await.is_empty());
        assert_eq!(h.sink.records().len(), 1);
    }

    #[tokio::test]
    async fn test_text_record_carries_caller_context() {
        let h = harness(echo_provider("openai"), MockLlmProvider::new(), 10);
        let mut context = Map::new();
        context.insert("channel".into(), Value::from("line"));

        h.orchestrator
            .handle(text("U1", "hi").with_context(context))
            .await
            .unwrap();

        let record = &h.sink.records()[0];
        assert_eq!(record.kind, InteractionKind::Text);
        assert_eq!(record.context["channel"], "line");
        assert_eq!(record.context["provider"], "openai");
    }

    fn vision_provider(expected_calls: usize) -> MockLlmProvider {
        let mut gemini = MockLlmProvider::new();
        gemini
            .expect_analyze_image()
            .times(expected_calls)
            .returning(|image| {
                assert_eq!(image.mime_type, "image/png");
                Ok(ProviderReply::new("一張圖", "gemini", "gemini-pro-vision"))
            });
        gemini
    }

    fn upload(name: &str, data: &[u8]) -> ImageUpload {
        ImageUpload::new(name, Bytes::copy_from_slice(data))
    }

    #[tokio::test]
    async fn test_same_image_twice_calls_provider_once() {
        let h = harness(MockLlmProvider::new(), vision_provider(1), 10);

        let first = unwrap_image(
            h.orchestrator
                .handle(InboundMessage::image("U1", upload("a.png", &png())))
                .await
                .unwrap(),
        );
        let second = unwrap_image(
            h.orchestrator
                .handle(InboundMessage::image("U1", upload("renamed.PNG", &png())))
                .await
                .unwrap(),
        );

        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(first.analysis, second.analysis);
        assert_eq!(second.model.as_deref(), Some("gemini-pro-vision"));
        assert_eq!(second.source, ReplySource::Cache);

        let records = h.sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].context["cached"], true);
        assert_eq!(
            records[1].context["image_ref"],
            format!("local:{}.png", fingerprint(&png()))
        );
    }

    #[tokio::test]
    async fn test_per_user_scope_calls_provider_for_each_user() {
        let h = harness(MockLlmProvider::new(), vision_provider(2), 10);
        for user in ["A", "B"] {
            let reply = unwrap_image(
                h.orchestrator
                    .handle(InboundMessage::image(user, upload("a.png", &png())))
                    .await
                    .unwrap(),
            );
            assert!(!reply.cached);
        }
    }

    #[tokio::test]
    async fn test_rejected_image_never_reaches_provider() {
        let mut gemini = MockLlmProvider::new();
        gemini.expect_analyze_image().never();
        let h = harness(MockLlmProvider::new(), gemini, 10);

        for bad in [upload("doc.pdf", &png()), upload("empty.png", b""), upload("noext", &png())] {
            let err = h
                .orchestrator
                .handle(InboundMessage::image("U1", bad))
                .await
                .unwrap_err();
            assert!(matches!(err, ExchangeError::Validation(_)));
        }
        assert!(h.sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_image_is_rejected_before_provider() {
        let mut gemini = MockLlmProvider::new();
        gemini.expect_analyze_image().never();
        let h = harness(MockLlmProvider::new(), gemini, 10);

        let bogus = upload("cat.png", b"\x89PNG\r\n\x1a\n\x00\x00\x00\rIHDR");
        let err = h
            .orchestrator
            .handle(InboundMessage::image("U1", bogus))
            .await
            .unwrap_err();

        assert!(matches!(err, ExchangeError::Validation(msg) if msg == UNDECODABLE_IMAGE));
        assert!(h.sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_large_image_is_thumbnailed_before_provider() {
        let mut gemini = MockLlmProvider::new();
        gemini
            .expect_analyze_image()
            .withf(|input| {
                let decoded = image::load_from_memory(&input.data).unwrap();
                input.mime_type == "image/png" && decoded.width() == 64 && decoded.height() == 32
            })
            .times(1)
            .returning(|_| Ok(ProviderReply::new("一張大圖", "gemini", "gemini-pro-vision")));
        let h = harness(MockLlmProvider::new(), gemini, 10);

        let original = sample_png(200, 100);
        let reply = unwrap_image(
            h.orchestrator
                .handle(InboundMessage::image("U1", upload("big.jpg", &original)))
                .await
                .unwrap(),
        );

        assert_eq!(reply.analysis, "一張大圖");
        // Cached under the fingerprint of what the user sent.
        assert_eq!(
            h.sink.records()[0].context["fingerprint"],
            fingerprint(&original).as_str()
        );
    }

    #[tokio::test]
    async fn test_failed_analysis_is_not_cached() {
        let mut gemini = MockLlmProvider::new();
        let mut calls = 0;
        gemini.expect_analyze_image().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(ProviderError::MalformedResponse("no candidates".into()))
            } else {
                Ok(ProviderReply::new("second try", "gemini", "gemini-pro-vision"))
            }
        });
        let h = harness(MockLlmProvider::new(), gemini, 10);

        let first = unwrap_image(
            h.orchestrator
                .handle(InboundMessage::image("U1", upload("a.png", &png())))
                .await
                .unwrap(),
        );
        assert_eq!(first.analysis, "image fallback");
        assert_eq!(first.source, ReplySource::Fallback);
        assert!(h.sink.records().is_empty());

        let second = unwrap_image(
            h.orchestrator
                .handle(InboundMessage::image("U1", upload("a.png", &png())))
                .await
                .unwrap(),
        );
        assert_eq!(second.analysis, "second try");
        assert!(!second.cached);
    }

    #[tokio::test]
    async fn test_image_description_reaches_provider() {
        let mut gemini = MockLlmProvider::new();
        gemini
            .expect_analyze_image()
            .withf(|image| image.description.as_deref() == Some("這是什麼?"))
            .times(1)
            .returning(|_| Ok(ProviderReply::new("一朵花", "gemini", "gemini-pro-vision")));
        let h = harness(MockLlmProvider::new(), gemini, 10);

        let message = InboundMessage::image(
            "U1",
            upload("flower.png", &png()).with_description("  這是什麼?  "),
        );
        h.orchestrator.handle(message).await.unwrap();
        assert_eq!(h.sink.records()[0].input_summary, "這是什麼?");
    }

    #[tokio::test]
    async fn test_image_store_down_still_analyzes() {
        let h = harness_with(
            Arc::new(DownStore),
            vec![("gemini", dyn_provider(vision_provider(2)))],
            10,
            LimitsConfig {
                provider_concurrency: 4,
                acquire_timeout_ms: 50,
            },
            Duration::from_secs(5),
        );

        for _ in 0..2 {
            let reply = unwrap_image(
                h.orchestrator
                    .handle(InboundMessage::image("U1", upload("a.png", &png())))
                    .await
                    .unwrap(),
            );
            assert_eq!(reply.analysis, "一張圖");
            assert!(!reply.cached);
        }
    }
}
