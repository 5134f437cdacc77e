use crate::modules::coercion::{coerce_patch, filter_unknown, CoercionDiagnostic, UnknownParamPolicy};
use crate::modules::config::PipelineOptions;
use crate::modules::param_registry::ParamRegistry;
use crate::modules::patcher::{apply_patch, diff_settings};
use crate::modules::protocol::{
    DiffItem, ErrorBody, ErrorCode, GenerateRequest, GenerateResponse, ParamPatch, PresetDocument,
    ProviderHealth, StreamEvent,
};
use crate::modules::providers::{ChunkStream, LlmError, LlmProvider, ProviderSet};
use crate::modules::render::PreviewRenderer;
use crate::modules::response::{parse_llm_response, ResponseFormatError};
use crate::modules::storage::{fetch_preset, PresetStore, StorageError};
use crate::modules::system_prompt::{build_system_prompt, build_user_prompt};
use base64::Engine as _;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

const HEALTH_PROMPT: &str = "Say 'ok' and nothing else.";
const HEALTH_SYSTEM: &str = "You are a connectivity probe. Answer as briefly as possible.";
const HEALTH_RESPONSE_MAX_CHARS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    BuiltPrompt,
    AwaitingLlm,
    ParsingResponse,
    CoercingPatch,
    ApplyingPatch,
    Rendering,
    Complete,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    ClientInput(String),
    #[error("failed to fetch preset: {0}")]
    UpstreamFetch(#[source] StorageError),
    #[error("{message}")]
    LlmFormat { message: String, raw: String },
    #[error(transparent)]
    LlmProvider(#[from] LlmError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ResponseFormatError> for PipelineError {
    fn from(e: ResponseFormatError) -> Self {
        PipelineError::LlmFormat {
            message: e.to_string(),
            raw: e.raw,
        }
    }
}

impl PipelineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PipelineError::ClientInput(_) => ErrorCode::ClientInput,
            PipelineError::UpstreamFetch(_) => ErrorCode::UpstreamFetch,
            PipelineError::LlmFormat { .. } => ErrorCode::LlmFormat,
            PipelineError::LlmProvider(_) => ErrorCode::LlmProvider,
            PipelineError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Status reported by the preset store, for upstream fetch failures.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            PipelineError::UpstreamFetch(e) => e.status(),
            _ => None,
        }
    }

    pub fn to_error_body(&self) -> ErrorBody {
        let raw = match self {
            PipelineError::LlmFormat { raw, .. } => Some(raw.clone()),
            _ => None,
        };
        ErrorBody {
            error: self.to_string(),
            code: self.code(),
            raw,
        }
    }
}

/// Result of running an untrusted patch through coercion and application.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchOutcome {
    pub document: PresetDocument,
    pub patch: ParamPatch,
    pub diff: Vec<DiffItem>,
    pub diagnostics: Vec<CoercionDiagnostic>,
}

pub fn patch_document(
    base: &PresetDocument,
    raw: &Map<String, Value>,
    registry: &ParamRegistry,
    policy: UnknownParamPolicy,
) -> PatchOutcome {
    enter(PipelineStage::CoercingPatch);
    let coerced = coerce_patch(raw);
    let (patch, dropped) = filter_unknown(coerced.patch, registry, policy);

    let mut diagnostics = coerced.diagnostics;
    diagnostics.extend(dropped);
    if patch.is_empty() && !raw.is_empty() {
        tracing::info!(proposed = raw.len(), "no proposed change survived coercion");
    }

    enter(PipelineStage::ApplyingPatch);
    let document = apply_patch(base, &patch);
    let diff = diff_settings(base, &patch);
    PatchOutcome {
        document,
        patch,
        diff,
        diagnostics,
    }
}

/// A generated response plus what the model proposed before coercion.
#[derive(Debug, Clone)]
pub struct Generation {
    pub response: GenerateResponse,
    /// Entries in the model's `changes` object.
    pub proposed: usize,
    pub diagnostics: Vec<CoercionDiagnostic>,
}

/// Everything resolved before the LLM is contacted.
struct Prepared {
    document: PresetDocument,
    llm: Arc<dyn LlmProvider>,
    user_prompt: String,
}

/// The generation orchestrator. Long-lived collaborators are injected once; every
/// request is independent.
#[derive(Clone)]
pub struct PatchPipeline {
    registry: Arc<ParamRegistry>,
    system_prompt: Arc<str>,
    providers: ProviderSet,
    store: Option<Arc<dyn PresetStore>>,
    renderer: Option<Arc<dyn PreviewRenderer>>,
    options: PipelineOptions,
}

impl PatchPipeline {
    pub fn new(registry: Arc<ParamRegistry>, providers: ProviderSet) -> Self {
        let system_prompt: Arc<str> = build_system_prompt(&registry).into();
        Self {
            registry,
            system_prompt,
            providers,
            store: None,
            renderer: None,
            options: PipelineOptions::default(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn PresetStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn PreviewRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn registry(&self) -> &ParamRegistry {
        &self.registry
    }

    pub fn providers(&self) -> &ProviderSet {
        &self.providers
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Apply a text description to a preset given inline or by id.
    pub async fn apply_description(
        &self,
        req: GenerateRequest,
    ) -> Result<GenerateResponse, PipelineError> {
        let base = self.resolve_document(&req).await?;
        self.generate_for(&req.description, base, req.provider.as_deref(), req.skip_render)
            .await
    }

    /// Same as [`apply_description`](Self::apply_description) with an already
    /// resolved base document. `None` starts from an empty preset.
    pub async fn generate_for(
        &self,
        description: &str,
        base: Option<PresetDocument>,
        provider: Option<&str>,
        skip_render: bool,
    ) -> Result<GenerateResponse, PipelineError> {
        self.generate_detailed(description, base, provider, skip_render)
            .await
            .map(|g| g.response)
    }

    /// Like [`generate_for`](Self::generate_for), keeping the coercion report.
    pub async fn generate_detailed(
        &self,
        description: &str,
        base: Option<PresetDocument>,
        provider: Option<&str>,
        skip_render: bool,
    ) -> Result<Generation, PipelineError> {
        let prepared = self.prepare(description, base, provider)?;

        enter(PipelineStage::AwaitingLlm);
        let raw = prepared
            .llm
            .generate(&self.system_prompt, &prepared.user_prompt)
            .await?;
        self.finish(&prepared.document, &raw, skip_render).await
    }

    /// Streaming variant. Input problems are returned before any event; afterwards
    /// every failure arrives as a final [`StreamEvent::Error`]. Dropping the stream
    /// stops generation.
    pub async fn stream_description(
        &self,
        req: GenerateRequest,
    ) -> Result<BoxStream<'static, StreamEvent>, PipelineError> {
        let base = self.resolve_document(&req).await?;
        let prepared = self.prepare(&req.description, base, req.provider.as_deref())?;

        enter(PipelineStage::AwaitingLlm);
        let chunks = prepared
            .llm
            .stream(&self.system_prompt, &prepared.user_prompt)
            .await?;

        let state = StreamState::Streaming {
            chunks,
            text: String::new(),
            document: prepared.document,
            pipeline: self.clone(),
            skip_render: req.skip_render,
        };
        Ok(stream::unfold(state, next_stream_event).boxed())
    }

    /// Sends a trivial prompt and reports whether the provider answered.
    pub async fn check_provider_health(&self, provider: Option<&str>) -> ProviderHealth {
        let name = provider
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(self.providers.default_name())
            .to_string();

        let result = match self.providers.get(Some(&name)) {
            Ok(llm) => llm.generate(HEALTH_SYSTEM, HEALTH_PROMPT).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(text) => {
                let snippet: String = text.trim().chars().take(HEALTH_RESPONSE_MAX_CHARS).collect();
                ProviderHealth {
                    healthy: true,
                    provider: name,
                    message: "Provider is responding".to_string(),
                    test_response: (!snippet.is_empty()).then_some(snippet),
                }
            }
            Err(e) => {
                tracing::warn!(provider = %name, "provider health check failed: {e}");
                ProviderHealth {
                    healthy: false,
                    provider: name,
                    message: e.to_string(),
                    test_response: None,
                }
            }
        }
    }

    pub fn patch_with(&self, base: &PresetDocument, raw: &Map<String, Value>) -> PatchOutcome {
        patch_document(base, raw, &self.registry, self.options.unknown_params)
    }

    async fn resolve_document(
        &self,
        req: &GenerateRequest,
    ) -> Result<Option<PresetDocument>, PipelineError> {
        let id = req
            .preset_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let data = req.preset_data.as_ref().filter(|v| !v.is_null());

        match (id, data) {
            (Some(_), Some(_)) => Err(PipelineError::ClientInput(
                "provide either preset_id or preset_data, not both".to_string(),
            )),
            (None, None) => Err(PipelineError::ClientInput(
                "either preset_id or preset_data is required".to_string(),
            )),
            (None, Some(value)) => PresetDocument::from_value(value.clone())
                .map(Some)
                .map_err(|e| PipelineError::ClientInput(format!("preset_data: {e}"))),
            (Some(id), None) => {
                if req.description.trim().is_empty() {
                    return Err(PipelineError::ClientInput("description is required".to_string()));
                }
                let store = self.store.as_ref().ok_or_else(|| {
                    PipelineError::ClientInput(
                        "preset_id lookups are unavailable: no preset store configured".to_string(),
                    )
                })?;
                match fetch_preset(store.as_ref(), id).await {
                    Ok(doc) => Ok(Some(doc)),
                    Err(StorageError::InvalidKey(key)) => {
                        Err(PipelineError::ClientInput(format!("invalid preset_id {key:?}")))
                    }
                    Err(e) => {
                        tracing::warn!(preset_id = id, "preset fetch failed: {e}");
                        Err(PipelineError::UpstreamFetch(e))
                    }
                }
            }
        }
    }

    fn prepare(
        &self,
        description: &str,
        base: Option<PresetDocument>,
        provider: Option<&str>,
    ) -> Result<Prepared, PipelineError> {
        let description = description.trim();
        if description.is_empty() {
            return Err(PipelineError::ClientInput("description is required".to_string()));
        }
        let llm = self.providers.get(provider)?;

        let user_prompt =
            build_user_prompt(description, base.as_ref(), self.options.context_max_chars);
        enter(PipelineStage::BuiltPrompt);
        tracing::info!(
            provider = llm.name(),
            prompt_chars = user_prompt.len(),
            "generating patch"
        );

        Ok(Prepared {
            document: base.unwrap_or_default(),
            llm,
            user_prompt,
        })
    }

    async fn finish(
        &self,
        base: &PresetDocument,
        raw: &str,
        skip_render: bool,
    ) -> Result<Generation, PipelineError> {
        enter(PipelineStage::ParsingResponse);
        let parsed = parse_llm_response(raw).map_err(|e| {
            tracing::warn!("llm output is not the contracted object: {}", e.message);
            PipelineError::from(e)
        })?;

        let outcome = self.patch_with(base, &parsed.changes);

        let audio = if skip_render {
            None
        } else {
            self.render_audio(&outcome.document).await
        };

        enter(PipelineStage::Complete);
        tracing::info!(
            changes = outcome.patch.len(),
            dropped = outcome.diagnostics.len(),
            audio = audio.is_some(),
            "patch generated"
        );

        Ok(Generation {
            response: GenerateResponse {
                modified_preset: outcome.document,
                changes: outcome.patch,
                explanation: parsed.explanation,
                audio,
                diff: outcome.diff,
            },
            proposed: parsed.changes.len(),
            diagnostics: outcome.diagnostics,
        })
    }

    /// Best effort: any failure is logged and yields `None`.
    async fn render_audio(&self, document: &PresetDocument) -> Option<String> {
        let renderer = self.renderer.as_ref()?;
        enter(PipelineStage::Rendering);
        match renderer.render_preview(document, &self.options.preview).await {
            Ok(wav) => Some(base64::engine::general_purpose::STANDARD.encode(wav)),
            Err(e) => {
                tracing::warn!(renderer = renderer.name(), "preview render failed: {e}");
                None
            }
        }
    }
}

impl std::fmt::Debug for PatchPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchPipeline")
            .field("registry_len", &self.registry.len())
            .field("providers", &self.providers)
            .field("store", &self.store.is_some())
            .field("renderer", &self.renderer.as_ref().map(|r| r.name().to_string()))
            .field("options", &self.options)
            .finish()
    }
}

fn enter(stage: PipelineStage) {
    tracing::debug!(?stage, "pipeline stage");
}

enum StreamState {
    Streaming {
        chunks: ChunkStream,
        text: String,
        document: PresetDocument,
        pipeline: PatchPipeline,
        skip_render: bool,
    },
    Done,
}

async fn next_stream_event(state: StreamState) -> Option<(StreamEvent, StreamState)> {
    let StreamState::Streaming {
        mut chunks,
        mut text,
        document,
        pipeline,
        skip_render,
    } = state
    else {
        return None;
    };

    match chunks.next().await {
        Some(Ok(chunk)) => {
            text.push_str(&chunk);
            let next = StreamState::Streaming {
                chunks,
                text,
                document,
                pipeline,
                skip_render,
            };
            Some((StreamEvent::Chunk { text: chunk }, next))
        }
        Some(Err(e)) => {
            let err = PipelineError::from(e);
            Some((StreamEvent::Error(err.to_error_body()), StreamState::Done))
        }
        None => {
            let event = match pipeline.finish(&document, &text, skip_render).await {
                Ok(generated) => StreamEvent::Complete(generated.response),
                Err(e) => StreamEvent::Error(e.to_error_body()),
            };
            Some((event, StreamState::Done))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct Canned(&'static str);

    #[async_trait]
    impl LlmProvider for Canned {
        fn name(&self) -> &str {
            "canned"
        }

        async fn generate(&self, _system: &str, _user: &str) -> Result<String, LlmError> {
            Ok(self.0.to_string())
        }
    }

    fn pipeline(reply: &'static str) -> PatchPipeline {
        let registry = Arc::new(ParamRegistry::from_names(["filter_1_cutoff", "volume"]));
        PatchPipeline::new(registry, ProviderSet::new("canned").with_provider(Arc::new(Canned(reply))))
    }

    fn request(data: Value) -> GenerateRequest {
        GenerateRequest {
            description: "brighter".into(),
            preset_data: Some(data),
            ..Default::default()
        }
    }

    #[test]
    fn error_bodies_carry_codes() {
        let e = PipelineError::LlmFormat { message: "bad".into(), raw: "xyz".into() };
        let body = e.to_error_body();
        assert_eq!(body.code, ErrorCode::LlmFormat);
        assert_eq!(body.raw.as_deref(), Some("xyz"));

        let e = PipelineError::UpstreamFetch(StorageError::BadStatus { status: 403, body: String::new() });
        assert_eq!(e.upstream_status(), Some(403));
        assert_eq!(e.to_error_body().raw, None);
    }

    #[test]
    fn patch_document_collects_all_diagnostics() {
        let reg = ParamRegistry::from_names(["volume"]);
        let raw = json!({"volume": "0.5", "bogus": 1, "bad": "loud"});
        let out = patch_document(
            &PresetDocument::new(),
            raw.as_object().unwrap(),
            &reg,
            UnknownParamPolicy::Drop,
        );
        assert_eq!(out.patch.len(), 1);
        assert_eq!(out.document.setting("volume"), Some(0.5));
        assert_eq!(out.diagnostics.len(), 2);
        assert_eq!(out.diff.len(), 1);
    }

    /// Records `stage` and `key` fields of every event, in emission order.
    struct FieldRecorder(Arc<std::sync::Mutex<Vec<String>>>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for FieldRecorder {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            struct Visitor(Vec<String>);
            impl tracing::field::Visit for Visitor {
                fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
                    if matches!(field.name(), "stage" | "key") {
                        self.0.push(format!("{}={:?}", field.name(), value));
                    }
                }
            }
            let mut v = Visitor(Vec::new());
            event.record(&mut v);
            self.0.lock().unwrap().extend(v.0);
        }
    }

    #[test]
    fn stages_are_logged_around_the_work_they_name() {
        use tracing_subscriber::layer::SubscriberExt;

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::registry().with(FieldRecorder(Arc::clone(&seen)));
        let raw = json!({"volume": "loud"});
        tracing::subscriber::with_default(subscriber, || {
            patch_document(
                &PresetDocument::new(),
                raw.as_object().unwrap(),
                &ParamRegistry::from_names(["volume"]),
                UnknownParamPolicy::Accept,
            )
        });

        let seen = seen.lock().unwrap().clone();
        let at = |needle: &str| seen.iter().position(|e| e == needle).unwrap();
        assert!(at("stage=CoercingPatch") < at("key=\"volume\""));
        assert!(at("key=\"volume\"") < at("stage=ApplyingPatch"));
    }

    #[tokio::test]
    async fn both_inputs_is_client_error() {
        let p = pipeline("{}");
        let req = GenerateRequest {
            preset_id: Some("abc".into()),
            ..request(json!({}))
        };
        assert!(matches!(p.apply_description(req).await, Err(PipelineError::ClientInput(_))));
    }

    #[tokio::test]
    async fn non_object_preset_data_is_client_error() {
        let p = pipeline("{}");
        let err = p.apply_description(request(json!([1, 2]))).await.unwrap_err();
        assert!(matches!(err, PipelineError::ClientInput(ref m) if m.contains("array")));
    }

    #[tokio::test]
    async fn id_without_store_is_client_error() {
        let p = pipeline("{}");
        let req = GenerateRequest {
            description: "x".into(),
            preset_id: Some("abc".into()),
            ..Default::default()
        };
        assert!(matches!(p.apply_description(req).await, Err(PipelineError::ClientInput(_))));
    }

    #[tokio::test]
    async fn no_survivors_is_a_noop_patch() {
        let p = pipeline(r#"{"changes": {"volume": "very loud"}, "explanation": "tried"}"#);
        let base = json!({"settings": {"volume": 0.2}});
        let resp = p.apply_description(request(base)).await.unwrap();
        assert!(resp.changes.is_empty());
        assert_eq!(resp.modified_preset.setting("volume"), Some(0.2));
        assert_eq!(resp.explanation, "tried");
        assert!(resp.diff.is_empty());
    }

    #[tokio::test]
    async fn detailed_generation_reports_what_coercion_dropped() {
        let p = pipeline(r#"{"changes": {"volume": "0.4", "filter_1_cutoff": "bright"}, "explanation": "e"}"#);
        let base = PresetDocument::from_value(json!({"settings": {"volume": 0.2}})).unwrap();
        let g = p.generate_detailed("brighter", Some(base), None, true).await.unwrap();
        assert_eq!(g.proposed, 2);
        assert_eq!(g.response.changes.len(), 1);
        assert_eq!(g.diagnostics.len(), 1);
        assert_eq!(g.diagnostics[0].key(), "filter_1_cutoff");
    }

    #[tokio::test]
    async fn unknown_provider_is_reported() {
        let p = pipeline("{}");
        let req = GenerateRequest {
            provider: Some("nope".into()),
            ..request(json!({}))
        };
        assert!(matches!(
            p.apply_description(req).await,
            Err(PipelineError::LlmProvider(LlmError::UnknownProvider(_)))
        ));
    }

    #[tokio::test]
    async fn health_check_truncates_reply() {
        let p = pipeline("ok ok ok ok ok ok ok ok ok ok ok ok ok ok ok ok ok ok ok ok");
        let h = p.check_provider_health(None).await;
        assert!(h.healthy);
        assert_eq!(h.provider, "canned");
        assert_eq!(h.test_response.map(|s| s.chars().count()), Some(50));

        let h = p.check_provider_health(Some("missing")).await;
        assert!(!h.healthy);
        assert_eq!(h.provider, "missing");
        assert!(h.test_response.is_none());
    }

    #[tokio::test]
    async fn stream_ends_with_complete_event() {
        let p = pipeline(r#"{"changes": {"volume": 0.9}, "explanation": "louder"}"#);
        let events: Vec<StreamEvent> = p
            .stream_description(request(json!({"settings": {}})))
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], StreamEvent::Chunk { .. }));
        match &events[1] {
            StreamEvent::Complete(resp) => assert_eq!(resp.changes.get("volume"), Some(0.9)),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_reports_format_error_as_event() {
        let p = pipeline("not json at all");
        let events: Vec<StreamEvent> = p
            .stream_description(request(json!({})))
            .await
            .unwrap()
            .collect()
            .await;
        match events.last() {
            Some(StreamEvent::Error(body)) => {
                assert_eq!(body.code, ErrorCode::LlmFormat);
                assert_eq!(body.raw.as_deref(), Some("not json at all"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
