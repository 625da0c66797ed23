//! Provider (C6): the public segmentation surface and its lifecycle state
//! machine. Grounded in `core::classifier`'s lazily-initialized, cached
//! engine handle (`static CLIP_ENGINE: Lazy<Mutex<Option<(String, Arc<ClipEngine>)>>>`),
//! generalized into an explicit, observable state machine because this
//! spec requires lifecycle transitions the teacher's CLIP path never
//! surfaced to callers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::capability::{self, Capabilities};
use crate::core::engine::EngineOptions;
use crate::core::error::{Result, SamError};
use crate::core::model_store::ModelStore;
use crate::core::types::{
    CachedModelInfo, ModelLoadProgress, ProviderState, SegmentationRequest, SegmentationResponse,
    LOW_VRAM_THRESHOLD_BYTES,
};
use crate::core::worker::WorkerHandle;

struct Session {
    image_id: String,
    previous_mask_logits: Option<Vec<f32>>,
}

struct Inner {
    state: ProviderState,
    worker: Option<Arc<WorkerHandle>>,
    session: Option<Session>,
}

pub struct Provider {
    inner: Mutex<Inner>,
    model_store: Arc<ModelStore>,
    engine_options: EngineOptions,
    low_vram_threshold_bytes: u64,
    capabilities: once_cell::sync::OnceCell<Capabilities>,
    download_cancel: Mutex<CancellationToken>,
    /// Bumped on every `abort()`; any pending worker call subscribed to
    /// this channel at submission time loses the race and returns
    /// `Aborted` instead of its real response.
    abort_generation: watch::Sender<u64>,
    session_seq: AtomicU64,
    /// Mirrors `inner.state` so callers (the Tauri command layer) can
    /// observe every transition and re-emit `sam.providerStatusChanged`
    /// without polling. `inner.state` stays the single source of truth;
    /// this channel is updated at every assignment site under the same
    /// lock, never read back to decide behavior.
    state_tx: watch::Sender<ProviderState>,
}

impl Provider {
    pub fn new(model_store: Arc<ModelStore>, engine_options: EngineOptions) -> Self {
        Self::with_low_vram_threshold(model_store, engine_options, LOW_VRAM_THRESHOLD_BYTES)
    }

    pub fn with_low_vram_threshold(
        model_store: Arc<ModelStore>,
        engine_options: EngineOptions,
        low_vram_threshold_bytes: u64,
    ) -> Self {
        let (abort_generation, _) = watch::channel(0u64);
        let (state_tx, _) = watch::channel(ProviderState::Idle);
        Self {
            inner: Mutex::new(Inner {
                state: ProviderState::Idle,
                worker: None,
                session: None,
            }),
            model_store,
            engine_options,
            low_vram_threshold_bytes,
            capabilities: once_cell::sync::OnceCell::new(),
            download_cancel: Mutex::new(CancellationToken::new()),
            abort_generation,
            session_seq: AtomicU64::new(0),
            state_tx,
        }
    }

    /// Subscribe to lifecycle transitions. The receiver always yields the
    /// current state first, then every subsequent transition in order.
    pub fn subscribe_state(&self) -> watch::Receiver<ProviderState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, inner: &mut Inner, state: ProviderState) {
        inner.state = state;
        let _ = self.state_tx.send(state);
    }

    pub fn are_models_cached(&self) -> bool {
        self.model_store.is_cached()
    }

    pub fn model_download_info(&self) -> Option<CachedModelInfo> {
        self.model_store.cached_info()
    }

    pub fn total_expected_download_bytes(&self) -> u64 {
        self.model_store.total_expected_bytes()
    }

    /// Consults the Capability Probe once and caches the result; used for
    /// UI warnings only, never to gate whether segmentation may proceed.
    pub fn is_available(&self) -> &Capabilities {
        self.capabilities
            .get_or_init(|| capability::probe(self.low_vram_threshold_bytes))
    }

    pub async fn state(&self) -> ProviderState {
        self.inner.lock().await.state
    }

    /// Idempotent initialize. Concurrent callers serialize on the same
    /// async mutex the rest of the provider's state lives behind, so the
    /// second caller observes `Ready` (or the propagated error) without
    /// redoing the model load — the same single-flight effect as sharing
    /// an in-flight future, without introducing a futures-combinator
    /// dependency the teacher's stack doesn't carry (see DESIGN.md).
    pub async fn initialize(&self, mut on_progress: impl FnMut(ModelLoadProgress)) -> Result<()> {
        let mut inner = self.inner.lock().await;

        if inner.state == ProviderState::Ready {
            return Ok(());
        }

        self.set_state(&mut inner, ProviderState::LoadingModels);
        let cancel = { self.download_cancel.lock().await.clone() };

        let loaded = self.model_store.load_all(&mut on_progress, &cancel).await;
        let loaded = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                self.set_state(&mut inner, ProviderState::Error);
                return Err(e);
            }
        };

        self.set_state(&mut inner, ProviderState::Initializing);
        let worker = WorkerHandle::spawn();
        match worker
            .initialize(loaded.encoder, loaded.decoder, self.engine_options.clone())
            .await
        {
            Ok(_provider_used) => {
                inner.worker = Some(Arc::new(worker));
                self.set_state(&mut inner, ProviderState::Ready);
                Ok(())
            }
            Err(e) => {
                self.set_state(&mut inner, ProviderState::Error);
                Err(e)
            }
        }
    }

    /// Allocate a fresh `imageId` and drop any cached previous-mask logits.
    /// Must be called whenever the segmented image changes.
    pub async fn start_new_session(&self) -> String {
        let mut inner = self.inner.lock().await;
        let id = format!("img-{}", Uuid::new_v4());
        inner.session = Some(Session {
            image_id: id.clone(),
            previous_mask_logits: None,
        });
        id
    }

    async fn ensure_session(inner: &mut Inner, session_seq: &AtomicU64) -> String {
        if let Some(session) = &inner.session {
            return session.image_id.clone();
        }
        let id = format!("img-auto-{}", session_seq.fetch_add(1, Ordering::Relaxed));
        eprintln!("sam2: no active session; auto-creating `{id}` — call startNewSession() explicitly");
        inner.session = Some(Session {
            image_id: id.clone(),
            previous_mask_logits: None,
        });
        id
    }

    /// Send an `encode` request for the current (or auto-created) session
    /// without waiting on user prompts — meant to run ahead of user input.
    pub async fn pre_encode_image(&self, rgba: Vec<u8>, width: u32, height: u32) -> Result<f64> {
        self.ensure_ready().await?;
        let image_id = {
            let mut inner = self.inner.lock().await;
            Self::ensure_session(&mut inner, &self.session_seq).await
        };
        let worker = self.worker_handle().await?;
        self.race_abort(worker.encode(image_id, rgba, width, height)).await
    }

    /// Require `ready` (auto-initializing from `idle`), submit a `segment`
    /// request, and on success cache the selected candidate's logits as
    /// this session's `previousMaskLogits` for the next iterative decode.
    pub async fn segment_single_view(&self, req: SegmentationRequest) -> Result<SegmentationResponse> {
        if self.state().await == ProviderState::Idle {
            self.initialize(|_| {}).await?;
        }
        self.ensure_ready().await?;

        let (image_id, previous_logits) = {
            let mut inner = self.inner.lock().await;
            let id = Self::ensure_session(&mut inner, &self.session_seq).await;
            let prev = inner
                .session
                .as_ref()
                .and_then(|s| s.previous_mask_logits.clone());
            self.set_state(&mut inner, ProviderState::Processing);
            (id, prev)
        };

        let worker = self.worker_handle().await?;
        let result = self
            .race_abort(worker.segment(
                image_id,
                req.rgba,
                req.width,
                req.height,
                req.points,
                previous_logits,
            ))
            .await;

        let mut inner = self.inner.lock().await;
        self.set_state(&mut inner, ProviderState::Ready);

        match &result {
            Ok(response) => {
                // Extract the selected candidate's own logits slice. If a
                // caller's worker build ever returns the full multi-candidate
                // blob instead of the best slice, fall back to the first
                // slice and warn rather than index out of range.
                let logits = response.logits.clone().or_else(|| {
                    response.all_masks.first().map(|c| {
                        eprintln!("sam2: decoder response missing per-candidate logits slice; falling back to first candidate");
                        c.logits.clone()
                    })
                });
                if let Some(session) = inner.session.as_mut() {
                    session.previous_mask_logits = logits;
                }
            }
            Err(_) => {}
        }

        result
    }

    /// Override the logits fed into the next decode's iterative refinement.
    /// Lets a caller honor a UI candidate override (spec §8, S4): the
    /// default is the highest-IoU candidate from the last decode, but the
    /// user may pick a different one of the `K` previews before the next
    /// prompt, and that pick — not the default — is what should propagate.
    pub async fn set_previous_mask_logits(&self, logits: Vec<f32>) {
        let mut inner = self.inner.lock().await;
        if let Some(session) = inner.session.as_mut() {
            session.previous_mask_logits = Some(logits);
        }
    }

    /// Cancel any in-flight model download and reject all pending worker
    /// requests with `Aborted`. The worker thread itself is left running.
    pub async fn abort(&self) {
        {
            let cancel = self.download_cancel.lock().await;
            cancel.cancel();
        }
        *self.download_cancel.lock().await = CancellationToken::new();
        let _ = self.abort_generation.send(self.abort_generation.borrow().wrapping_add(1));
    }

    /// Abort, tear down the worker, and return to `idle`.
    pub async fn dispose(&self) {
        self.abort().await;
        let mut inner = self.inner.lock().await;
        if let Some(worker) = inner.worker.take() {
            let _ = worker.dispose().await;
        }
        inner.session = None;
        self.set_state(&mut inner, ProviderState::Idle);
    }

    async fn ensure_ready(&self) -> Result<()> {
        let state = self.state().await;
        match state {
            ProviderState::Ready => Ok(()),
            ProviderState::Processing => Ok(()),
            ProviderState::Idle => {
                self.initialize(|_| {}).await
            }
            _ => Err(SamError::InitError(format!(
                "provider is not ready (state: {state:?})"
            ))),
        }
    }

    async fn worker_handle(&self) -> Result<Arc<WorkerHandle>> {
        let inner = self.inner.lock().await;
        inner
            .worker
            .clone()
            .ok_or_else(|| SamError::InitError("worker is not initialized".into()))
    }

    async fn race_abort<T>(&self, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        let mut abort_rx = self.abort_generation.subscribe();
        tokio::select! {
            _ = abort_rx.changed() => Err(SamError::Aborted),
            res = fut => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model_store::ModelStoreConfig;
    use std::path::Path;

    fn test_provider() -> Provider {
        let store = Arc::new(
            ModelStore::open(
                Path::new(":memory:"),
                ModelStoreConfig::with_urls("https://example.invalid/e", "https://example.invalid/d"),
            )
            .unwrap(),
        );
        Provider::new(store, EngineOptions::default())
    }

    #[tokio::test]
    async fn fresh_provider_starts_idle_and_subscriber_sees_it_first() {
        let provider = test_provider();
        assert_eq!(provider.state().await, ProviderState::Idle);
        let rx = provider.subscribe_state();
        assert_eq!(*rx.borrow(), ProviderState::Idle);
    }

    #[tokio::test]
    async fn dispose_on_a_never_initialized_provider_stays_idle() {
        let provider = test_provider();
        provider.dispose().await;
        assert_eq!(provider.state().await, ProviderState::Idle);
    }

    #[tokio::test]
    async fn start_new_session_mints_a_fresh_image_id_each_call() {
        let provider = test_provider();
        let id1 = provider.start_new_session().await;
        let id2 = provider.start_new_session().await;
        assert_ne!(id1, id2);
    }

    #[tokio::test]
    async fn models_are_not_cached_before_any_initialize_call() {
        let provider = test_provider();
        assert!(!provider.are_models_cached());
        assert!(provider.model_download_info().is_none());
    }
}
