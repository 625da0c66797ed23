//! Orchestrator (C7): the thin policy layer between the UI-facing command
//! surface and the `Provider`. Grounded in `core::pipeline`'s `run_job`:
//! the same "serialize events around one outstanding unit of work, guard
//! its clearing on every exit path" shape, generalized here from "one
//! analysis job" to "one pending mask".

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::core::error::Result;
use crate::core::events::{EventSink, MaskCandidateSummary, SamEvent};
use crate::core::provider::Provider;
use crate::core::tensor::{apply_mask_to_selection, ApplyMaskOptions, SelectionCanvas, SelectionOp};
use crate::core::types::{PendingMask, PromptPoint, SegmentationOptions, SegmentationRequest};

/// External collaborator that can rasterize the current viewport.
#[async_trait::async_trait]
pub trait ViewportSource: Send + Sync {
    async fn render_offscreen(&self, width: u32, height: u32) -> Result<Vec<u8>>;
    async fn viewport_dims(&self) -> (u32, u32);
}

/// External collaborator that consumes a finished selection mask.
#[async_trait::async_trait]
pub trait SelectionSink: Send + Sync {
    async fn select_by_mask(&self, canvas: SelectionCanvas);
}

pub struct Orchestrator {
    provider: Arc<Provider>,
    viewport: Arc<dyn ViewportSource>,
    selection: Arc<dyn SelectionSink>,
    events: Arc<dyn EventSink>,
    pending_mask: Mutex<Option<PendingMask>>,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<Provider>,
        viewport: Arc<dyn ViewportSource>,
        selection: Arc<dyn SelectionSink>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            provider,
            viewport,
            selection,
            events,
            pending_mask: Mutex::new(None),
        }
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    /// Probe GPU capabilities (cached after the first call, per spec §4.3)
    /// and emit `sam.capabilities`, plus `sam.lowVramWarning` when the
    /// estimate sits under the low-VRAM threshold. UI-only: never gates
    /// whether segmentation may proceed. Called once at startup and again
    /// on every `initialize()` so a frontend that subscribes late still
    /// gets a capabilities snapshot.
    pub fn emit_capabilities(&self) {
        let capabilities = self.provider.is_available().clone();
        if capabilities.is_low_vram {
            self.events.fire(SamEvent::LowVramWarning {
                estimated_vram_bytes: capabilities.estimated_vram_bytes,
            });
        }
        self.events.fire(SamEvent::Capabilities { capabilities });
    }

    /// Capture the current frame, start a fresh session, and kick off a
    /// background pre-encode so the next `segment` decodes instantly.
    ///
    /// The pre-encode itself is fire-and-forget (spec §4.4: "Fire-and-forget
    /// `preEncodeImage`; emit progress events around it") — `capturePreview`
    /// returns as soon as the frame is captured and the session is reset, it
    /// does not wait for the encode to finish, so the UI stays responsive
    /// while the embedding warms up in the background.
    pub async fn capture_preview(&self, width: u32, height: u32) -> Result<()> {
        let rgba = self.viewport.render_offscreen(width, height).await?;
        self.provider.start_new_session().await;
        self.events.fire(SamEvent::ImageCaptured { width, height });

        self.events.fire(SamEvent::EncodingStart);
        let provider = self.provider.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            match provider.pre_encode_image(rgba, width, height).await {
                Ok(encode_ms) => events.fire(SamEvent::EncodingComplete { encode_ms }),
                Err(e) => events.fire(SamEvent::EncodingError { message: e.to_string() }),
            }
        });

        Ok(())
    }

    /// Run a full segment cycle for a non-empty set of prompt points.
    ///
    /// Empty `points` is a silent no-op per spec §8's boundary behaviors:
    /// it emits neither `segmentStart` nor `segmentError`, distinguishing
    /// "nothing to segment yet" from an actual failure.
    pub async fn segment(&self, points: Vec<PromptPoint>) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }

        self.events.fire(SamEvent::SegmentStart);

        let (width, height) = self.viewport.viewport_dims().await;
        let rgba = match self.viewport.render_offscreen(width, height).await {
            Ok(rgba) => rgba,
            Err(e) => {
                self.events.fire(SamEvent::SegmentError { message: e.to_string() });
                return Err(e);
            }
        };

        let request = SegmentationRequest {
            rgba,
            width,
            height,
            points,
            options: SegmentationOptions::default(),
        };

        let started = std::time::Instant::now();
        let response = match self.provider.segment_single_view(request).await {
            Ok(response) => response,
            Err(e) => {
                self.events.fire(SamEvent::SegmentError { message: e.to_string() });
                return Err(e);
            }
        };
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let all_masks_summary: Vec<MaskCandidateSummary> =
            response.all_masks.iter().map(MaskCandidateSummary::from).collect();

        self.events.fire(SamEvent::MaskReady {
            mask: response.mask.clone(),
            width: response.width,
            height: response.height,
            all_masks: all_masks_summary,
            selected_mask_index: response.selected_mask_index,
        });

        *self.pending_mask.lock().await = Some(PendingMask {
            response,
            canvas_width: width,
            canvas_height: height,
        });

        // The UI-facing split is a display heuristic, not a measurement of
        // the actual encode/decode boundary: by the time `segment` runs,
        // `capturePreview`'s pre-encode has usually already cached the
        // embedding, so the engine's own encode_ms is near zero and not
        // informative for a progress bar. Approximate 70/30 split of this
        // call's wall time instead, per spec.
        self.events.fire(SamEvent::SegmentComplete {
            has_pending_mask: true,
            total_ms: elapsed_ms,
            encode_ms: elapsed_ms * 0.7,
            decode_ms: elapsed_ms * 0.3,
        });

        Ok(())
    }

    /// Override which of the last decode's candidates is "the" mask: the UI
    /// picked a different one of the `K` previews than the default (highest
    /// IoU) pick. Updates the pending mask's `mask`/`selectedMaskIndex` so a
    /// subsequent `applyMask` uses the override, and feeds that candidate's
    /// logits into the provider's iterative-refinement state so the next
    /// `segment` call builds on the user's choice rather than the discarded
    /// default (spec §8, S4).
    pub async fn select_mask_candidate(&self, index: usize) -> Result<()> {
        let mut guard = self.pending_mask.lock().await;
        let Some(pending) = guard.as_mut() else {
            return Err(crate::core::error::SamError::InvalidArguments(
                "no pending mask to select a candidate on".into(),
            ));
        };
        let candidate = pending
            .response
            .all_masks
            .get(index)
            .ok_or_else(|| {
                crate::core::error::SamError::InvalidArguments(format!(
                    "candidate index {index} out of range"
                ))
            })?
            .clone();

        pending.response.mask = candidate.mask.clone();
        pending.response.logits = Some(candidate.logits.clone());
        pending.response.selected_mask_index = index;

        self.provider.set_previous_mask_logits(candidate.logits).await;
        Ok(())
    }

    /// Commit the pending mask into the downstream selection, clearing it
    /// afterwards. No-op if nothing is pending.
    pub async fn apply_mask(&self) {
        let pending = self.pending_mask.lock().await.take();
        let Some(pending) = pending else { return };

        let canvas = apply_mask_to_selection(
            &pending.response,
            ApplyMaskOptions {
                op: SelectionOp::Add,
                threshold: 0.5,
                target_width: pending.canvas_width,
                target_height: pending.canvas_height,
            },
        );
        self.selection.select_by_mask(canvas).await;
        self.events.fire(SamEvent::MaskApplied);
    }

    /// Discard the pending mask without applying it.
    pub async fn cancel_mask(&self) {
        *self.pending_mask.lock().await = None;
        self.events.fire(SamEvent::MaskCancelled);
    }

    pub async fn has_pending_mask(&self) -> bool {
        self.pending_mask.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::EngineOptions;
    use crate::core::events::RecordingSink;
    use crate::core::model_store::ModelStoreConfig;
    use std::path::Path;

    struct FixedViewport {
        width: u32,
        height: u32,
    }

    #[async_trait::async_trait]
    impl ViewportSource for FixedViewport {
        async fn render_offscreen(&self, width: u32, height: u32) -> Result<Vec<u8>> {
            Ok(vec![0u8; (width * height * 4) as usize])
        }
        async fn viewport_dims(&self) -> (u32, u32) {
            (self.width, self.height)
        }
    }

    struct NullSelection;

    #[async_trait::async_trait]
    impl SelectionSink for NullSelection {
        async fn select_by_mask(&self, _canvas: SelectionCanvas) {}
    }

    fn test_orchestrator() -> Orchestrator {
        let store = Arc::new(
            crate::core::model_store::ModelStore::open(
                Path::new(":memory:"),
                ModelStoreConfig::with_urls("https://example.invalid/e", "https://example.invalid/d"),
            )
            .unwrap(),
        );
        let provider = Arc::new(Provider::new(store, EngineOptions::default()));
        Orchestrator::new(
            provider,
            Arc::new(FixedViewport { width: 64, height: 64 }),
            Arc::new(NullSelection),
            Arc::new(RecordingSink::new()),
        )
    }

    #[tokio::test]
    async fn cancel_mask_without_pending_still_fires_cancelled() {
        let orch = test_orchestrator();
        orch.cancel_mask().await;
        assert!(!orch.has_pending_mask().await);
    }

    #[tokio::test]
    async fn apply_mask_without_pending_is_a_no_op() {
        let orch = test_orchestrator();
        orch.apply_mask().await;
        assert!(!orch.has_pending_mask().await);
    }

    #[tokio::test]
    async fn segment_with_no_points_emits_nothing_and_leaves_no_pending_mask() {
        let orch = test_orchestrator();
        orch.segment(Vec::new()).await.unwrap();
        assert!(!orch.has_pending_mask().await);
    }

    fn test_orchestrator_with_sink() -> (Orchestrator, Arc<RecordingSink>) {
        let store = Arc::new(
            crate::core::model_store::ModelStore::open(
                Path::new(":memory:"),
                ModelStoreConfig::with_urls("https://example.invalid/e", "https://example.invalid/d"),
            )
            .unwrap(),
        );
        let provider = Arc::new(Provider::new(store, EngineOptions::default()));
        let sink = Arc::new(RecordingSink::new());
        let orch = Orchestrator::new(
            provider,
            Arc::new(FixedViewport { width: 64, height: 64 }),
            Arc::new(NullSelection),
            sink.clone(),
        );
        (orch, sink)
    }

    #[test]
    fn emit_capabilities_fires_the_capabilities_event() {
        let (orch, sink) = test_orchestrator_with_sink();
        orch.emit_capabilities();
        let events = sink.take();
        assert!(events
            .iter()
            .any(|e| matches!(e, SamEvent::Capabilities { .. })));
    }

    #[tokio::test]
    async fn select_mask_candidate_without_pending_mask_errors() {
        let orch = test_orchestrator();
        let err = orch.select_mask_candidate(0).await.unwrap_err();
        assert_eq!(err.kind(), "InvalidArguments");
    }

    #[tokio::test]
    async fn select_mask_candidate_overrides_the_default_pick() {
        use crate::core::types::{MaskCandidate, SegmentationResponse, SegmentationTiming};

        let orch = test_orchestrator();
        orch.provider.start_new_session().await;

        let make_candidate = |index: usize, iou: f32, fill: u8| MaskCandidate {
            index,
            iou_score: iou,
            mask: vec![fill; 4],
            width: 2,
            height: 2,
            logits: vec![fill as f32; 256 * 256],
        };
        let candidates = vec![
            make_candidate(0, 0.7, 10),
            make_candidate(1, 0.9, 20),
            make_candidate(2, 0.8, 30),
        ];
        let response = SegmentationResponse {
            width: 2,
            height: 2,
            mask: candidates[1].mask.clone(),
            logits: Some(candidates[1].logits.clone()),
            all_masks: candidates,
            selected_mask_index: 1,
            timing: SegmentationTiming::default(),
        };
        *orch.pending_mask.lock().await = Some(PendingMask {
            response,
            canvas_width: 2,
            canvas_height: 2,
        });

        orch.select_mask_candidate(2).await.unwrap();

        let pending = orch.pending_mask.lock().await;
        let pending = pending.as_ref().unwrap();
        assert_eq!(pending.response.selected_mask_index, 2);
        assert_eq!(pending.response.mask, vec![30u8; 4]);
        assert_eq!(pending.response.logits.as_ref().unwrap()[0], 30.0);
    }
}
