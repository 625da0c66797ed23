//! Tauri command surface (ambient, per SPEC_FULL.md). Thin wrappers that
//! perform the Orchestrator-facing operations spec §4.4 lists as inbound
//! events and invocable requests, grounded in the teacher's
//! `commands.rs` shape: `State<'_, AppState>`, `Result<T, String>` at the
//! IPC boundary, an `AppState::new(&handle)` constructed in `lib.rs`'s
//! `.setup()` closure.

use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tauri::{AppHandle, Emitter, State};

use crate::core::config::{load_settings, model_cache_db_path, save_settings, Settings};
use crate::core::engine::EngineOptions;
use crate::core::error::{Result, SamError};
use crate::core::events::{EventSink, SamEvent};
use crate::core::model_store::{ModelStore, ModelStoreConfig};
use crate::core::orchestrator::{Orchestrator, SelectionSink, ViewportSource};
use crate::core::provider::Provider;
use crate::core::tensor::SelectionCanvas;
use crate::core::types::{CachedModelInfo, Capabilities, PromptPoint, ProviderState};

/// Feeds the Orchestrator's `render.offscreen` collaborator from frames the
/// frontend pushes over `sam_submit_frame`. Tauri's IPC is frontend-
/// initiated only (no backend-to-frontend function call), so the pull the
/// spec describes ("invoke `render.offscreen(W,H)`, receive bytes") is
/// realized here as "read the most recently pushed frame" — the frontend
/// is expected to submit a frame sized to the viewport before triggering
/// `sam_capture_preview`/`sam_segment`.
pub struct FrameViewportSource {
    frame: SyncMutex<Option<(Vec<u8>, u32, u32)>>,
}

impl FrameViewportSource {
    pub fn new() -> Self {
        Self {
            frame: SyncMutex::new(None),
        }
    }

    pub fn submit(&self, rgba: Vec<u8>, width: u32, height: u32) {
        *self.frame.lock() = Some((rgba, width, height));
    }
}

impl Default for FrameViewportSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ViewportSource for FrameViewportSource {
    async fn render_offscreen(&self, _width: u32, _height: u32) -> Result<Vec<u8>> {
        self.frame
            .lock()
            .as_ref()
            .map(|(rgba, _, _)| rgba.clone())
            .ok_or_else(|| {
                SamError::InvalidArguments("no frame submitted before capture".into())
            })
    }

    async fn viewport_dims(&self) -> (u32, u32) {
        self.frame
            .lock()
            .as_ref()
            .map(|(_, w, h)| (*w, *h))
            .unwrap_or((0, 0))
    }
}

/// Forwards `select.byMask` to the frontend as a `sam2://event` payload.
pub struct TauriSelectionSink {
    app: AppHandle,
}

impl TauriSelectionSink {
    pub fn new(app: AppHandle) -> Self {
        Self { app }
    }
}

#[async_trait::async_trait]
impl SelectionSink for TauriSelectionSink {
    async fn select_by_mask(&self, canvas: SelectionCanvas) {
        let op = match canvas.op {
            crate::core::tensor::SelectionOp::Add => "add",
            crate::core::tensor::SelectionOp::Remove => "remove",
            crate::core::tensor::SelectionOp::Set => "set",
        };
        let payload = serde_json::json!({
            "op": op,
            "width": canvas.width,
            "height": canvas.height,
            "rgba": canvas.rgba,
        });
        if let Err(e) = self.app.emit("sam2.select.byMask", payload) {
            eprintln!("sam2: failed to emit select.byMask: {e}");
        }
    }
}

/// Fires every `SamEvent` under one Tauri channel, `sam2://event`; the
/// frontend dispatches on the event's own `type` tag rather than on N
/// distinct Tauri channel names, which keeps the typed-message-set design
/// (spec Design Notes) from degenerating back into string matching one
/// layer up the stack.
pub struct TauriEventSink {
    app: AppHandle,
}

impl TauriEventSink {
    pub fn new(app: AppHandle) -> Self {
        Self { app }
    }
}

impl EventSink for TauriEventSink {
    fn fire(&self, event: SamEvent) {
        if let Err(e) = self.app.emit("sam2://event", &event) {
            eprintln!("sam2: failed to emit {event:?}: {e}");
        }
    }
}

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub events: Arc<dyn EventSink>,
    pub viewport: Arc<FrameViewportSource>,
    pub settings: SyncMutex<Settings>,
}

impl AppState {
    pub fn new(app: &AppHandle) -> anyhow::Result<Self> {
        let settings = load_settings(app);
        let db_path = model_cache_db_path(app, &settings)?;
        let model_store = Arc::new(ModelStore::open(
            &db_path,
            ModelStoreConfig::with_urls(settings.encoder_url.clone(), settings.decoder_url.clone()),
        )?);

        let engine_options = EngineOptions {
            preferred_provider: settings.preferred_provider,
            verbose: settings.verbose_engine_logging,
        };
        let provider = Arc::new(Provider::with_low_vram_threshold(
            model_store,
            engine_options,
            settings.low_vram_threshold_bytes,
        ));

        let events: Arc<dyn EventSink> = Arc::new(TauriEventSink::new(app.clone()));
        let viewport = Arc::new(FrameViewportSource::new());
        let selection: Arc<dyn SelectionSink> = Arc::new(TauriSelectionSink::new(app.clone()));

        let orchestrator = Arc::new(Orchestrator::new(
            provider.clone(),
            viewport.clone(),
            selection,
            events.clone(),
        ));

        spawn_status_relay(provider, events.clone());
        orchestrator.emit_capabilities();

        Ok(Self {
            orchestrator,
            events,
            viewport,
            settings: SyncMutex::new(settings),
        })
    }
}

/// Forwards every `Provider` lifecycle transition as `sam.providerStatusChanged`
/// without the command layer having to poll or thread a callback through
/// every call site. Grounded in the same "subscribe once, forward forever"
/// shape as the teacher's streaming Ollama responses in `ollama.rs`.
fn spawn_status_relay(provider: Arc<Provider>, events: Arc<dyn EventSink>) {
    let mut rx = provider.subscribe_state();
    tokio::spawn(async move {
        loop {
            let state = *rx.borrow();
            events.fire(SamEvent::ProviderStatusChanged { state });
            if state == ProviderState::Ready {
                events.fire(SamEvent::ProviderReady);
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    });
}

#[tauri::command]
pub async fn sam_submit_frame(
    state: State<'_, AppState>,
    rgba: Vec<u8>,
    width: u32,
    height: u32,
) -> std::result::Result<(), String> {
    state.viewport.submit(rgba, width, height);
    Ok(())
}

#[tauri::command]
pub async fn sam_capture_preview(
    state: State<'_, AppState>,
    width: u32,
    height: u32,
) -> std::result::Result<(), String> {
    state
        .orchestrator
        .capture_preview(width, height)
        .await
        .map_err(|e| e.to_string())
}

#[tauri::command]
pub async fn sam_segment(
    state: State<'_, AppState>,
    points: Vec<PromptPoint>,
) -> std::result::Result<(), String> {
    state
        .orchestrator
        .segment(points)
        .await
        .map_err(|e| e.to_string())
}

#[tauri::command]
pub async fn sam_select_mask_candidate(
    state: State<'_, AppState>,
    index: usize,
) -> std::result::Result<(), String> {
    state
        .orchestrator
        .select_mask_candidate(index)
        .await
        .map_err(|e| e.to_string())
}

#[tauri::command]
pub async fn sam_apply_mask(state: State<'_, AppState>) -> std::result::Result<(), String> {
    state.orchestrator.apply_mask().await;
    Ok(())
}

#[tauri::command]
pub async fn sam_cancel_mask(state: State<'_, AppState>) -> std::result::Result<(), String> {
    state.orchestrator.cancel_mask().await;
    Ok(())
}

#[tauri::command]
pub async fn sam_initialize_provider(state: State<'_, AppState>) -> std::result::Result<(), String> {
    state.orchestrator.emit_capabilities();
    let events = state.events.clone();
    let result = state
        .orchestrator
        .provider()
        .initialize(|progress| events.fire(SamEvent::ModelLoadProgress(progress)))
        .await;
    if let Err(e) = &result {
        state.events.fire(SamEvent::InitError { message: e.to_string() });
    }
    result.map_err(|e| e.to_string())
}

#[tauri::command]
pub async fn sam_dispose_provider(state: State<'_, AppState>) -> std::result::Result<(), String> {
    state.orchestrator.provider().dispose().await;
    Ok(())
}

#[tauri::command]
pub async fn sam_get_provider_status(
    state: State<'_, AppState>,
) -> std::result::Result<ProviderState, String> {
    Ok(state.orchestrator.provider().state().await)
}

#[tauri::command]
pub async fn sam_are_models_cached(state: State<'_, AppState>) -> std::result::Result<bool, String> {
    Ok(state.orchestrator.provider().are_models_cached())
}

#[tauri::command]
pub async fn sam_get_model_download_info(
    state: State<'_, AppState>,
) -> std::result::Result<Option<CachedModelInfo>, String> {
    Ok(state.orchestrator.provider().model_download_info())
}

#[tauri::command]
pub async fn sam_get_capabilities(
    state: State<'_, AppState>,
) -> std::result::Result<Capabilities, String> {
    Ok(state.orchestrator.provider().is_available().clone())
}

#[tauri::command]
pub async fn sam_get_settings(state: State<'_, AppState>) -> std::result::Result<Settings, String> {
    Ok(state.settings.lock().clone())
}

#[tauri::command]
pub async fn sam_set_settings(
    app: AppHandle,
    state: State<'_, AppState>,
    settings: Settings,
) -> std::result::Result<(), String> {
    {
        let mut guard = state.settings.lock();
        *guard = settings.clone();
    }
    save_settings(&app, &settings).map_err(|e| e.to_string())
}
