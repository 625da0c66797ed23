//! Event bus contract (spec §6): `fire`/`on`/`invoke`/`function` with
//! dot-qualified names, modeled here as a typed `SamEvent` enum plus an
//! `EventSink` trait so dispatch stops being a string comparison at every
//! call site. The Tauri-backed sink implements this over `AppHandle::emit`
//! in production; an in-memory sink backs tests.

use serde::Serialize;

use crate::core::types::{Capabilities, MaskCandidate, ModelLoadProgress, ProviderState};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum SamEvent {
    #[serde(rename = "sam.capabilities")]
    Capabilities { capabilities: Capabilities },
    #[serde(rename = "sam.lowVramWarning")]
    LowVramWarning { estimated_vram_bytes: u64 },
    #[serde(rename = "sam.modelLoadProgress")]
    ModelLoadProgress(ModelLoadProgress),
    #[serde(rename = "sam.providerStatusChanged")]
    ProviderStatusChanged { state: ProviderState },
    #[serde(rename = "sam.providerReady")]
    ProviderReady,
    #[serde(rename = "sam.initError")]
    InitError { message: String },
    #[serde(rename = "sam.imageCaptured")]
    ImageCaptured { width: u32, height: u32 },
    #[serde(rename = "sam.encodingStart")]
    EncodingStart,
    #[serde(rename = "sam.encodingComplete")]
    EncodingComplete { encode_ms: f64 },
    #[serde(rename = "sam.encodingError")]
    EncodingError { message: String },
    #[serde(rename = "sam.segmentStart")]
    SegmentStart,
    #[serde(rename = "sam.segmentComplete")]
    SegmentComplete {
        has_pending_mask: bool,
        total_ms: f64,
        encode_ms: f64,
        decode_ms: f64,
    },
    #[serde(rename = "sam.segmentError")]
    SegmentError { message: String },
    #[serde(rename = "sam.maskReady")]
    MaskReady {
        mask: Vec<u8>,
        width: u32,
        height: u32,
        all_masks: Vec<MaskCandidateSummary>,
        selected_mask_index: usize,
    },
    #[serde(rename = "sam.maskApplied")]
    MaskApplied,
    #[serde(rename = "sam.maskCancelled")]
    MaskCancelled,
}

/// `MaskCandidate` without its raw 256x256 logits — those stay internal to
/// the engine/provider for iterative refinement and never need to cross the
/// IPC boundary. The mask bytes themselves DO cross: the UI renders every
/// candidate as a selectable preview (spec §1), not just the default pick.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaskCandidateSummary {
    pub index: usize,
    pub iou_score: f32,
    pub mask: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl From<&MaskCandidate> for MaskCandidateSummary {
    fn from(c: &MaskCandidate) -> Self {
        Self {
            index: c.index,
            iou_score: c.iou_score,
            mask: c.mask.clone(),
            width: c.width,
            height: c.height,
        }
    }
}

pub trait EventSink: Send + Sync {
    fn fire(&self, event: SamEvent);
}

/// Test/offline sink: collects every fired event in order for assertions.
pub struct RecordingSink {
    events: parking_lot::Mutex<Vec<SamEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            events: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn take(&self) -> Vec<SamEvent> {
        std::mem::take(&mut self.events.lock())
    }
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for RecordingSink {
    fn fire(&self, event: SamEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_preserves_fire_order() {
        let sink = RecordingSink::new();
        sink.fire(SamEvent::SegmentStart);
        sink.fire(SamEvent::MaskApplied);
        let events = sink.take();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], SamEvent::SegmentStart));
        assert!(matches!(events[1], SamEvent::MaskApplied));
        assert!(sink.take().is_empty());
    }
}
