use serde::{Deserialize, Serialize};

/// A foreground/background click in the *captured image's* pixel space.
///
/// Invariant: `0 <= x < width` and `0 <= y < height` of the image the point
/// was collected against, but callers are not required to clamp before
/// handing points to the engine (see `Engine::decode`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PromptPoint {
    pub x: f32,
    pub y: f32,
    #[serde(rename = "type")]
    pub kind: PromptPointKind,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PromptPointKind {
    Fg,
    Bg,
}

impl PromptPointKind {
    pub fn label(self) -> f32 {
        match self {
            PromptPointKind::Fg => 1.0,
            PromptPointKind::Bg => 0.0,
        }
    }
}

/// An RGBA frame plus the prompts to segment it with.
#[derive(Debug, Clone)]
pub struct SegmentationRequest {
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub points: Vec<PromptPoint>,
    pub options: SegmentationOptions,
}

#[derive(Debug, Clone, Copy)]
pub struct SegmentationOptions {
    pub mask_threshold: f32,
}

impl Default for SegmentationOptions {
    fn default() -> Self {
        Self {
            mask_threshold: 0.0,
        }
    }
}

/// One of the decoder's `K` output planes, ranked by its predicted IoU.
///
/// `index` is the channel the candidate came from (0 = tight, 1 = medium,
/// 2 = broad for the common K=3 export); it is NOT necessarily the rank.
#[derive(Debug, Clone)]
pub struct MaskCandidate {
    pub index: usize,
    pub iou_score: f32,
    pub mask: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Raw 256x256 decoder logits for this candidate, used for iterative
    /// refinement if selected as the previous mask.
    pub logits: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct SegmentationResponse {
    pub width: u32,
    pub height: u32,
    pub mask: Vec<u8>,
    pub logits: Option<Vec<f32>>,
    pub all_masks: Vec<MaskCandidate>,
    pub selected_mask_index: usize,
    pub timing: SegmentationTiming,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentationTiming {
    pub encode_ms: f64,
    pub decode_ms: f64,
}

impl SegmentationTiming {
    pub fn total_ms(&self) -> f64 {
        self.encode_ms + self.decode_ms
    }
}

/// Provider lifecycle. Transitions are single-source-of-truth for the
/// orchestrator: it never infers state from side effects.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderState {
    Idle,
    LoadingModels,
    Initializing,
    Ready,
    Processing,
    Error,
}

/// The accepted-but-not-applied candidate awaiting user confirmation. At
/// most one exists per session.
#[derive(Debug, Clone)]
pub struct PendingMask {
    pub response: SegmentationResponse,
    pub canvas_width: u32,
    pub canvas_height: u32,
}

/// Capability probe result (C1). UI-only; never gates execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub available: bool,
    pub unavailable_reason: Option<String>,
    pub adapter_info: Option<String>,
    pub estimated_vram_bytes: u64,
    pub is_discrete_gpu: bool,
    pub is_low_vram: bool,
}

pub const LOW_VRAM_THRESHOLD_BYTES: u64 = 4 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionBackend {
    Gpu,
    Cpu,
}

/// Model download/cache progress (C2).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelStage {
    Encoder,
    Decoder,
    Initializing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelLoadProgress {
    pub loaded: u64,
    pub total: u64,
    pub stage: ModelStage,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedModelInfo {
    pub encoder_bytes: u64,
    pub decoder_bytes: u64,
}

pub const ENCODER_INPUT_SIZE: u32 = 1024;
pub const MASK_LOGITS_SIZE: usize = 256;
pub const MASK_LOGITS_LEN: usize = MASK_LOGITS_SIZE * MASK_LOGITS_SIZE;
pub const EXPECTED_ENCODER_BYTES: u64 = 42 * 1024 * 1024;
pub const EXPECTED_DECODER_BYTES: u64 = 15 * 1024 * 1024;
