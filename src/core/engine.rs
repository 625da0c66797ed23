//! Inference Engine (C4): owns the encoder/decoder ONNX sessions, the
//! per-image embeddings cache, and the encode/decode/segment contract.
//!
//! Grounded in the teacher's `ClipEngine` (`clip/engine.rs`): the same
//! "build session with GPU providers, fall back to CPU on failure" retry
//! loop, the same `Mutex<Session>` guarding a session that is not `Sync`
//! on its own. Where the teacher pools several sessions for classification
//! throughput, this engine holds exactly one encoder and one decoder
//! session — SAM2 decode is cheap enough, and the worker already admits
//! only one request at a time, that pooling would add complexity with no
//! payoff (see DESIGN.md).

use std::collections::HashMap;

use ndarray::{Array, IxDyn};
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, CoreMLExecutionProvider,
    DirectMLExecutionProvider, ExecutionProviderDispatch, OpenVINOExecutionProvider,
    ROCmExecutionProvider,
};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use parking_lot::Mutex;

use crate::core::error::{Result, SamError};
use crate::core::tensor::{
    make_has_mask_tensor, make_mask_input_tensor, make_point_coords_tensor,
    make_point_labels_tensor, preprocess_image, process_mask_logits, resize_mask_nearest, scale_point,
};
use crate::core::types::{
    ExecutionBackend, MaskCandidate, PromptPoint, SegmentationResponse, SegmentationTiming,
    ENCODER_INPUT_SIZE, MASK_LOGITS_SIZE,
};

#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub preferred_provider: Option<ExecutionBackend>,
    pub verbose: bool,
}

struct CachedEmbedding {
    image_embed: (Vec<i64>, Vec<f32>),
    high_res_feats_0: Option<(Vec<i64>, Vec<f32>)>,
    high_res_feats_1: Option<(Vec<i64>, Vec<f32>)>,
}

pub struct Engine {
    encoder: Mutex<Session>,
    decoder: Mutex<Session>,
    provider_used: String,
    embeddings: Mutex<HashMap<String, CachedEmbedding>>,
}

impl Engine {
    /// Build encoder and decoder sessions, trying GPU providers before CPU
    /// unless `preferred_provider` forces CPU-only. On any build failure the
    /// partially built session is dropped and the next provider is tried;
    /// if none succeed, `InitError`.
    pub fn initialize(encoder_bytes: &[u8], decoder_bytes: &[u8], opts: &EngineOptions) -> Result<Self> {
        let attempts = provider_attempts(opts.preferred_provider);

        let mut last_err: Option<String> = None;
        for (label, providers) in attempts {
            let encoder_result = build_session(encoder_bytes, &providers);
            let decoder_result = encoder_result
                .as_ref()
                .ok()
                .map(|_| build_session(decoder_bytes, &providers));

            match (encoder_result, decoder_result) {
                (Ok(encoder), Some(Ok(decoder))) => {
                    if opts.verbose {
                        eprintln!("sam2: engine initialized with provider `{label}`");
                    }
                    return Ok(Self {
                        encoder: Mutex::new(encoder),
                        decoder: Mutex::new(decoder),
                        provider_used: label.to_string(),
                        embeddings: Mutex::new(HashMap::new()),
                    });
                }
                (Ok(_), Some(Err(e))) | (Err(e), _) => {
                    if opts.verbose {
                        eprintln!("sam2: provider `{label}` failed, trying next: {e}");
                    }
                    last_err = Some(e);
                }
                (Ok(_), None) => unreachable!(),
            }
        }

        Err(SamError::InitError(
            last_err.unwrap_or_else(|| "no execution provider produced a session".to_string()),
        ))
    }

    pub fn provider_used(&self) -> &str {
        &self.provider_used
    }

    /// Resize, tensorize and run the encoder, caching the outputs under
    /// `image_id`. Idempotent: a second call for the same id is a no-op
    /// that reports `0.0` ms, matching the cache-hit contract.
    pub fn encode(&self, image_id: &str, rgba: &[u8], width: u32, height: u32) -> Result<f64> {
        if self.embeddings.lock().contains_key(image_id) {
            return Ok(0.0);
        }

        let started = std::time::Instant::now();
        let nchw = preprocess_image(rgba, width, height);
        let s = ENCODER_INPUT_SIZE as usize;
        let input = Array::from_shape_vec(IxDyn(&[1, 3, s, s]), nchw)
            .map_err(|e| SamError::SegmentError(format!("building encoder input: {e}")))?;

        let mut encoder = self.encoder.lock();
        let tensor = Tensor::from_array(input)
            .map_err(|e| SamError::SegmentError(format!("building encoder tensor: {e}")))?;
        let outputs = encoder
            .run(ort::inputs![ "image" => tensor ])
            .map_err(|e| SamError::SegmentError(format!("running encoder: {e}")))?;

        let image_embed = extract_f32_tensor(&outputs, "image_embed")?;
        let high_res_feats_0 = extract_f32_tensor(&outputs, "high_res_feats_0").ok();
        let high_res_feats_1 = extract_f32_tensor(&outputs, "high_res_feats_1").ok();

        self.embeddings.lock().insert(
            image_id.to_string(),
            CachedEmbedding {
                image_embed,
                high_res_feats_0,
                high_res_feats_1,
            },
        );

        Ok(started.elapsed().as_secs_f64() * 1000.0)
    }

    /// Run the decoder against a cached embedding and return all `K` mask
    /// candidates plus the selected one, per the ranking rule (highest IoU
    /// wins; ties go to the smallest index; missing `iou_predictions`
    /// defaults to index 0).
    pub fn decode(
        &self,
        image_id: &str,
        points: &[PromptPoint],
        original_width: u32,
        original_height: u32,
        previous_mask_logits: Option<&[f32]>,
    ) -> Result<SegmentationResponse> {
        let started = std::time::Instant::now();

        let embedding = {
            let cache = self.embeddings.lock();
            let cached = cache.get(image_id).ok_or_else(|| SamError::NotEncoded {
                image_id: image_id.to_string(),
            })?;
            (
                cached.image_embed.clone(),
                cached.high_res_feats_0.clone(),
                cached.high_res_feats_1.clone(),
            )
        };
        let (image_embed, high_res_feats_0, high_res_feats_1) = embedding;

        let scaled_points: Vec<(f32, f32)> = points
            .iter()
            .map(|p| scale_point(p.x, p.y, original_width, original_height))
            .collect();
        let labels: Vec<f32> = points.iter().map(|p| p.kind.label()).collect();

        let n = scaled_points.len().max(1);
        let point_coords = make_point_coords_tensor(&scaled_points);
        let point_coords = if scaled_points.is_empty() {
            vec![0.0f32; 2]
        } else {
            point_coords
        };
        let point_labels_vec = make_point_labels_tensor(&labels);
        let point_labels_vec = if labels.is_empty() {
            vec![0.0f32]
        } else {
            point_labels_vec
        };
        let mask_input = make_mask_input_tensor(previous_mask_logits);
        let has_mask = make_has_mask_tensor(previous_mask_logits.is_some());

        let image_embed_tensor = Tensor::from_array(
            Array::from_shape_vec(IxDyn(&image_embed.0.iter().map(|&d| d as usize).collect::<Vec<_>>()), image_embed.1)
                .map_err(|e| SamError::SegmentError(format!("rebuilding image_embed: {e}")))?,
        )
        .map_err(|e| SamError::SegmentError(format!("tensorizing image_embed: {e}")))?;

        let coords_tensor = Tensor::from_array(
            Array::from_shape_vec(IxDyn(&[1, n, 2]), point_coords)
                .map_err(|e| SamError::SegmentError(format!("building point_coords: {e}")))?,
        )
        .map_err(|e| SamError::SegmentError(format!("tensorizing point_coords: {e}")))?;
        let labels_tensor = Tensor::from_array(
            Array::from_shape_vec(IxDyn(&[1, n]), point_labels_vec)
                .map_err(|e| SamError::SegmentError(format!("building point_labels: {e}")))?,
        )
        .map_err(|e| SamError::SegmentError(format!("tensorizing point_labels: {e}")))?;
        let mask_input_tensor = Tensor::from_array(
            Array::from_shape_vec(IxDyn(&[1, 1, MASK_LOGITS_SIZE, MASK_LOGITS_SIZE]), mask_input)
                .map_err(|e| SamError::SegmentError(format!("building mask_input: {e}")))?,
        )
        .map_err(|e| SamError::SegmentError(format!("tensorizing mask_input: {e}")))?;
        let has_mask_tensor = Tensor::from_array(
            Array::from_shape_vec(IxDyn(&[1, 1]), vec![has_mask])
                .map_err(|e| SamError::SegmentError(format!("building has_mask_input: {e}")))?,
        )
        .map_err(|e| SamError::SegmentError(format!("tensorizing has_mask_input: {e}")))?;

        let mut decoder = self.decoder.lock();
        let mut inputs = ort::inputs![
            "image_embed" => image_embed_tensor,
            "point_coords" => coords_tensor,
            "point_labels" => labels_tensor,
            "mask_input" => mask_input_tensor,
            "has_mask_input" => has_mask_tensor,
        ]
        .map_err(|e| SamError::SegmentError(format!("assembling decoder inputs: {e}")))?;

        if let Some((shape, data)) = high_res_feats_0 {
            let t = Tensor::from_array(
                Array::from_shape_vec(IxDyn(&shape.iter().map(|&d| d as usize).collect::<Vec<_>>()), data)
                    .map_err(|e| SamError::SegmentError(format!("building high_res_feats_0: {e}")))?,
            )
            .map_err(|e| SamError::SegmentError(format!("tensorizing high_res_feats_0: {e}")))?;
            inputs.push(("high_res_feats_0".into(), t.into()));
        }
        if let Some((shape, data)) = high_res_feats_1 {
            let t = Tensor::from_array(
                Array::from_shape_vec(IxDyn(&shape.iter().map(|&d| d as usize).collect::<Vec<_>>()), data)
                    .map_err(|e| SamError::SegmentError(format!("building high_res_feats_1: {e}")))?,
            )
            .map_err(|e| SamError::SegmentError(format!("tensorizing high_res_feats_1: {e}")))?;
            inputs.push(("high_res_feats_1".into(), t.into()));
        }

        let outputs = decoder
            .run(inputs)
            .map_err(|e| SamError::SegmentError(format!("running decoder: {e}")))?;

        let (masks_shape, masks_data) = extract_f32_tensor(&outputs, "masks")
            .or_else(|_| extract_f32_tensor(&outputs, "low_res_masks"))?;
        let k = *masks_shape.get(1).unwrap_or(&1) as usize;

        let iou = extract_f32_tensor(&outputs, "iou_predictions")
            .or_else(|_| extract_f32_tensor(&outputs, "iou_pred"))
            .ok();

        let selected_index = match &iou {
            Some((_, values)) => argmax_first_tie(values),
            None => 0,
        };

        let mut all_masks = Vec::with_capacity(k);
        for idx in 0..k {
            let binary_256 = process_mask_logits(&masks_data, k, idx, 0.0);
            let resized = resize_mask_nearest(
                &binary_256,
                MASK_LOGITS_SIZE as u32,
                MASK_LOGITS_SIZE as u32,
                original_width,
                original_height,
            );
            let plane = MASK_LOGITS_SIZE * MASK_LOGITS_SIZE;
            let logits_slice = masks_data[idx * plane..(idx + 1) * plane].to_vec();
            let iou_score = resolve_iou_score(iou.as_ref().map(|(_, v)| v.as_slice()), idx);
            all_masks.push(MaskCandidate {
                index: idx,
                iou_score,
                mask: resized,
                width: original_width,
                height: original_height,
                logits: logits_slice,
            });
        }

        let selected = &all_masks[selected_index];
        let response = SegmentationResponse {
            width: original_width,
            height: original_height,
            mask: selected.mask.clone(),
            logits: Some(selected.logits.clone()),
            all_masks,
            selected_mask_index: selected_index,
            timing: SegmentationTiming {
                encode_ms: 0.0,
                decode_ms: started.elapsed().as_secs_f64() * 1000.0,
            },
        };

        Ok(response)
    }

    pub fn segment(
        &self,
        image_id: &str,
        rgba: &[u8],
        width: u32,
        height: u32,
        points: &[PromptPoint],
        previous_mask_logits: Option<&[f32]>,
    ) -> Result<SegmentationResponse> {
        let encode_ms = self.encode(image_id, rgba, width, height)?;
        let mut response = self.decode(image_id, points, width, height, previous_mask_logits)?;
        response.timing.encode_ms = encode_ms;
        Ok(response)
    }

    pub fn clear_image_cache(&self, image_id: &str) {
        self.embeddings.lock().remove(image_id);
    }

    pub fn clear_all_caches(&self) {
        self.embeddings.lock().clear();
    }

    pub fn dispose(self) {
        self.clear_all_caches();
    }
}

/// A candidate's IoU score: the decoder's own prediction when present,
/// otherwise `1.0` for every candidate (spec §8: "Missing iou_predictions
/// → selectedMaskIndex = 0, all candidate iouScore = 1.0" — not `0.0`).
fn resolve_iou_score(iou_values: Option<&[f32]>, idx: usize) -> f32 {
    iou_values.and_then(|v| v.get(idx).copied()).unwrap_or(1.0)
}

/// First-tie argmax: the smallest index among the maximal values wins.
fn argmax_first_tie(values: &[f32]) -> usize {
    let mut best_idx = 0usize;
    let mut best_val = f32::NEG_INFINITY;
    for (idx, &v) in values.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best_idx = idx;
        }
    }
    best_idx
}

fn extract_f32_tensor(
    outputs: &ort::session::SessionOutputs<'_>,
    name: &str,
) -> Result<(Vec<i64>, Vec<f32>)> {
    let value = outputs
        .get(name)
        .ok_or_else(|| SamError::SegmentError(format!("missing output `{name}`")))?;
    let (shape, data) = value
        .try_extract_tensor::<f32>()
        .map_err(|e| SamError::SegmentError(format!("extracting `{name}`: {e}")))?;
    Ok((shape.to_vec(), data.to_vec()))
}

fn build_session(bytes: &[u8], providers: &[ExecutionProviderDispatch]) -> std::result::Result<Session, String> {
    Session::builder()
        .map_err(|e| e.to_string())?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| e.to_string())?
        .with_execution_providers(providers.to_vec())
        .map_err(|e| e.to_string())?
        .commit_from_memory(bytes)
        .map_err(|e| e.to_string())
}

/// Ordered provider attempts: GPU-first (trying each GPU EP as its own
/// attempt so a single bad driver does not take the others down with it),
/// then a final CPU-only attempt. `Some(ExecutionBackend::Cpu)` skips
/// straight to CPU-only, matching the teacher's `allow_ep_fallback` style.
fn provider_attempts(
    preferred: Option<ExecutionBackend>,
) -> Vec<(&'static str, Vec<ExecutionProviderDispatch>)> {
    if matches!(preferred, Some(ExecutionBackend::Cpu)) {
        return vec![("cpu", vec![CPUExecutionProvider::default().build()])];
    }

    vec![
        ("coreml+cpu", vec![
            CoreMLExecutionProvider::default().build(),
            CPUExecutionProvider::default().build(),
        ]),
        ("cuda+cpu", vec![
            CUDAExecutionProvider::default().build(),
            CPUExecutionProvider::default().build(),
        ]),
        ("rocm+cpu", vec![
            ROCmExecutionProvider::default().build(),
            CPUExecutionProvider::default().build(),
        ]),
        ("directml+cpu", vec![
            DirectMLExecutionProvider::default().build(),
            CPUExecutionProvider::default().build(),
        ]),
        ("openvino+cpu", vec![
            OpenVINOExecutionProvider::default().build(),
            CPUExecutionProvider::default().build(),
        ]),
        ("cpu", vec![CPUExecutionProvider::default().build()]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_iou_predictions_default_every_candidate_to_one() {
        assert_eq!(resolve_iou_score(None, 0), 1.0);
        assert_eq!(resolve_iou_score(None, 2), 1.0);
    }

    #[test]
    fn present_iou_predictions_are_used_verbatim() {
        let values = [0.7, 0.9, 0.8];
        assert_eq!(resolve_iou_score(Some(&values), 1), 0.9);
    }

    #[test]
    fn argmax_breaks_ties_at_the_smallest_index() {
        assert_eq!(argmax_first_tie(&[0.2, 0.9, 0.9, 0.1]), 1);
        assert_eq!(argmax_first_tie(&[0.5]), 0);
    }

    #[test]
    fn cpu_only_preference_skips_gpu_attempts() {
        let attempts = provider_attempts(Some(ExecutionBackend::Cpu));
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].0, "cpu");
    }

    #[test]
    fn default_preference_tries_every_gpu_before_cpu() {
        let attempts = provider_attempts(None);
        assert_eq!(attempts.last().unwrap().0, "cpu");
        assert!(attempts.len() > 1);
    }
}
