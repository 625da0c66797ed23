//! Pure image/tensor helpers (C3). No engine state, no I/O — everything
//! here is a plain function over byte slices so it is trivially testable.

use crate::core::types::{SegmentationResponse, ENCODER_INPUT_SIZE, MASK_LOGITS_SIZE};
use image::{imageops::FilterType, GrayImage, Luma, RgbImage};

/// Resize an RGBA frame to `S x S` and pack it channel-first, scaled by
/// `1/255`. No further normalization: that is baked into the exported
/// encoder per the model contract.
pub fn preprocess_image(rgba: &[u8], width: u32, height: u32) -> Vec<f32> {
    let s = ENCODER_INPUT_SIZE;
    let rgb = rgba_to_rgb(rgba, width, height);
    let resized = if width == s && height == s {
        rgb
    } else {
        image::imageops::resize(&rgb, s, s, FilterType::Triangle)
    };

    let mut nchw = vec![0.0f32; (3 * s * s) as usize];
    let plane = (s * s) as usize;
    for y in 0..s {
        for x in 0..s {
            let p = resized.get_pixel(x, y).0;
            let idx = (y * s + x) as usize;
            nchw[idx] = p[0] as f32 / 255.0;
            nchw[plane + idx] = p[1] as f32 / 255.0;
            nchw[2 * plane + idx] = p[2] as f32 / 255.0;
        }
    }
    nchw
}

fn rgba_to_rgb(rgba: &[u8], width: u32, height: u32) -> RgbImage {
    let mut rgb = RgbImage::new(width, height);
    for (i, px) in rgb.pixels_mut().enumerate() {
        let base = i * 4;
        px.0 = [rgba[base], rgba[base + 1], rgba[base + 2]];
    }
    rgb
}

/// Rescale a prompt point from the captured image's pixel space into the
/// encoder's `S x S` space. Points outside `[0,W) x [0,H)` are rescaled
/// without clamping, matching the engine's forwarding behavior.
pub fn scale_point(x: f32, y: f32, width: u32, height: u32) -> (f32, f32) {
    let s = ENCODER_INPUT_SIZE as f32;
    (x * s / width.max(1) as f32, y * s / height.max(1) as f32)
}

/// `[1, N, 2]` point coordinates, already rescaled to encoder space.
pub fn make_point_coords_tensor(scaled_points: &[(f32, f32)]) -> Vec<f32> {
    let mut out = Vec::with_capacity(scaled_points.len() * 2);
    for &(x, y) in scaled_points {
        out.push(x);
        out.push(y);
    }
    out
}

/// `[1, N]` point labels: `1.0` foreground, `0.0` background.
pub fn make_point_labels_tensor(labels: &[f32]) -> Vec<f32> {
    labels.to_vec()
}

/// `[1, 1, 256, 256]` previous-mask logits, or all zeros if none.
pub fn make_mask_input_tensor(previous_logits: Option<&[f32]>) -> Vec<f32> {
    match previous_logits {
        Some(logits) if logits.len() == MASK_LOGITS_SIZE * MASK_LOGITS_SIZE => logits.to_vec(),
        _ => vec![0.0f32; MASK_LOGITS_SIZE * MASK_LOGITS_SIZE],
    }
}

/// `[1, 1]` has-mask-input flag.
pub fn make_has_mask_tensor(has_previous: bool) -> f32 {
    if has_previous {
        1.0
    } else {
        0.0
    }
}

/// Slice the `index`-th `256x256` plane out of the decoder's `[1,K,256,256]`
/// logits and threshold it to a binary mask (`255` where `logit > threshold`).
pub fn process_mask_logits(all_logits: &[f32], k: usize, index: usize, threshold: f32) -> Vec<u8> {
    let plane = MASK_LOGITS_SIZE * MASK_LOGITS_SIZE;
    let start = index.min(k.saturating_sub(1)) * plane;
    let end = start + plane;
    all_logits[start..end]
        .iter()
        .map(|&v| if v > threshold { 255 } else { 0 })
        .collect()
}

/// Hard-edged resize for selection: bilinear upscale, then re-threshold at
/// 127. Distinct from `resize_mask_smooth` on purpose — do not conflate the
/// two (see module docs).
pub fn resize_mask_binary(mask: &[u8], mw: u32, mh: u32, tw: u32, th: u32) -> Vec<u8> {
    if mw == tw && mh == th {
        return mask.to_vec();
    }
    let gray = GrayImage::from_raw(mw, mh, mask.to_vec()).expect("mask length must equal mw*mh");
    let resized = image::imageops::resize(&gray, tw, th, FilterType::Triangle);
    resized
        .pixels()
        .map(|Luma([v])| if *v > 127 { 255u8 } else { 0u8 })
        .collect()
}

/// Soft resize for visualization: bilinear upscale, values left in `[0,1]`.
/// Distinct from `resize_mask_binary` on purpose (see module docs).
pub fn resize_mask_smooth(mask: &[u8], mw: u32, mh: u32, tw: u32, th: u32) -> Vec<f32> {
    let gray = GrayImage::from_raw(mw, mh, mask.to_vec()).expect("mask length must equal mw*mh");
    let resized = if mw == tw && mh == th {
        gray
    } else {
        image::imageops::resize(&gray, tw, th, FilterType::Triangle)
    };
    resized.pixels().map(|Luma([v])| *v as f32 / 255.0).collect()
}

/// Nearest-neighbor raster resize, used internally by the engine to bring a
/// `256x256` thresholded mask up to the original image resolution. Kept
/// separate from the two helpers above because the engine's own contract
/// (spec step 6 of `decode`) calls for a raster scale, not a smoothed one.
pub fn resize_mask_nearest(mask: &[u8], mw: u32, mh: u32, tw: u32, th: u32) -> Vec<u8> {
    if mw == tw && mh == th {
        return mask.to_vec();
    }
    let gray = GrayImage::from_raw(mw, mh, mask.to_vec()).expect("mask length must equal mw*mh");
    let resized = image::imageops::resize(&gray, tw, th, FilterType::Nearest);
    resized.into_raw()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionOp {
    Add,
    Remove,
    Set,
}

#[derive(Debug, Clone, Copy)]
pub struct ApplyMaskOptions {
    pub op: SelectionOp,
    pub threshold: f32,
    pub target_width: u32,
    pub target_height: u32,
}

/// An RGBA buffer where selected pixels carry alpha 255 and everything else
/// alpha 0, scaled (with the hard-edged path, never the smooth one) to the
/// requested target size.
pub struct SelectionCanvas {
    pub op: SelectionOp,
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

/// Build the selection canvas the Orchestrator hands to `select.byMask`.
///
/// When the response carries decoder logits, thresholding happens on the
/// sigmoid of those logits (`sigmoid(logit) > threshold`, equivalent to
/// `logit > logit(threshold)`); when only the already-binary mask survived
/// (no logits), the threshold is ignored and the mask's own 0/255 values are
/// used directly. Both code paths are intentional (spec Open Question).
pub fn apply_mask_to_selection(
    response: &SegmentationResponse,
    opts: ApplyMaskOptions,
) -> SelectionCanvas {
    let base_mask: Vec<u8> = match &response.logits {
        Some(logits) if logits.len() == MASK_LOGITS_SIZE * MASK_LOGITS_SIZE => {
            let logit_threshold = logit_of(opts.threshold);
            let at_256: Vec<u8> = logits
                .iter()
                .map(|&v| if v > logit_threshold { 255 } else { 0 })
                .collect();
            resize_mask_nearest(
                &at_256,
                MASK_LOGITS_SIZE as u32,
                MASK_LOGITS_SIZE as u32,
                response.width,
                response.height,
            )
        }
        _ => response.mask.clone(),
    };

    let resized = resize_mask_binary(
        &base_mask,
        response.width,
        response.height,
        opts.target_width,
        opts.target_height,
    );

    let mut rgba = vec![0u8; (opts.target_width * opts.target_height * 4) as usize];
    for (i, &v) in resized.iter().enumerate() {
        let alpha = if v > 127 { 255 } else { 0 };
        rgba[i * 4] = 255;
        rgba[i * 4 + 1] = 255;
        rgba[i * 4 + 2] = 255;
        rgba[i * 4 + 3] = alpha;
    }

    SelectionCanvas {
        op: opts.op,
        width: opts.target_width,
        height: opts.target_height,
        rgba,
    }
}

/// Inverse sigmoid, used to translate a `threshold` expressed in
/// probability space (as `applyMaskToSelection` takes it) into logit space.
fn logit_of(p: f32) -> f32 {
    let p = p.clamp(1e-6, 1.0 - 1e-6);
    (p / (1.0 - p)).ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{MaskCandidate, SegmentationResponse, SegmentationTiming};

    #[test]
    fn preprocess_image_is_pure_reshuffle_at_native_size() {
        let s = ENCODER_INPUT_SIZE;
        let mut rgba = vec![0u8; (s * s * 4) as usize];
        for (i, chunk) in rgba.chunks_mut(4).enumerate() {
            chunk[0] = (i % 255) as u8;
            chunk[1] = ((i / 7) % 255) as u8;
            chunk[2] = ((i / 13) % 255) as u8;
            chunk[3] = 255;
        }
        let tensor = preprocess_image(&rgba, s, s);
        let plane = (s * s) as usize;
        assert_eq!(tensor.len(), plane * 3);
        assert!((tensor[0] - rgba[0] as f32 / 255.0).abs() < 1e-6);
        assert!((tensor[plane] - rgba[1] as f32 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn scale_point_maps_into_encoder_space() {
        let (x, y) = scale_point(320.0, 180.0, 640, 360);
        assert!((x - 512.0).abs() < 1e-3);
        assert!((y - 512.0).abs() < 1e-3);
    }

    #[test]
    fn resize_mask_binary_is_only_0_or_255() {
        let mask = vec![0u8, 255, 0, 255];
        let resized = resize_mask_binary(&mask, 2, 2, 8, 8);
        assert!(resized.iter().all(|&v| v == 0 || v == 255));
    }

    #[test]
    fn resize_mask_smooth_is_in_unit_interval() {
        let mask = vec![0u8, 128, 255, 64];
        let resized = resize_mask_smooth(&mask, 2, 2, 6, 6);
        assert!(resized.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn process_mask_logits_thresholds_at_zero_by_default() {
        let plane = MASK_LOGITS_SIZE * MASK_LOGITS_SIZE;
        let mut logits = vec![-1.0f32; plane * 3];
        logits[plane + 5] = 2.0;
        let mask = process_mask_logits(&logits, 3, 1, 0.0);
        assert_eq!(mask[5], 255);
        assert_eq!(mask[0], 0);
    }

    #[test]
    fn apply_mask_to_selection_without_logits_ignores_threshold() {
        let response = SegmentationResponse {
            width: 2,
            height: 2,
            mask: vec![0, 255, 0, 255],
            logits: None,
            all_masks: vec![MaskCandidate {
                index: 0,
                iou_score: 1.0,
                mask: vec![0, 255, 0, 255],
                width: 2,
                height: 2,
                logits: vec![0.0; MASK_LOGITS_SIZE * MASK_LOGITS_SIZE],
            }],
            selected_mask_index: 0,
            timing: SegmentationTiming::default(),
        };
        let canvas = apply_mask_to_selection(
            &response,
            ApplyMaskOptions {
                op: SelectionOp::Add,
                threshold: 0.99,
                target_width: 2,
                target_height: 2,
            },
        );
        assert_eq!(canvas.rgba[3], 0);
        assert_eq!(canvas.rgba[7], 255);
    }
}
