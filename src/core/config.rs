//! Settings persistence. Grounded in the teacher's `core::config`
//! (`load_settings`/`save_settings` round-tripping a `Settings` struct as
//! JSON under the Tauri app config dir) — extended with the knobs this
//! spec's lifecycle/engine/capability layer needs that CLIP classification
//! never did: preferred execution provider, model cache/URL overrides, and
//! a low-VRAM threshold override for the capability probe.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tauri::{AppHandle, Manager};

use crate::core::types::{ExecutionBackend, LOW_VRAM_THRESHOLD_BYTES};

const SETTINGS_FILE: &str = "sam2-settings.json";

const DEFAULT_ENCODER_URL: &str =
    "https://huggingface.co/onnx-community/sam2-hiera-tiny/resolve/main/onnx/encoder.onnx";
const DEFAULT_DECODER_URL: &str =
    "https://huggingface.co/onnx-community/sam2-hiera-tiny/resolve/main/onnx/decoder.onnx";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// `None` lets the engine try GPU providers first, falling back to
    /// CPU; `Some(Cpu)` forces the CPU-only attempt (spec §4.1).
    pub preferred_provider: Option<ExecutionBackend>,
    pub encoder_url: String,
    pub decoder_url: String,
    /// Overrides the durable cache db's directory; `None` uses the Tauri
    /// app data dir, matching `Db::init`'s default.
    pub model_cache_dir: Option<String>,
    pub low_vram_threshold_bytes: u64,
    pub verbose_engine_logging: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            preferred_provider: None,
            encoder_url: DEFAULT_ENCODER_URL.to_string(),
            decoder_url: DEFAULT_DECODER_URL.to_string(),
            model_cache_dir: None,
            low_vram_threshold_bytes: LOW_VRAM_THRESHOLD_BYTES,
            verbose_engine_logging: false,
        }
    }
}

fn settings_path(app: &AppHandle) -> Result<PathBuf> {
    let dir = app
        .path()
        .app_config_dir()
        .map_err(|e| anyhow!("config dir: {e}"))?;
    fs::create_dir_all(&dir)?;
    Ok(dir.join(SETTINGS_FILE))
}

pub fn load_settings(app: &AppHandle) -> Settings {
    let path = match settings_path(app) {
        Ok(p) => p,
        Err(_) => return Settings::default(),
    };
    if !Path::new(&path).exists() {
        return Settings::default();
    }
    match fs::read_to_string(&path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
        Err(_) => Settings::default(),
    }
}

pub fn save_settings(app: &AppHandle, settings: &Settings) -> Result<()> {
    let path = settings_path(app)?;
    let content = serde_json::to_string_pretty(settings)?;
    fs::write(path, content)?;
    Ok(())
}

pub fn model_cache_db_path(app: &AppHandle, settings: &Settings) -> Result<PathBuf> {
    let dir = match &settings.model_cache_dir {
        Some(custom) => PathBuf::from(custom),
        None => app
            .path()
            .app_data_dir()
            .map_err(|e| anyhow!("app data dir: {e}"))?,
    };
    fs::create_dir_all(&dir)?;
    Ok(dir.join("sam2-models.db"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_round_trip_through_json() {
        let settings = Settings::default();
        let json = serde_json::to_string(&settings).unwrap();
        let back: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(back.encoder_url, settings.encoder_url);
        assert_eq!(back.low_vram_threshold_bytes, LOW_VRAM_THRESHOLD_BYTES);
    }
}
