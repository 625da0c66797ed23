//! Durable model artifact cache and streaming downloader (C2).
//!
//! The browser spec persists model bytes in an IndexedDB store named
//! `supersplat-sam2-models`; the idiomatic-Rust analogue used here is a
//! small rusqlite database under the Tauri app data dir, following the
//! same `Connection` + migration shape as the teacher's `core::db`.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};
use tokio_util::sync::CancellationToken;

use crate::core::error::{Result, SamError};
use crate::core::types::{
    CachedModelInfo, ModelLoadProgress, ModelStage, EXPECTED_DECODER_BYTES, EXPECTED_ENCODER_BYTES,
};

/// One of the two pinned model artifacts.
#[derive(Debug, Clone)]
pub struct ModelArtifact {
    pub key: &'static str,
    pub url: String,
    pub expected_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ModelStoreConfig {
    pub encoder: ModelArtifact,
    pub decoder: ModelArtifact,
}

impl ModelStoreConfig {
    pub fn with_urls(encoder_url: impl Into<String>, decoder_url: impl Into<String>) -> Self {
        Self {
            encoder: ModelArtifact {
                key: "encoder",
                url: encoder_url.into(),
                expected_bytes: EXPECTED_ENCODER_BYTES,
            },
            decoder: ModelArtifact {
                key: "decoder",
                url: decoder_url.into(),
                expected_bytes: EXPECTED_DECODER_BYTES,
            },
        }
    }
}

pub struct LoadedModels {
    pub encoder: Vec<u8>,
    pub decoder: Vec<u8>,
}

pub struct ModelStore {
    conn: parking_lot::Mutex<Connection>,
    config: ModelStoreConfig,
    http: reqwest::Client,
}

impl ModelStore {
    pub fn open(db_path: &Path, config: ModelStoreConfig) -> Result<Self> {
        let conn = Connection::open(db_path)
            .map_err(|e| SamError::CacheError(format!("opening model cache: {e}")))?;
        migrate(&conn).map_err(|e| SamError::CacheError(format!("migrating model cache: {e}")))?;
        Ok(Self {
            conn: parking_lot::Mutex::new(conn),
            config,
            http: reqwest::Client::new(),
        })
    }

    pub fn db_path(app_data_dir: &Path) -> PathBuf {
        app_data_dir.join("sam2-models.db")
    }

    pub fn total_expected_bytes(&self) -> u64 {
        self.config.encoder.expected_bytes + self.config.decoder.expected_bytes
    }

    pub fn is_cached(&self) -> bool {
        let conn = self.conn.lock();
        has_key(&conn, "encoder") && has_key(&conn, "decoder")
    }

    pub fn cached_info(&self) -> Option<CachedModelInfo> {
        let conn = self.conn.lock();
        let encoder_bytes = byte_len(&conn, "encoder")?;
        let decoder_bytes = byte_len(&conn, "decoder")?;
        Some(CachedModelInfo {
            encoder_bytes,
            decoder_bytes,
        })
    }

    pub fn clear_cache(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM models", [])
            .map_err(|e| SamError::CacheError(format!("clearing model cache: {e}")))?;
        Ok(())
    }

    /// Load both artifacts, cache-first, network fallback, reporting
    /// combined progress across both stages per the spec's formula:
    /// `overall = encoderBytesSoFar + (on decoder ? encoderTotal + decoderBytesSoFar : 0)`.
    pub async fn load_all(
        &self,
        mut on_progress: impl FnMut(ModelLoadProgress),
        cancel: &CancellationToken,
    ) -> Result<LoadedModels> {
        let encoder_total = self.config.encoder.expected_bytes;
        let decoder_total = self.config.decoder.expected_bytes;

        let encoder = self
            .load_one(&self.config.encoder, ModelStage::Encoder, 0, |loaded| {
                on_progress(ModelLoadProgress {
                    loaded,
                    total: encoder_total + decoder_total,
                    stage: ModelStage::Encoder,
                });
            }, cancel)
            .await?;

        let decoder = self
            .load_one(&self.config.decoder, ModelStage::Decoder, encoder_total, |loaded| {
                on_progress(ModelLoadProgress {
                    loaded,
                    total: encoder_total + decoder_total,
                    stage: ModelStage::Decoder,
                });
            }, cancel)
            .await?;

        Ok(LoadedModels { encoder, decoder })
    }

    async fn load_one(
        &self,
        artifact: &ModelArtifact,
        stage: ModelStage,
        base_offset: u64,
        mut on_progress: impl FnMut(u64),
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        if let Some(bytes) = self.read_cached(artifact.key) {
            on_progress(base_offset + artifact.expected_bytes);
            return Ok(bytes);
        }

        let bytes = self
            .download_streaming(artifact, base_offset, &mut on_progress, cancel)
            .await?;

        if let Err(e) = self.write_cached(artifact.key, &bytes) {
            eprintln!("sam2: failed to persist {:?} artifact to cache: {e}", stage);
        }

        Ok(bytes)
    }

    async fn download_streaming(
        &self,
        artifact: &ModelArtifact,
        base_offset: u64,
        on_progress: &mut impl FnMut(u64),
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(SamError::Aborted),
            r = self.http.get(&artifact.url).send() => {
                r.map_err(|e| SamError::NetworkError(e.to_string()))?
            }
        };

        if !response.status().is_success() {
            return Err(SamError::NetworkError(format!(
                "unexpected status {} fetching {}",
                response.status(),
                artifact.key
            )));
        }

        let mut buf = Vec::with_capacity(artifact.expected_bytes as usize);
        let mut response = response;
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(SamError::Aborted),
                c = response.chunk() => c.map_err(|e| SamError::NetworkError(e.to_string()))?,
            };
            let Some(chunk) = chunk else { break };
            buf.extend_from_slice(&chunk);
            on_progress(base_offset + buf.len() as u64);
        }

        Ok(buf)
    }

    fn read_cached(&self, key: &str) -> Option<Vec<u8>> {
        let conn = self.conn.lock();
        conn.query_row("SELECT bytes FROM models WHERE key = ?1", params![key], |row| {
            row.get::<_, Vec<u8>>(0)
        })
        .ok()
    }

    fn write_cached(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO models (key, bytes, byte_len) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET bytes = excluded.bytes, byte_len = excluded.byte_len",
            params![key, bytes, bytes.len() as i64],
        )
        .map_err(|e| SamError::CacheError(format!("writing {key} to cache: {e}")))?;
        Ok(())
    }
}

fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS models (
            key TEXT PRIMARY KEY,
            bytes BLOB NOT NULL,
            byte_len INTEGER NOT NULL
        )",
        [],
    )?;
    Ok(())
}

fn has_key(conn: &Connection, key: &str) -> bool {
    conn.query_row("SELECT 1 FROM models WHERE key = ?1", params![key], |_| Ok(()))
        .is_ok()
}

fn byte_len(conn: &Connection, key: &str) -> Option<u64> {
    conn.query_row("SELECT byte_len FROM models WHERE key = ?1", params![key], |row| {
        row.get::<_, i64>(0)
    })
    .ok()
    .map(|v| v as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> ModelStore {
        let config = ModelStoreConfig::with_urls(
            "https://example.invalid/encoder.onnx",
            "https://example.invalid/decoder.onnx",
        );
        ModelStore::open(Path::new(":memory:"), config).unwrap()
    }

    #[test]
    fn fresh_store_is_not_cached() {
        let store = test_store();
        assert!(!store.is_cached());
        assert!(store.cached_info().is_none());
    }

    #[test]
    fn write_then_read_round_trips_and_marks_cached() {
        let store = test_store();
        store.write_cached("encoder", &[1, 2, 3, 4]).unwrap();
        store.write_cached("decoder", &[5, 6]).unwrap();
        assert!(store.is_cached());
        let info = store.cached_info().unwrap();
        assert_eq!(info.encoder_bytes, 4);
        assert_eq!(info.decoder_bytes, 2);
        assert_eq!(store.read_cached("encoder").unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn clear_cache_removes_everything() {
        let store = test_store();
        store.write_cached("encoder", &[1]).unwrap();
        store.clear_cache().unwrap();
        assert!(!store.is_cached());
    }

    #[test]
    fn total_expected_bytes_sums_both_artifacts() {
        let store = test_store();
        assert_eq!(
            store.total_expected_bytes(),
            EXPECTED_ENCODER_BYTES + EXPECTED_DECODER_BYTES
        );
    }
}
