//! Worker Shim (C5): runs the `Engine` on a dedicated OS thread so the
//! async command handlers never block on GPU/CPU inference.
//!
//! FIFO ordering is structural here rather than a policy to uphold: there
//! is exactly one consumer thread pulling off an `mpsc` channel, so
//! requests are served in submission order by construction. Large buffers
//! move into the request/response enums by value — Rust's ownership model
//! is the native analogue of the spec's "transferable buffer" contract, so
//! no `Arc` sharing is used for them.

use std::sync::mpsc;

use tokio::sync::oneshot;

use crate::core::engine::{Engine, EngineOptions};
use crate::core::error::{Result, SamError};
use crate::core::types::{PromptPoint, SegmentationResponse};

pub enum WorkerRequest {
    Initialize {
        encoder_bytes: Vec<u8>,
        decoder_bytes: Vec<u8>,
        options: EngineOptions,
        respond: oneshot::Sender<Result<String>>,
    },
    Encode {
        image_id: String,
        rgba: Vec<u8>,
        width: u32,
        height: u32,
        respond: oneshot::Sender<Result<f64>>,
    },
    Decode {
        image_id: String,
        points: Vec<PromptPoint>,
        width: u32,
        height: u32,
        previous_mask_logits: Option<Vec<f32>>,
        respond: oneshot::Sender<Result<SegmentationResponse>>,
    },
    Segment {
        image_id: String,
        rgba: Vec<u8>,
        width: u32,
        height: u32,
        points: Vec<PromptPoint>,
        previous_mask_logits: Option<Vec<f32>>,
        respond: oneshot::Sender<Result<SegmentationResponse>>,
    },
    ClearCache {
        image_id: Option<String>,
        respond: oneshot::Sender<Result<()>>,
    },
    GetStatus {
        respond: oneshot::Sender<Result<WorkerStatus>>,
    },
    Dispose {
        respond: oneshot::Sender<Result<()>>,
    },
}

#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub initialized: bool,
    pub provider: Option<String>,
}

/// Handle to the worker thread. Dropping it closes the request channel,
/// which lets the worker thread's receive loop end and join naturally.
///
/// `sender` is wrapped in `Option` so `Drop::drop` can explicitly close it
/// (via `.take()`) before joining: a struct's own fields are only dropped
/// *after* its `Drop::drop` body returns, so joining through a still-live
/// `sender` field would deadlock against the worker thread's `recv()` loop,
/// which never sees the channel close.
pub struct WorkerHandle {
    sender: Option<mpsc::Sender<WorkerRequest>>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn spawn() -> Self {
        let (sender, receiver) = mpsc::channel::<WorkerRequest>();
        let join = std::thread::spawn(move || run_worker(receiver));
        Self {
            sender: Some(sender),
            join: Some(join),
        }
    }

    fn send(&self, request: WorkerRequest) -> Result<()> {
        self.sender
            .as_ref()
            .ok_or_else(|| SamError::InitError("worker thread is no longer running".into()))?
            .send(request)
            .map_err(|_| SamError::InitError("worker thread is no longer running".into()))
    }

    pub async fn initialize(
        &self,
        encoder_bytes: Vec<u8>,
        decoder_bytes: Vec<u8>,
        options: EngineOptions,
    ) -> Result<String> {
        let (respond, recv) = oneshot::channel();
        self.send(WorkerRequest::Initialize {
            encoder_bytes,
            decoder_bytes,
            options,
            respond,
        })?;
        await_response(recv).await
    }

    pub async fn encode(&self, image_id: String, rgba: Vec<u8>, width: u32, height: u32) -> Result<f64> {
        let (respond, recv) = oneshot::channel();
        self.send(WorkerRequest::Encode {
            image_id,
            rgba,
            width,
            height,
            respond,
        })?;
        await_response(recv).await
    }

    pub async fn decode(
        &self,
        image_id: String,
        points: Vec<PromptPoint>,
        width: u32,
        height: u32,
        previous_mask_logits: Option<Vec<f32>>,
    ) -> Result<SegmentationResponse> {
        let (respond, recv) = oneshot::channel();
        self.send(WorkerRequest::Decode {
            image_id,
            points,
            width,
            height,
            previous_mask_logits,
            respond,
        })?;
        await_response(recv).await
    }

    pub async fn segment(
        &self,
        image_id: String,
        rgba: Vec<u8>,
        width: u32,
        height: u32,
        points: Vec<PromptPoint>,
        previous_mask_logits: Option<Vec<f32>>,
    ) -> Result<SegmentationResponse> {
        let (respond, recv) = oneshot::channel();
        self.send(WorkerRequest::Segment {
            image_id,
            rgba,
            width,
            height,
            points,
            previous_mask_logits,
            respond,
        })?;
        await_response(recv).await
    }

    pub async fn clear_cache(&self, image_id: Option<String>) -> Result<()> {
        let (respond, recv) = oneshot::channel();
        self.send(WorkerRequest::ClearCache { image_id, respond })?;
        await_response(recv).await
    }

    pub async fn get_status(&self) -> Result<WorkerStatus> {
        let (respond, recv) = oneshot::channel();
        self.send(WorkerRequest::GetStatus { respond })?;
        await_response(recv).await
    }

    pub async fn dispose(&self) -> Result<()> {
        let (respond, recv) = oneshot::channel();
        self.send(WorkerRequest::Dispose { respond })?;
        await_response(recv).await
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        // Drop the sender first so the worker's `receiver.recv()` loop sees
        // the channel close and exits; only then join the thread.
        drop(self.sender.take());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

async fn await_response<T>(recv: oneshot::Receiver<Result<T>>) -> Result<T> {
    match recv.await {
        Ok(result) => result,
        Err(_) => Err(SamError::InitError("worker dropped the response channel".into())),
    }
}

/// The worker's receive loop. One request in flight at a time; a panic
/// while servicing a request is caught and turned into an `error` response
/// tagged with the request kind, per the Failure Semantics in spec §4.2 —
/// the loop itself keeps running afterwards.
fn run_worker(receiver: mpsc::Receiver<WorkerRequest>) {
    let mut engine: Option<Engine> = None;

    while let Ok(request) = receiver.recv() {
        let request_kind = request_kind_name(&request);
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            handle_request(&mut engine, request)
        }));

        if let Err(panic) = outcome {
            let message = panic_message(&panic);
            eprintln!("sam2: worker request `{request_kind}` panicked: {message}");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn request_kind_name(request: &WorkerRequest) -> &'static str {
    match request {
        WorkerRequest::Initialize { .. } => "initialize",
        WorkerRequest::Encode { .. } => "encode",
        WorkerRequest::Decode { .. } => "decode",
        WorkerRequest::Segment { .. } => "segment",
        WorkerRequest::ClearCache { .. } => "clearCache",
        WorkerRequest::GetStatus { .. } => "getStatus",
        WorkerRequest::Dispose { .. } => "dispose",
    }
}

fn handle_request(engine: &mut Option<Engine>, request: WorkerRequest) {
    match request {
        WorkerRequest::Initialize {
            encoder_bytes,
            decoder_bytes,
            options,
            respond,
        } => {
            let result = Engine::initialize(&encoder_bytes, &decoder_bytes, &options).map(|built| {
                let provider = built.provider_used().to_string();
                *engine = Some(built);
                provider
            });
            let _ = respond.send(result);
        }
        WorkerRequest::Encode {
            image_id,
            rgba,
            width,
            height,
            respond,
        } => {
            let result = with_engine(engine, |e| e.encode(&image_id, &rgba, width, height));
            let _ = respond.send(result);
        }
        WorkerRequest::Decode {
            image_id,
            points,
            width,
            height,
            previous_mask_logits,
            respond,
        } => {
            let result = with_engine(engine, |e| {
                e.decode(&image_id, &points, width, height, previous_mask_logits.as_deref())
            });
            let _ = respond.send(result);
        }
        WorkerRequest::Segment {
            image_id,
            rgba,
            width,
            height,
            points,
            previous_mask_logits,
            respond,
        } => {
            let result = with_engine(engine, |e| {
                e.segment(&image_id, &rgba, width, height, &points, previous_mask_logits.as_deref())
            });
            let _ = respond.send(result);
        }
        WorkerRequest::ClearCache { image_id, respond } => {
            let result = with_engine(engine, |e| {
                match &image_id {
                    Some(id) => e.clear_image_cache(id),
                    None => e.clear_all_caches(),
                }
                Ok(())
            });
            let _ = respond.send(result);
        }
        WorkerRequest::GetStatus { respond } => {
            let status = WorkerStatus {
                initialized: engine.is_some(),
                provider: engine.as_ref().map(|e| e.provider_used().to_string()),
            };
            let _ = respond.send(Ok(status));
        }
        WorkerRequest::Dispose { respond } => {
            *engine = None;
            let _ = respond.send(Ok(()));
        }
    }
}

fn with_engine<T>(engine: &Option<Engine>, f: impl FnOnce(&Engine) -> Result<T>) -> Result<T> {
    match engine {
        Some(e) => f(e),
        None => Err(SamError::InitError("engine has not been initialized".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn status_before_initialize_reports_not_initialized() {
        let worker = WorkerHandle::spawn();
        let status = worker.get_status().await.unwrap();
        assert!(!status.initialized);
        assert!(status.provider.is_none());
    }

    #[tokio::test]
    async fn encode_before_initialize_fails_without_crashing_the_worker() {
        let worker = WorkerHandle::spawn();
        let err = worker
            .encode("img-1".into(), vec![0u8; 16], 2, 2)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "InitError");

        // The worker thread is still alive after the failed request —
        // a second, unrelated request is still served.
        let status = worker.get_status().await.unwrap();
        assert!(!status.initialized);
    }

    #[tokio::test]
    async fn dropping_the_handle_joins_the_worker_thread_without_hanging() {
        let worker = WorkerHandle::spawn();
        let dropped = tokio::task::spawn_blocking(move || drop(worker));
        tokio::time::timeout(std::time::Duration::from_secs(5), dropped)
            .await
            .expect("dropping WorkerHandle must not hang")
            .unwrap();
    }

    #[tokio::test]
    async fn responses_arrive_in_submission_order() {
        let worker = WorkerHandle::spawn();
        let first = worker.get_status();
        let second = worker.get_status();
        let (a, b) = tokio::join!(first, second);
        assert!(a.is_ok());
        assert!(b.is_ok());
    }
}
