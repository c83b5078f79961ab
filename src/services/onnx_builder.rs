// Shared ONNX Runtime session builder with hardware acceleration detection,
// plus the session pool used by the detector.

use anyhow::{Context, Result};
use crossbeam::channel::{bounded, Receiver, Sender};
use ort::execution_providers::{CPUExecutionProvider, ExecutionProviderDispatch};
use ort::session::{builder::GraphOptimizationLevel, Session};
use std::ops::{Deref, DerefMut};
use std::path::Path;
use tracing::{debug, info, warn};

#[cfg(feature = "tensorrt")]
use ort::execution_providers::TensorRTExecutionProvider;

#[cfg(feature = "cuda")]
use ort::execution_providers::CUDAExecutionProvider;

#[cfg(all(target_os = "macos", feature = "coreml"))]
use ort::execution_providers::CoreMLExecutionProvider;

#[cfg(all(target_os = "windows", feature = "directml"))]
use ort::execution_providers::DirectMLExecutionProvider;

#[cfg(feature = "openvino")]
use ort::execution_providers::OpenVINOExecutionProvider;

/// Intra-op thread count for CPU inference.
///
/// Windows is capped at 6 threads; beyond that thread synchronization
/// overhead outweighs the extra cores.
fn optimal_intra_op_threads() -> usize {
    let total_cores = num_cpus::get();

    #[cfg(target_os = "windows")]
    let optimal = std::cmp::min(6, total_cores).max(1);

    #[cfg(not(target_os = "windows"))]
    let optimal = total_cores.max(1);

    debug!("CPU threads: {} total cores, using {} for inference", total_cores, optimal);
    optimal
}

/// Fixed-size pool of ONNX sessions backed by a crossbeam channel.
///
/// `acquire` blocks until a session is free, so it must only be called from
/// blocking contexts (`spawn_blocking`).
pub struct OnnxSessionPool {
    sender: Sender<Session>,
    receiver: Receiver<Session>,
}

impl OnnxSessionPool {
    pub fn new(sessions: Vec<Session>) -> Self {
        let capacity = sessions.len().max(1);
        let (sender, receiver) = bounded(capacity);
        for session in sessions {
            // Capacity equals the number of sessions, so this never blocks
            let _ = sender.send(session);
        }
        Self { sender, receiver }
    }

    /// Take a session out of the pool; it returns to the pool when the guard drops
    pub fn acquire(&self) -> Option<PooledSession<'_>> {
        // recv only fails once every sender is gone, and the pool owns one
        self.receiver.recv().ok().map(|session| PooledSession {
            pool: self,
            session: Some(session),
        })
    }
}

/// Session borrowed from an [`OnnxSessionPool`]
pub struct PooledSession<'a> {
    pool: &'a OnnxSessionPool,
    session: Option<Session>,
}

impl Deref for PooledSession<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session.as_ref().expect("session present until drop")
    }
}

impl DerefMut for PooledSession<'_> {
    fn deref_mut(&mut self) -> &mut Session {
        self.session.as_mut().expect("session present until drop")
    }
}

impl Drop for PooledSession<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = self.pool.sender.send(session);
        }
    }
}

fn commit_with(provider: ExecutionProviderDispatch, model_bytes: &[u8]) -> ort::Result<Session> {
    Session::builder()?
        .with_execution_providers([provider])?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(optimal_intra_op_threads())?
        .with_inter_threads(1)?
        .commit_from_memory(model_bytes)
}

/// Accelerated providers compiled into this build, in order of preference
fn accelerated_providers() -> Vec<(&'static str, ExecutionProviderDispatch)> {
    #[allow(unused_mut)]
    let mut providers: Vec<(&'static str, ExecutionProviderDispatch)> = Vec::new();

    #[cfg(feature = "tensorrt")]
    providers.push(("TensorRT", TensorRTExecutionProvider::default().build()));

    #[cfg(feature = "cuda")]
    providers.push(("CUDA", CUDAExecutionProvider::default().build()));

    #[cfg(all(target_os = "macos", feature = "coreml"))]
    providers.push(("CoreML", CoreMLExecutionProvider::default().build()));

    #[cfg(all(target_os = "windows", feature = "directml"))]
    providers.push(("DirectML", DirectMLExecutionProvider::default().build()));

    #[cfg(feature = "openvino")]
    providers.push((
        "OpenVINO",
        OpenVINOExecutionProvider::default().with_device_type("CPU").build(),
    ));

    providers
}

/// Read a model file from disk
pub fn read_model_bytes(path: &Path) -> Result<Vec<u8>> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read ONNX model {}", path.display()))?;
    debug!(
        "Read model {} ({:.1} MB)",
        path.display(),
        bytes.len() as f64 / 1_048_576.0
    );
    Ok(bytes)
}

/// Build an ONNX Runtime session, trying compiled-in accelerators first.
///
/// `backend` forces a provider by name (`CUDA`, `TENSORRT`, `OPENVINO`,
/// `DIRECTML`, `COREML`, `CPU`); `None` or `AUTO` selects automatically.
///
/// Returns (backend_name, Session)
pub fn build_session_with_acceleration(
    model_bytes: &[u8],
    model_name: &str,
    backend: Option<&str>,
) -> Result<(String, Session)> {
    if let Some(forced) = backend.filter(|b| !b.eq_ignore_ascii_case("auto")) {
        info!("INFERENCE_BACKEND={}, forcing specific backend for {}", forced, model_name);
        return try_forced_backend(forced, model_bytes, model_name);
    }

    for (name, provider) in accelerated_providers() {
        match commit_with(provider, model_bytes) {
            Ok(session) => {
                info!("✓ Using {} acceleration for {}", name, model_name);
                return Ok((name.to_string(), session));
            }
            Err(e) => debug!("{} unavailable for {}: {}", name, model_name, e),
        }
    }

    let session = commit_with(CPUExecutionProvider::default().build(), model_bytes).with_context(|| {
        format!(
            "Failed to load {} ONNX model ({:.1} MB). The file may be corrupt \
             or built with an unsupported opset",
            model_name,
            model_bytes.len() as f64 / 1_048_576.0
        )
    })?;

    if accelerated_providers().is_empty() {
        info!("Using CPU inference for {}", model_name);
    } else {
        warn!("⚠️  Using CPU-only inference for {} (no accelerator could be initialized)", model_name);
    }
    Ok(("CPU".to_string(), session))
}

fn try_forced_backend(backend: &str, model_bytes: &[u8], model_name: &str) -> Result<(String, Session)> {
    if backend.eq_ignore_ascii_case("cpu") {
        let session = commit_with(CPUExecutionProvider::default().build(), model_bytes)
            .with_context(|| format!("Failed to load {} with CPU", model_name))?;
        info!("✓ Forced CPU backend for {}", model_name);
        return Ok(("CPU".to_string(), session));
    }

    let provider = accelerated_providers()
        .into_iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(backend));

    match provider {
        Some((name, provider)) => {
            let session = commit_with(provider, model_bytes)
                .with_context(|| format!("Failed to load {} with {}", model_name, name))?;
            info!("✓ Forced {} backend for {}", name, model_name);
            Ok((format!("{} (forced)", name), session))
        }
        None => anyhow::bail!(
            "Inference backend '{}' is not available in this build. \
             Rebuild with the matching cargo feature (cuda, tensorrt, openvino, directml, coreml) \
             or use CPU/AUTO",
            backend
        ),
    }
}
