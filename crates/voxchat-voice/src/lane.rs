//! Per-instance dispatch lane: one in-flight call per model instance.
//!
//! Speech and voice-cloning models are not guaranteed safe for concurrent inference, so every
//! long-lived backend is wrapped in a `ModelLane` and all calls go through `run`.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::trace;

pub struct ModelLane<B: ?Sized> {
    label: &'static str,
    backend: Arc<B>,
    gate: Mutex<()>,
    calls: AtomicU64,
}

impl<B: ?Sized + Send + Sync> ModelLane<B> {
    pub fn new(label: &'static str, backend: Arc<B>) -> Self {
        Self {
            label,
            backend,
            gate: Mutex::new(()),
            calls: AtomicU64::new(0),
        }
    }

    /// Run `f` against the backend once every earlier caller has finished.
    pub async fn run<'a, F, Fut, T>(&'a self, f: F) -> T
    where
        F: FnOnce(&'a B) -> Fut,
        Fut: Future<Output = T> + 'a,
    {
        let _guard = self.gate.lock().await;
        let n = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(target: "voxchat::voice", "{} lane: call #{}", self.label, n);
        f(self.backend.as_ref()).await
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Calls dispatched so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct Probe {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Probe {
        async fn infer(&self) {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn calls_are_serialized_per_instance() {
        let probe = Arc::new(Probe::default());
        let lane = Arc::new(ModelLane::new("probe", Arc::clone(&probe)));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lane = Arc::clone(&lane);
            handles.push(tokio::spawn(async move {
                lane.run(|p| p.infer()).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(probe.peak.load(Ordering::SeqCst), 1);
        assert_eq!(lane.calls(), 8);
    }
}
