//! Transformer Pool
//!
//! Executes CPU-bound byte transforms (JS/CSS/HTML) on a bounded pool of dedicated OS threads
//! so they never block the I/O reactor. The actual transform logic (Babel/
//! PostCSS-equivalent rewriting) is explicitly out of scope; this module owns only
//! the capability trait, the scheduling, and the error-ignorability policy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::content_kind::ContentKind;
use crate::error::TransformError;
use crate::metrics::Metrics;

const QUEUE_CAPACITY_PER_KIND: usize = 256;

/// Flags relevant to a transform invocation, threaded through from the active `FeatureFlags`
/// and `RevampConfig` so a `Transformer` can tailor its output.
#[derive(Debug, Clone)]
pub struct TransformFlags {
    pub bundle_es_modules: bool,
    pub emulate_service_workers: bool,
    pub spoof_user_agent_in_js: bool,
    pub target_browsers: Vec<String>,
}

/// Capability the pool invokes for each job. The pipeline never calls this directly — it goes
/// through [`TransformerPool::submit`] so the call always happens on a worker thread.
pub trait Transformer: Send + Sync {
    fn transform(
        &self,
        kind: ContentKind,
        bytes: &[u8],
        url: &str,
        flags: &TransformFlags,
    ) -> Result<Vec<u8>, TransformError>;
}

/// Returns the input unchanged. Used when no real transformer is configured; lets the rest of
/// the pipeline (caching, header rewriting, polyfill injection) exercise its full path even
/// without the out-of-scope JS/CSS/HTML rewrite logic.
pub struct NoopTransformer;

impl Transformer for NoopTransformer {
    fn transform(
        &self,
        _kind: ContentKind,
        bytes: &[u8],
        _url: &str,
        _flags: &TransformFlags,
    ) -> Result<Vec<u8>, TransformError> {
        Ok(bytes.to_vec())
    }
}

/// Test double: appends a visible marker so pipeline tests can distinguish "transformed" output
/// from a pass-through.
#[cfg(test)]
pub struct MarkerTransformer;

#[cfg(test)]
impl Transformer for MarkerTransformer {
    fn transform(
        &self,
        kind: ContentKind,
        bytes: &[u8],
        _url: &str,
        _flags: &TransformFlags,
    ) -> Result<Vec<u8>, TransformError> {
        let mut out = bytes.to_vec();
        out.extend_from_slice(format!("/*transformed:{}*/", kind.as_str()).as_bytes());
        Ok(out)
    }
}

struct Job {
    kind: ContentKind,
    bytes: Vec<u8>,
    url: String,
    flags: TransformFlags,
    reply: oneshot::Sender<Result<Vec<u8>, TransformError>>,
}

/// A bounded pool of native-thread workers draining one queue per transformable
/// [`ContentKind`]. Workers are assigned to queues round-robin so a pool of `N` workers over 3
/// kinds still parallelizes across kinds while preserving FIFO order within a kind.
pub struct TransformerPool {
    queues: HashMap<ContentKind, mpsc::Sender<Job>>,
}

impl TransformerPool {
    /// Spawn `min(num_cpus::get(), 8)` worker threads (never fewer than 1), round-robined
    /// across one bounded channel per transformable `ContentKind`.
    pub fn new(transformer: Arc<dyn Transformer>, metrics: Arc<Metrics>) -> Self {
        Self::with_worker_count(transformer, num_cpus::get().clamp(1, 8), metrics)
    }

    pub fn with_worker_count(
        transformer: Arc<dyn Transformer>,
        worker_count: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        let kinds = [ContentKind::Js, ContentKind::Css, ContentKind::Html];
        let mut queues = HashMap::new();
        let mut receivers = Vec::new();

        for kind in kinds {
            let (tx, rx) = mpsc::channel(QUEUE_CAPACITY_PER_KIND);
            queues.insert(kind, tx);
            receivers.push((kind, Arc::new(Mutex::new(rx))));
        }

        let worker_count = worker_count.max(1);
        for worker_index in 0..worker_count {
            let (kind, receiver) = receivers[worker_index % receivers.len()].clone();
            let transformer = Arc::clone(&transformer);
            let metrics = Arc::clone(&metrics);
            std::thread::Builder::new()
                .name(format!("revamp-transform-{worker_index}"))
                .spawn(move || worker_loop(kind, receiver, transformer, metrics))
                .expect("failed to spawn transformer worker thread");
        }

        Self { queues }
    }

    /// Submit `bytes` for transformation, suspending the caller until a worker picks it up and
    /// replies. Backpressure: if the bounded channel for `kind` is full, this await blocks the
    /// submitter rather than growing an unbounded queue.
    pub async fn submit(
        &self,
        kind: ContentKind,
        bytes: Vec<u8>,
        url: String,
        flags: TransformFlags,
    ) -> Result<Vec<u8>, TransformError> {
        let queue = self
            .queues
            .get(&kind)
            .ok_or(TransformError::PoolClosed)?
            .clone();

        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job {
            kind,
            bytes,
            url,
            flags,
            reply: reply_tx,
        };

        queue.send(job).await.map_err(|_| TransformError::PoolClosed)?;
        reply_rx.await.map_err(|_| TransformError::PoolClosed)?
    }
}

fn worker_loop(
    kind: ContentKind,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    transformer: Arc<dyn Transformer>,
    metrics: Arc<Metrics>,
) {
    loop {
        // `blocking_recv` is the intended escape hatch for exactly this: a dedicated
        // non-runtime OS thread pulling off an async-facing bounded channel.
        let job = {
            let mut rx = receiver.lock().expect("transform queue receiver poisoned");
            rx.blocking_recv()
        };

        let Some(job) = job else {
            // All senders dropped; pool is shutting down.
            return;
        };

        let start = std::time::Instant::now();
        let result = transformer.transform(kind, &job.bytes, &job.url, &job.flags);
        metrics
            .transform_duration_seconds
            .with_label_values(&[kind.as_str()])
            .observe(start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            let ignorable = e.is_ignorable();
            metrics
                .transform_errors_total
                .with_label_values(&[kind.as_str(), if ignorable { "true" } else { "false" }])
                .inc();
            if !ignorable {
                warn!(kind = kind.as_str(), url = %job.url, error = %e, "transform failed");
            }
        }
        // If the submitter dropped its receiver (cancelled before we started), this send just
        // fails silently; the job has already run to completion and the result is discarded.
        let _ = job.reply.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags() -> TransformFlags {
        TransformFlags {
            bundle_es_modules: true,
            emulate_service_workers: true,
            spoof_user_agent_in_js: true,
            target_browsers: vec!["ios 9".to_string()],
        }
    }

    #[tokio::test]
    async fn noop_transformer_returns_input_unchanged() {
        let pool = TransformerPool::with_worker_count(Arc::new(NoopTransformer), 2, Arc::new(Metrics::new().unwrap()));
        let out = pool
            .submit(
                ContentKind::Js,
                b"let x = 1;".to_vec(),
                "http://x/app.js".to_string(),
                flags(),
            )
            .await
            .unwrap();
        assert_eq!(out, b"let x = 1;");
    }

    #[tokio::test]
    async fn marker_transformer_is_invoked_per_kind() {
        let pool = TransformerPool::with_worker_count(Arc::new(MarkerTransformer), 4, Arc::new(Metrics::new().unwrap()));
        let js = pool
            .submit(ContentKind::Js, b"a".to_vec(), "u".into(), flags())
            .await
            .unwrap();
        let css = pool
            .submit(ContentKind::Css, b"a".to_vec(), "u".into(), flags())
            .await
            .unwrap();
        assert!(String::from_utf8(js).unwrap().contains("transformed:js"));
        assert!(String::from_utf8(css)
            .unwrap()
            .contains("transformed:css"));
    }

    #[tokio::test]
    async fn many_concurrent_submissions_all_complete() {
        let pool = Arc::new(TransformerPool::with_worker_count(
            Arc::new(NoopTransformer),
            3,
            Arc::new(Metrics::new().unwrap()),
        ));
        let mut handles = Vec::new();
        for i in 0..64 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                pool.submit(
                    ContentKind::Html,
                    format!("doc-{i}").into_bytes(),
                    "u".into(),
                    flags(),
                )
                .await
                .unwrap()
            }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            let out = handle.await.unwrap();
            assert_eq!(out, format!("doc-{i}").into_bytes());
        }
    }

    struct AlwaysIgnorable;
    impl Transformer for AlwaysIgnorable {
        fn transform(
            &self,
            _kind: ContentKind,
            _bytes: &[u8],
            _url: &str,
            _flags: &TransformFlags,
        ) -> Result<Vec<u8>, TransformError> {
            Err(TransformError::Ignorable("has already been declared".into()))
        }
    }

    #[tokio::test]
    async fn ignorable_errors_surface_to_the_caller_as_such() {
        let pool = TransformerPool::with_worker_count(Arc::new(AlwaysIgnorable), 1, Arc::new(Metrics::new().unwrap()));
        let err = pool
            .submit(ContentKind::Js, b"x".to_vec(), "u".into(), flags())
            .await
            .unwrap_err();
        assert!(err.is_ignorable());
    }
}
