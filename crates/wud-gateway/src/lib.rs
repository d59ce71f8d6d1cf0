//! The serialized DB gateway: a bounded queue consumed by a pool of worker
//! tasks, each holding its own `WuAccess` (and so its own pool connections).
//! Every call is `(method, args)` packaged as a boxed closure, run to
//! completion by whichever worker dequeues it next, with the result handed
//! back over a one-shot channel. Callers block on that channel exactly as
//! spec'd: submission order is preserved per worker, there's no
//! cross-worker ordering guarantee, and every operation is already
//! transactional in `wud-db` so that's not a problem.
//!
//! This is the alternative the Design Notes call out: "prefer direct access
//! with CAS updates over the queue-based gateway" when the store is
//! WAL-journaled and supports it, which `wud-db` does — use `WuAccess`
//! directly in that case. Use `Gateway` when a caller wants the explicit
//! single-writer-queue contract instead (or is migrating off a backend that
//! really does forbid cross-thread connections).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, warn};
use wud_db::{DbError, ResultFile, WorkUnitRecord, WuAccess};
use wud_mapper::ConditionSet;
use wud_state::WuStatus;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type Job = Box<dyn FnOnce(WuAccess) -> BoxFuture<()> + Send>;

enum Envelope {
    Job(Job),
    Shutdown,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway worker pool has shut down")]
    Closed,
}

/// A running worker pool. Clone freely; all clones share the same queue.
#[derive(Clone)]
pub struct Gateway {
    tx: mpsc::Sender<Envelope>,
}

pub struct GatewayHandle {
    gateway: Gateway,
    workers: Vec<JoinHandle<()>>,
}

impl GatewayHandle {
    pub fn gateway(&self) -> Gateway {
        self.gateway.clone()
    }

    /// Enqueue one shutdown sentinel per worker, then wait for every worker
    /// to drain its queue and exit. Fixes the original pool's shutdown bug,
    /// which enqueued sentinels but never joined the workers.
    pub async fn shutdown(self) {
        for _ in &self.workers {
            if self.gateway.tx.send(Envelope::Shutdown).await.is_err() {
                break;
            }
        }
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "gateway worker task panicked");
            }
        }
    }
}

/// Spawn `worker_count` workers, each wrapping its own `WuAccess` built from
/// `pool_factory`, pulling queued jobs off a shared bounded channel of
/// `queue_depth`.
pub async fn spawn<F, Fut>(
    worker_count: usize,
    queue_depth: usize,
    pool_factory: F,
) -> Result<GatewayHandle, DbError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<WuAccess, DbError>>,
{
    let (tx, rx) = mpsc::channel(queue_depth);
    let rx = Arc::new(Mutex::new(rx));

    let mut workers = Vec::with_capacity(worker_count);
    for worker_id in 0..worker_count {
        let db = pool_factory().await?;
        let rx = Arc::clone(&rx);
        workers.push(tokio::spawn(async move {
            run_worker(worker_id, db, rx).await;
        }));
    }

    Ok(GatewayHandle {
        gateway: Gateway { tx },
        workers,
    })
}

async fn run_worker(worker_id: usize, db: WuAccess, rx: Arc<Mutex<mpsc::Receiver<Envelope>>>) {
    loop {
        let envelope = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        match envelope {
            Some(Envelope::Job(job)) => job(db.clone()).await,
            Some(Envelope::Shutdown) | None => {
                warn!(worker_id, "gateway worker shutting down");
                break;
            }
        }
    }
}

impl Gateway {
    async fn call<T, F>(&self, f: F) -> Result<T, GatewayError>
    where
        T: Send + 'static,
        F: FnOnce(WuAccess) -> BoxFuture<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |db| {
            Box::pin(async move {
                let result = f(db).await;
                let _ = tx.send(result);
            })
        });
        self.tx
            .send(Envelope::Job(job))
            .await
            .map_err(|_| GatewayError::Closed)?;
        rx.await.map_err(|_| GatewayError::Closed)
    }

    pub async fn create(
        &self,
        wu_text: String,
        priority: Option<i64>,
    ) -> Result<Result<String, DbError>, GatewayError> {
        self.call(move |db| Box::pin(async move { db.create(&wu_text, priority).await }))
            .await
    }

    pub async fn assign(
        &self,
        client_id: String,
    ) -> Result<Result<Option<String>, DbError>, GatewayError> {
        self.call(move |db| Box::pin(async move { db.assign(&client_id).await }))
            .await
    }

    pub async fn result(
        &self,
        wuid: String,
        client_id: String,
        files: Vec<ResultFile>,
        error_code: i64,
        failed_command: Option<i64>,
    ) -> Result<Result<(), DbError>, GatewayError> {
        self.call(move |db| {
            Box::pin(async move {
                db.result(&wuid, &client_id, &files, error_code, failed_command)
                    .await
            })
        })
        .await
    }

    pub async fn verify(&self, wuid: String, ok: bool) -> Result<Result<(), DbError>, GatewayError> {
        self.call(move |db| Box::pin(async move { db.verify(&wuid, ok).await }))
            .await
    }

    pub async fn cancel(&self, wuid: String) -> Result<Result<bool, DbError>, GatewayError> {
        self.call(move |db| Box::pin(async move { db.cancel(&wuid).await }))
            .await
    }

    pub async fn query(
        &self,
        conditions: ConditionSet,
        limit: Option<i64>,
    ) -> Result<Result<Vec<WorkUnitRecord>, DbError>, GatewayError> {
        self.call(move |db| Box::pin(async move { db.query(&conditions, limit, None).await }))
            .await
    }

    pub async fn query_by_status(
        &self,
        status: WuStatus,
    ) -> Result<Result<Vec<WorkUnitRecord>, DbError>, GatewayError> {
        self.call(move |db| Box::pin(async move { db.query_by_status(status).await }))
            .await
    }
}
