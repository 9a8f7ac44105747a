//! Bounded worker pool for transactional requests
//!
//! Requests of one connection are executed strictly in arrival order by a
//! per-connection task; a shared semaphore bounds how many requests run
//! across all connections at once. Closing a connection's handle drains its
//! queue and then runs connection cleanup.

use crate::broker::handler::TransactionHandler;
use crate::broker::protocol::{Reply, Request};
use crate::error::{Result, StreamlineError};
use crate::message::ConnectionId;
use crate::transaction::{ResolvedReaper, ResolvedReaperConfig};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info};

type Job = (Request, oneshot::Sender<Reply>);

/// Statistics for the worker pool
#[derive(Debug, Default)]
pub struct WorkerPoolStats {
    /// Total requests executed
    pub requests_processed: AtomicU64,
    /// Requests executing right now
    pub in_flight: AtomicU64,
    /// Maximum concurrent requests seen
    pub max_concurrent: AtomicU64,
    /// Connections opened
    pub connections_opened: AtomicU64,
}

impl WorkerPoolStats {
    fn request_started(&self) {
        self.requests_processed.fetch_add(1, Ordering::Relaxed);
        let current = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;

        let mut max = self.max_concurrent.load(Ordering::Relaxed);
        while current > max {
            match self.max_concurrent.compare_exchange_weak(
                max,
                current,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(m) => max = m,
            }
        }
    }

    fn request_completed(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn current_in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }
}

/// Executes requests for many connections on a bounded set of permits
pub struct WorkerPool {
    handler: Arc<TransactionHandler>,
    permits: Arc<Semaphore>,
    stats: Arc<WorkerPoolStats>,
    queue_depth: usize,
    reaper: Arc<ResolvedReaper>,
}

impl WorkerPool {
    /// Create the pool and start the resolved-transaction reaper
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(handler: Arc<TransactionHandler>) -> Self {
        let ctx = handler.context();
        let config = ctx.config();
        let workers = config.worker_pool_size.max(1);
        let queue_depth = config.connection_queue_depth.max(1);
        let reaper = Arc::new(ResolvedReaper::new(
            Arc::clone(ctx.registry()),
            ResolvedReaperConfig::from_config(config),
        ));
        reaper.start();
        info!(workers, queue_depth, "Transaction worker pool created");
        Self {
            handler,
            permits: Arc::new(Semaphore::new(workers)),
            stats: Arc::new(WorkerPoolStats::default()),
            queue_depth,
            reaper,
        }
    }

    pub fn reaper(&self) -> &Arc<ResolvedReaper> {
        &self.reaper
    }

    pub fn stats(&self) -> &Arc<WorkerPoolStats> {
        &self.stats
    }

    /// Start serving a connection
    pub fn open_connection(&self, connection: ConnectionId) -> ConnectionHandle {
        let (tx, mut rx) = mpsc::channel::<Job>(self.queue_depth);
        let handler = Arc::clone(&self.handler);
        let permits = Arc::clone(&self.permits);
        let stats = Arc::clone(&self.stats);
        stats.connections_opened.fetch_add(1, Ordering::Relaxed);

        let task = tokio::spawn(async move {
            debug!(connection = %connection, "Connection worker started");

            while let Some((request, reply_tx)) = rx.recv().await {
                let reply = match Arc::clone(&permits).acquire_owned().await {
                    Ok(_permit) => {
                        stats.request_started();
                        let reply = handler.handle(connection, request).await;
                        stats.request_completed();
                        reply
                    }
                    Err(_) => Reply::error(&StreamlineError::ShuttingDown),
                };
                // client may have stopped waiting
                let _ = reply_tx.send(reply);
            }

            handler.connection_closed(connection).await;
            debug!(connection = %connection, "Connection worker stopped");
        });

        ConnectionHandle {
            connection,
            tx,
            task,
        }
    }

    /// Stop granting permits; queued and new requests fail with SHUTTING_DOWN
    pub fn shutdown(&self) {
        self.permits.close();
        self.reaper.shutdown();
        info!("Transaction worker pool shutting down");
    }
}

/// Submission side of one connection's request queue
pub struct ConnectionHandle {
    connection: ConnectionId,
    tx: mpsc::Sender<Job>,
    task: JoinHandle<()>,
}

impl ConnectionHandle {
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Queue a request and wait for its reply
    pub async fn submit(&self, request: Request) -> Result<Reply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((request, reply_tx))
            .await
            .map_err(|_| StreamlineError::ShuttingDown)?;
        reply_rx.await.map_err(|_| StreamlineError::ShuttingDown)
    }

    /// Close the connection and wait for its cleanup to finish
    pub async fn close(self) -> Result<()> {
        drop(self.tx);
        self.task
            .await
            .map_err(|e| StreamlineError::Internal(format!("connection worker failed: {}", e)))
    }
}
