//! Message routing and the sharded worker pool.
//!
//! [`MsgHandler`] owns the message-id routing table and a fixed set of worker
//! tasks, each draining its own bounded queue. Requests are sharded by
//! `conn_id % worker_pool_size`, so every request from one connection lands on
//! the same worker and is handled in arrival order, while different shards run
//! in parallel.

use crate::error::ServerError;
use crate::message::Request;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Type-erased async message handler.
pub type RouterHandler = Arc<dyn Fn(Request) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wraps an async closure into a [`RouterHandler`].
pub fn router_fn<F, Fut>(handler: F) -> RouterHandler
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |request: Request| handler(request).boxed())
}

/// Routing table plus worker pool.
pub struct MsgHandler {
    /// Handlers keyed by message id
    apis: DashMap<u32, RouterHandler>,

    /// Fallback for ids without a dedicated handler
    default_router: RwLock<Option<RouterHandler>>,

    /// Number of worker shards
    worker_pool_size: u32,

    /// Capacity of each worker queue
    max_worker_task_len: u32,

    /// One sender per running worker, indexed by shard
    task_queues: RwLock<Vec<mpsc::Sender<Request>>>,

    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl MsgHandler {
    pub fn new(worker_pool_size: u32, max_worker_task_len: u32) -> Self {
        Self {
            apis: DashMap::new(),
            default_router: RwLock::new(None),
            worker_pool_size,
            max_worker_task_len,
            task_queues: RwLock::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn worker_pool_size(&self) -> u32 {
        self.worker_pool_size
    }

    /// Registers the handler for `msg_id`.
    ///
    /// Registering the same id twice is a setup bug and is rejected with
    /// [`ServerError::DuplicateRouter`].
    pub fn add_router<F, Fut>(&self, msg_id: u32, handler: F) -> Result<(), ServerError>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add_router_handler(msg_id, router_fn(handler))
    }

    /// Registers an already type-erased handler.
    pub fn add_router_handler(&self, msg_id: u32, handler: RouterHandler) -> Result<(), ServerError> {
        match self.apis.entry(msg_id) {
            Entry::Occupied(_) => {
                error!(msg_id, "Repeated router registration");
                Err(ServerError::DuplicateRouter(msg_id))
            }
            Entry::Vacant(slot) => {
                slot.insert(handler);
                debug!(msg_id, "Router added");
                Ok(())
            }
        }
    }

    /// Installs the fallback handler, replacing any previous one.
    pub fn set_default_router<F, Fut>(&self, handler: F)
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *self
            .default_router
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(router_fn(handler));
    }

    pub fn has_router(&self, msg_id: u32) -> bool {
        self.apis.contains_key(&msg_id)
    }

    pub fn is_running(&self) -> bool {
        !self
            .task_queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Spawns one worker task and queue per shard. Calling it on a running
    /// pool is a no-op.
    pub fn start_worker_pool(self: &Arc<Self>) {
        let mut queues = self
            .task_queues
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if !queues.is_empty() {
            warn!("Worker pool already running");
            return;
        }

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        for worker_id in 0..self.worker_pool_size {
            let (sender, receiver) = mpsc::channel(self.max_worker_task_len.max(1) as usize);
            queues.push(sender);

            let handler = Arc::clone(self);
            workers.push(tokio::spawn(async move {
                handler.run_worker(worker_id, receiver).await;
            }));
        }

        info!(
            workers = self.worker_pool_size,
            queue_capacity = self.max_worker_task_len,
            "Worker pool started"
        );
    }

    /// Closes every worker queue. Workers finish the requests already queued
    /// and then exit.
    pub fn stop_worker_pool(&self) {
        let queues = std::mem::take(
            &mut *self
                .task_queues
                .write()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));

        if !queues.is_empty() {
            info!(workers = workers.len(), "Worker pool stopping");
        }
    }

    async fn run_worker(&self, worker_id: u32, mut queue: mpsc::Receiver<Request>) {
        debug!(worker_id, "Worker started");
        while let Some(request) = queue.recv().await {
            self.do_msg_handler(request).await;
        }
        debug!(worker_id, "Worker exited");
    }

    /// Queues `request` on the worker owning its connection's shard.
    ///
    /// Waits while that worker's queue is full.
    ///
    /// # Arguments
    ///
    /// * `request` - Routed to worker `conn_id % worker_pool_size`, so every
    ///   request of one connection runs on the same worker in arrival order
    ///
    /// # Errors
    ///
    /// [`ServerError::WorkerPoolNotRunning`] if the pool was never started or
    /// has been stopped.
    pub async fn send_msg_to_task_queue(&self, request: Request) -> Result<(), ServerError> {
        let sender = {
            let queues = self
                .task_queues
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if queues.is_empty() {
                return Err(ServerError::WorkerPoolNotRunning);
            }
            let worker_id = request.connection().conn_id() % queues.len() as u32;
            queues[worker_id as usize].clone()
        };

        sender
            .send(request)
            .await
            .map_err(|_| ServerError::WorkerPoolNotRunning)
    }

    /// Runs the handler registered for the request's message id.
    ///
    /// Unknown ids go to the default router when one is set and are otherwise
    /// logged and dropped. A panicking handler is logged and does not take the
    /// calling worker down.
    pub async fn do_msg_handler(&self, request: Request) {
        let msg_id = request.msg_id();
        let conn_id = request.connection().conn_id();

        let router = self
            .apis
            .get(&msg_id)
            .map(|entry| Arc::clone(entry.value()))
            .or_else(|| {
                self.default_router
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
            });

        let Some(router) = router else {
            error!(msg_id, conn_id, "No router for message id, dropping request");
            return;
        };

        let outcome = AssertUnwindSafe(async move { router(request).await })
            .catch_unwind()
            .await;
        if let Err(panic) = outcome {
            error!(
                msg_id,
                conn_id,
                "Router panicked: {}",
                panic_message(panic.as_ref())
            );
        }
    }
}

impl std::fmt::Debug for MsgHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgHandler")
            .field("routes", &self.apis.len())
            .field("worker_pool_size", &self.worker_pool_size)
            .field("max_worker_task_len", &self.max_worker_task_len)
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::test_utils::TestConnections;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc::unbounded_channel;
    use tokio::time::timeout;

    #[test]
    fn test_duplicate_router_is_rejected() {
        let handler = MsgHandler::new(2, 8);
        handler.add_router(1, |_req| async {}).unwrap();

        let err = handler.add_router(1, |_req| async {}).unwrap_err();
        assert!(matches!(err, ServerError::DuplicateRouter(1)));
        assert!(handler.has_router(1));
        assert!(!handler.has_router(2));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_id_uses_default_router() {
        let fixture = TestConnections::new().await;
        let conn = fixture.connection(3).await;

        let handler = MsgHandler::new(0, 0);
        let (tx, mut rx) = unbounded_channel();
        handler.set_default_router(move |req| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(req.msg_id());
            }
        });

        handler
            .do_msg_handler(Request::new(conn, Message::new(404, 0, 0, vec![])))
            .await;
        assert_eq!(rx.recv().await, Some(404));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_id_without_default_is_dropped() {
        let fixture = TestConnections::new().await;
        let conn = fixture.connection(1).await;

        let handler = MsgHandler::new(0, 0);
        // Must return without panicking
        handler
            .do_msg_handler(Request::new(conn, Message::new(5, 0, 0, vec![])))
            .await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_panicking_router_keeps_worker_alive() {
        let fixture = TestConnections::new().await;
        let conn = fixture.connection(1).await;

        let handler = Arc::new(MsgHandler::new(1, 8));
        let (tx, mut rx) = unbounded_channel();
        handler
            .add_router(1, |req| async move {
                if req.msg_id() == 1 {
                    panic!("handler failure");
                }
            })
            .unwrap();
        handler
            .add_router(2, move |req| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(req.serial());
                }
            })
            .unwrap();
        handler.start_worker_pool();

        handler
            .send_msg_to_task_queue(Request::new(conn.clone(), Message::new(1, 1, 0, vec![])))
            .await
            .unwrap();
        handler
            .send_msg_to_task_queue(Request::new(conn, Message::new(2, 2, 0, vec![])))
            .await
            .unwrap();

        let serial = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(serial, Some(2));
        handler.stop_worker_pool();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_submit_without_pool_fails() {
        let fixture = TestConnections::new().await;
        let conn = fixture.connection(1).await;

        let handler = MsgHandler::new(2, 8);
        let result = handler
            .send_msg_to_task_queue(Request::new(conn, Message::new(1, 0, 0, vec![])))
            .await;
        assert!(matches!(result, Err(ServerError::WorkerPoolNotRunning)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_same_shard_never_runs_concurrently() {
        let fixture = TestConnections::new().await;
        // 1 and 3 share shard 1 of 2; 2 owns shard 0
        let conns = vec![
            fixture.connection(1).await,
            fixture.connection(3).await,
            fixture.connection(2).await,
        ];

        let active = Arc::new([AtomicUsize::new(0), AtomicUsize::new(0)]);
        let overlaps = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        let handler = Arc::new(MsgHandler::new(2, 64));
        {
            let active = active.clone();
            let overlaps = overlaps.clone();
            let done = done.clone();
            handler
                .add_router(1, move |req| {
                    let active = active.clone();
                    let overlaps = overlaps.clone();
                    let done = done.clone();
                    async move {
                        let shard = (req.connection().conn_id() % 2) as usize;
                        if active[shard].fetch_add(1, Ordering::SeqCst) > 0 {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        active[shard].fetch_sub(1, Ordering::SeqCst);
                        done.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .unwrap();
        }
        handler.start_worker_pool();

        let mut submitters = Vec::new();
        for conn in conns {
            let handler = handler.clone();
            submitters.push(tokio::spawn(async move {
                for serial in 0..10 {
                    handler
                        .send_msg_to_task_queue(Request::new(
                            conn.clone(),
                            Message::new(1, serial, 0, vec![]),
                        ))
                        .await
                        .unwrap();
                }
            }));
        }
        for submitter in submitters {
            submitter.await.unwrap();
        }

        timeout(Duration::from_secs(5), async {
            while done.load(Ordering::SeqCst) < 30 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        handler.stop_worker_pool();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_per_connection_order_preserved() {
        let fixture = TestConnections::new().await;
        let conn = fixture.connection(7).await;

        let handler = Arc::new(MsgHandler::new(4, 16));
        let (tx, mut rx) = unbounded_channel();
        handler
            .add_router(1, move |req| {
                let tx = tx.clone();
                async move {
                    // Later requests sleep less; ordering must still hold
                    tokio::time::sleep(Duration::from_millis(u64::from(20 - req.serial()))).await;
                    let _ = tx.send(req.serial());
                }
            })
            .unwrap();
        handler.start_worker_pool();

        for serial in 0..20 {
            handler
                .send_msg_to_task_queue(Request::new(conn.clone(), Message::new(1, serial, 0, vec![])))
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        while seen.len() < 20 {
            let serial = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
            seen.push(serial);
        }
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
        handler.stop_worker_pool();
    }
}
