use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use log::{debug, warn};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// A stateful resource that handles one input at a time.
///
/// Returning an error tells the queue the worker state can no longer be
/// trusted; it is torn down and replaced before the next task runs.
pub trait Worker: Send + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    fn handle(&mut self, input: Self::Input) -> impl Future<Output = Result<Self::Output>> + Send;
}

/// Per-task settings
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    /// Longest the worker may spend on the task; unbounded when unset
    pub timeout: Option<Duration>,
}

/// Why a task settled without a result
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The task ran past its timeout
    #[error("Timeout")]
    Timeout,
    /// The worker returned an error
    #[error("{0}")]
    Worker(String),
    /// The worker's task exited before answering
    #[error("Worker crashed")]
    Crashed,
    #[error("Task queue closed")]
    Closed,
}

struct Task<W: Worker> {
    input: W::Input,
    options: TaskOptions,
    result: oneshot::Sender<Result<W::Output, QueueError>>,
}

type Reply<W> = oneshot::Sender<Result<<W as Worker>::Output>>;

/// A worker running in its own task
struct WorkerHandle<W: Worker> {
    inputs: mpsc::UnboundedSender<(W::Input, Reply<W>)>,
    join: JoinHandle<()>,
}

impl<W: Worker> WorkerHandle<W> {
    fn spawn(mut worker: W) -> Self {
        let (inputs, mut rx) = mpsc::unbounded_channel::<(W::Input, Reply<W>)>();
        let join = tokio::spawn(async move {
            while let Some((input, reply)) = rx.recv().await {
                let output = worker.handle(input).await;
                // The dispatcher may have given up on this reply already
                let _ = reply.send(output);
            }
        });
        Self { inputs, join }
    }

    async fn run(&self, input: W::Input, timeout: Option<Duration>) -> Result<W::Output, QueueError> {
        let (reply, response) = oneshot::channel();
        self.inputs
            .send((input, reply))
            .map_err(|_| QueueError::Crashed)?;

        let received = match timeout {
            Some(limit) => tokio::time::timeout(limit, response)
                .await
                .map_err(|_| QueueError::Timeout)?,
            None => response.await,
        };

        match received {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(QueueError::Worker(format!("{:#}", e))),
            Err(_) => Err(QueueError::Crashed),
        }
    }

    fn destroy(self) {
        self.join.abort();
    }
}

/// FIFO dispatcher in front of a single worker.
///
/// At most one task is in flight against the worker. A failed or timed out
/// task destroys the worker, and a fresh one from the factory serves the next
/// task. Every pushed task settles exactly once.
pub struct WorkerTaskQueue<W: Worker> {
    tasks: mpsc::UnboundedSender<Task<W>>,
    recreated: Arc<AtomicUsize>,
    dispatcher: JoinHandle<()>,
}

impl<W: Worker> WorkerTaskQueue<W> {
    /// Start the dispatcher. `factory` builds the first worker right away and
    /// each replacement after a failure.
    pub fn new<F>(factory: F) -> Self
    where
        F: FnMut() -> W + Send + 'static,
    {
        let (tasks, rx) = mpsc::unbounded_channel();
        let recreated = Arc::new(AtomicUsize::new(0));
        let dispatcher = tokio::spawn(dispatch(factory, rx, recreated.clone()));
        Self {
            tasks,
            recreated,
            dispatcher,
        }
    }

    /// Queue `input` behind every earlier push and wait for its result
    pub async fn push(&self, input: W::Input, options: TaskOptions) -> Result<W::Output, QueueError> {
        let (result, settled) = oneshot::channel();
        self.tasks
            .send(Task {
                input,
                options,
                result,
            })
            .map_err(|_| QueueError::Closed)?;
        settled.await.unwrap_or(Err(QueueError::Closed))
    }

    /// Number of times the worker has been replaced after a failure
    pub fn recreate_count(&self) -> usize {
        self.recreated.load(Ordering::SeqCst)
    }

    /// Finish every queued task, then destroy the worker
    pub async fn shutdown(self) {
        drop(self.tasks);
        if let Err(e) = self.dispatcher.await {
            warn!("Task queue dispatcher ended abnormally: {}", e);
        }
    }
}

async fn dispatch<W, F>(
    mut factory: F,
    mut tasks: mpsc::UnboundedReceiver<Task<W>>,
    recreated: Arc<AtomicUsize>,
) where
    W: Worker,
    F: FnMut() -> W + Send + 'static,
{
    let mut worker = WorkerHandle::spawn(factory());

    while let Some(task) = tasks.recv().await {
        let outcome = worker.run(task.input, task.options.timeout).await;

        if let Err(e) = &outcome {
            warn!("Worker failed ({}), recreating", e);
            worker.destroy();
            worker = WorkerHandle::spawn(factory());
            recreated.fetch_add(1, Ordering::SeqCst);
        }

        if task.result.send(outcome).is_err() {
            debug!("Task settled after its caller went away");
        }
    }

    worker.destroy();
}
