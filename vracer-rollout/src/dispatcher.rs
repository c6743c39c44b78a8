//! Worker dispatch abstraction.
//!
//! [`SampleDispatcher`] hides how rollout tasks execute: on the calling
//! thread, on a thread pool, or on remote ranks behind some cluster
//! transport. The coordinator only ever submits tasks and broadcasts
//! policy snapshots, so the implementations are interchangeable.
use anyhow::Result;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::error;
use std::{
    sync::{Arc, Mutex},
    thread::JoinHandle,
};
use vracer_core::{PolicySnapshot, VracerError};

/// Handle to a submitted task's eventual result.
pub struct TaskFuture<R> {
    rx: Receiver<Result<R>>,
}

impl<R> TaskFuture<R> {
    /// Blocks until the task finished.
    pub fn wait(self) -> Result<R> {
        self.rx
            .recv()
            .map_err(|_| VracerError::Rollout {
                env_id: 0,
                msg: "task dropped before completion".into(),
            })?
    }

    /// Returns the result if the task already finished.
    pub fn try_take(&self) -> Option<Result<R>> {
        self.rx.try_recv().ok()
    }
}

/// Dispatches rollout tasks and distributes policy snapshots.
pub trait SampleDispatcher<T, R> {
    /// Submits a task, returning a handle to its result.
    fn submit(&mut self, task: T) -> Result<TaskFuture<R>>;

    /// Distributes a policy snapshot to the workers.
    fn broadcast(&mut self, snapshot: &PolicySnapshot) -> Result<()>;

    /// Stops accepting tasks and tears the workers down.
    fn shutdown(&mut self);
}

/// Runs every task immediately on the calling thread.
///
/// The runner and the broadcast hook share state freely with the caller
/// (no `Send` requirement), which keeps single-process rollouts
/// deterministic.
pub struct SerialDispatcher<T, R> {
    runner: Box<dyn FnMut(T) -> Result<R>>,
    on_broadcast: Box<dyn FnMut(&PolicySnapshot)>,
}

impl<T, R> SerialDispatcher<T, R> {
    /// Creates a dispatcher from a task runner and a broadcast hook.
    pub fn new(
        runner: impl FnMut(T) -> Result<R> + 'static,
        on_broadcast: impl FnMut(&PolicySnapshot) + 'static,
    ) -> Self {
        Self {
            runner: Box::new(runner),
            on_broadcast: Box::new(on_broadcast),
        }
    }
}

impl<T, R> SampleDispatcher<T, R> for SerialDispatcher<T, R> {
    fn submit(&mut self, task: T) -> Result<TaskFuture<R>> {
        let (tx, rx) = bounded(1);
        let result = (self.runner)(task);
        let _ = tx.send(result);
        Ok(TaskFuture { rx })
    }

    fn broadcast(&mut self, snapshot: &PolicySnapshot) -> Result<()> {
        (self.on_broadcast)(snapshot);
        Ok(())
    }

    fn shutdown(&mut self) {}
}

/// Runs tasks on a pool of worker threads.
///
/// Each thread builds its own runner once (environments and channels live
/// in the runner closure) and drains the shared task queue. Broadcast
/// snapshots are kept in a shared cell the runners can read between tasks.
pub struct ThreadPoolDispatcher<T, R> {
    tasks: Option<Sender<(T, Sender<Result<R>>)>>,
    handles: Vec<JoinHandle<()>>,
    snapshot: Arc<Mutex<Option<PolicySnapshot>>>,
}

impl<T, R> ThreadPoolDispatcher<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Spawns `n_threads` workers. `factory` runs once on each new thread
    /// and produces that thread's task runner; it receives the thread index
    /// and the shared snapshot cell.
    pub fn build<F, W>(n_threads: usize, factory: F) -> Self
    where
        F: Fn(usize, Arc<Mutex<Option<PolicySnapshot>>>) -> Result<W> + Send + Sync + 'static,
        W: FnMut(T) -> Result<R> + 'static,
    {
        let (task_tx, task_rx) = unbounded::<(T, Sender<Result<R>>)>();
        let snapshot = Arc::new(Mutex::new(None));
        let factory = Arc::new(factory);

        let handles = (0..n_threads)
            .map(|thread_idx| {
                let task_rx = task_rx.clone();
                let factory = factory.clone();
                let snapshot = snapshot.clone();
                std::thread::spawn(move || {
                    let mut runner = match factory(thread_idx, snapshot) {
                        Ok(runner) => runner,
                        Err(e) => {
                            error!("worker {} failed to start: {}", thread_idx, e);
                            return;
                        }
                    };
                    while let Ok((task, reply)) = task_rx.recv() {
                        let _ = reply.send(runner(task));
                    }
                })
            })
            .collect();

        Self {
            tasks: Some(task_tx),
            handles,
            snapshot,
        }
    }
}

impl<T, R> SampleDispatcher<T, R> for ThreadPoolDispatcher<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    fn submit(&mut self, task: T) -> Result<TaskFuture<R>> {
        let (tx, rx) = bounded(1);
        self.tasks
            .as_ref()
            .ok_or_else(|| VracerError::Rollout {
                env_id: 0,
                msg: "dispatcher is shut down".into(),
            })?
            .send((task, tx))
            .map_err(|_| VracerError::Rollout {
                env_id: 0,
                msg: "worker threads are gone".into(),
            })?;
        Ok(TaskFuture { rx })
    }

    fn broadcast(&mut self, snapshot: &PolicySnapshot) -> Result<()> {
        *self.snapshot.lock().unwrap() = Some(snapshot.clone());
        Ok(())
    }

    fn shutdown(&mut self) {
        self.tasks = None;
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl<T, R> Drop for ThreadPoolDispatcher<T, R> {
    fn drop(&mut self) {
        self.tasks = None;
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
