//! Application executor.
//!
//! Handler code is allowed to block, so it never runs on the I/O workers.
//! A small pool of named threads drains a crossbeam channel; the bounded
//! variant rejects at enqueue time, which the dispatch path reports as
//! 503 with `rejected_due_to_overload`.

use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::debug;

use crate::config::HandlerQueue;
use crate::error::Error;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

enum Queue {
    Channel(Sender<Job>),
    /// Test-only: run jobs on the calling thread.
    Inline,
}

/// Cheap handle for submitting work to the pool.
#[derive(Clone)]
pub struct ExecHandle {
    queue: std::sync::Arc<Queue>,
    bounded: bool,
}

impl ExecHandle {
    /// Submit a job. Fails with [`Error::RejectedOverload`] when a bounded
    /// queue is full.
    pub(crate) fn submit(&self, job: Job) -> Result<(), Error> {
        match &*self.queue {
            Queue::Inline => {
                job();
                Ok(())
            }
            Queue::Channel(tx) => {
                if self.bounded {
                    match tx.try_send(job) {
                        Ok(()) => Ok(()),
                        Err(TrySendError::Full(_)) => Err(Error::RejectedOverload),
                        Err(TrySendError::Disconnected(_)) => {
                            Err(Error::Internal("handler pool stopped".into()))
                        }
                    }
                } else {
                    tx.send(job)
                        .map_err(|_| Error::Internal("handler pool stopped".into()))
                }
            }
        }
    }

    /// An executor that runs jobs inline, for unit tests.
    #[doc(hidden)]
    pub fn inline_for_tests() -> Self {
        Self {
            queue: std::sync::Arc::new(Queue::Inline),
            bounded: false,
        }
    }
}

/// Thread pool running handler jobs.
pub(crate) struct HandlerPool {
    handle: ExecHandle,
    workers: Vec<thread::JoinHandle<()>>,
}

impl HandlerPool {
    pub fn start(threads: usize, queue: HandlerQueue) -> Self {
        let (tx, rx, bounded) = match queue {
            HandlerQueue::Unbounded => {
                let (tx, rx) = crossbeam_channel::unbounded::<Job>();
                (tx, rx, false)
            }
            HandlerQueue::Bounded(cap) => {
                let (tx, rx) = crossbeam_channel::bounded::<Job>(cap);
                (tx, rx, true)
            }
        };

        let workers = (0..threads)
            .map(|i| {
                let rx: Receiver<Job> = rx.clone();
                thread::Builder::new()
                    .name(format!("portside-handler-{i}"))
                    .spawn(move || {
                        crate::counter::set_thread_shard(i);
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                        debug!(worker = i, "handler worker stopped");
                    })
                    .expect("spawn handler worker")
            })
            .collect();

        Self {
            handle: ExecHandle {
                queue: std::sync::Arc::new(Queue::Channel(tx)),
                bounded,
            },
            workers,
        }
    }

    pub fn handle(&self) -> ExecHandle {
        self.handle.clone()
    }

    /// Release the pool's own sender. Workers exit once every outstanding
    /// [`ExecHandle`] clone is gone; they are not joined, because a leaked
    /// async handle elsewhere must not wedge server shutdown.
    pub fn shutdown(self) {
        drop(self.handle);
        drop(self.workers);
    }
}
