use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

use super::{Error, WorkItem};

struct Job {
    item: WorkItem,
    done: Sender<WorkItem>,
}

/// A worker thread executing committed batches FIFO.
///
/// Backends hand accepted [`WorkItem`]s to the queue together with the
/// caller's completion channel; the worker runs the executor over each
/// item in submission order, stores any failure in the item and delivers
/// it on the channel.
#[derive(Debug)]
pub struct WorkQueue {
    jobs: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl WorkQueue {
    pub fn new<E>(mut executor: E) -> Self
    where
        E: FnMut(&mut WorkItem) -> Result<(), Error> + Send + 'static,
    {
        let (jobs, rx) = mpsc::channel::<Job>();

        let worker = thread::spawn(move || {
            while let Ok(mut job) = rx.recv() {
                job.item.err = executor(&mut job.item).err();

                for cb in &mut job.item.work {
                    cb.mark_complete();
                }

                // A dropped receiver means the caller does not care about
                // the result.
                let _ = job.done.send(job.item);
            }
        });

        Self {
            jobs: Some(jobs),
            worker: Some(worker),
        }
    }

    /// Accepts a batch for execution.
    ///
    /// Marks every command buffer in the batch pending and returns
    /// immediately; completion is signaled through `done`.
    ///
    /// Panics if any buffer in the batch is not executable.
    pub fn submit(&self, mut item: WorkItem, done: Sender<WorkItem>) -> Result<(), Error> {
        for cb in &mut item.work {
            cb.mark_pending();
        }

        self.jobs
            .as_ref()
            .unwrap()
            .send(Job { item, done })
            .map_err(|_| Error::Fatal)
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        // Closing the channel stops the worker after it drains the queue.
        drop(self.jobs.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use crate::driver::soft::SoftDriver;
    use crate::driver::{Driver, Error, WorkItem};

    use super::WorkQueue;

    #[test]
    fn work_queue_completes_in_order() {
        let gpu = SoftDriver::new().open().unwrap();
        let queue = WorkQueue::new(|_| Ok(()));

        let (tx, rx) = mpsc::channel();
        for _ in 0..4 {
            let mut cb = gpu.new_cmd_buffer().unwrap();
            cb.begin().unwrap();
            cb.end().unwrap();

            queue
                .submit(
                    WorkItem {
                        work: vec![cb],
                        err: None,
                    },
                    tx.clone(),
                )
                .unwrap();
        }

        for _ in 0..4 {
            let item = rx.recv().unwrap();
            assert!(item.err.is_none());
            assert_eq!(item.work.len(), 1);
            assert_eq!(item.work[0].state(), crate::driver::State::Initial);
        }
    }

    #[test]
    fn work_queue_propagates_error() {
        let gpu = SoftDriver::new().open().unwrap();
        let queue = WorkQueue::new(|_| Err(Error::NoDeviceMemory));

        let mut cb = gpu.new_cmd_buffer().unwrap();
        cb.begin().unwrap();
        cb.end().unwrap();

        let (tx, rx) = mpsc::channel();
        queue
            .submit(
                WorkItem {
                    work: vec![cb],
                    err: None,
                },
                tx,
            )
            .unwrap();

        let item = rx.recv().unwrap();
        assert_eq!(item.err, Some(Error::NoDeviceMemory));
    }
}
