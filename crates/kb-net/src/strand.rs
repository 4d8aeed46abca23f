//! `Strand`: FIFO task ordering on top of a shared multi-threaded executor
//! (spec §4.4).
//!
//! A `Strand` is not its own thread or runtime. It is a single-consumer
//! queue drained by one task at a time on the ambient `tokio` executor, so
//! handlers posted through it run strictly in posting order even though
//! many strands share the same worker pool.

use std::future::Future;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

/// Number of queued tasks a strand will run back-to-back before yielding
/// the worker thread, so one busy strand cannot starve its siblings
/// (mirrors the original's `maxInARow` bound).
const DEFAULT_MAX_IN_A_ROW: usize = 8;

type BoxedTask = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// A FIFO ordering primitive. Cloning a `Strand` shares the same queue and
/// drainer, matching the original's single-strand-many-posters usage.
#[derive(Clone)]
pub struct Strand {
    sender: mpsc::UnboundedSender<BoxedTask>,
}

impl Strand {
    /// Spawn the drainer onto `handle` and return a handle to post work to
    /// it. The drainer keeps running — and keeps draining already-accepted
    /// tasks to completion — even after every `Strand` clone is dropped,
    /// since dropping a `JoinHandle` does not abort the spawned task.
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self::with_max_in_a_row(handle, DEFAULT_MAX_IN_A_ROW)
    }

    pub fn with_max_in_a_row(handle: tokio::runtime::Handle, max_in_a_row: usize) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<BoxedTask>();
        handle.spawn(async move {
            let mut run = 0usize;
            while let Some(task) = receiver.recv().await {
                task().await;
                run += 1;
                if run >= max_in_a_row {
                    run = 0;
                    tokio::task::yield_now().await;
                }
            }
        });
        Self { sender }
    }

    /// Enqueue `f` to run after every task already posted to this strand.
    /// A task accepted here (the send succeeds) is guaranteed to run to
    /// completion even if every `Strand` handle is dropped immediately
    /// after this call returns.
    pub fn post<F, Fut>(&self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: BoxedTask = Box::new(move || Box::pin(f()));
        // The drainer only stops once every sender (including this one) is
        // gone, so a send failure here would mean the runtime itself is
        // shutting down; there is nothing useful left to do with the task.
        let _ = self.sender.send(boxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn tasks_run_in_posted_order() {
        let strand = Strand::new(tokio::runtime::Handle::current());
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let (done_tx, done_rx) = oneshot::channel();

        for i in 0..20 {
            let order = order.clone();
            let done_tx = if i == 19 { Some(done_tx) } else { None };
            strand.post(move || async move {
                order.lock().push(i);
                if let Some(tx) = done_tx {
                    let _ = tx.send(());
                }
            });
        }

        done_rx.await.unwrap();
        assert_eq!(*order.lock(), (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn posted_task_runs_even_after_strand_dropped() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = oneshot::channel();
        {
            let strand = Strand::new(tokio::runtime::Handle::current());
            let counter = counter.clone();
            strand.post(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = done_tx.send(());
            });
            // strand dropped here; the drainer keeps running.
        }
        done_rx.await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn yields_after_max_in_a_row() {
        let strand = Strand::with_max_in_a_row(tokio::runtime::Handle::current(), 2);
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let (done_tx, done_rx) = oneshot::channel();
        for i in 0..5 {
            let order = order.clone();
            let done_tx = if i == 4 { Some(done_tx) } else { None };
            strand.post(move || async move {
                order.lock().push(i);
                if let Some(tx) = done_tx {
                    let _ = tx.send(());
                }
            });
        }
        done_rx.await.unwrap();
        assert_eq!(*order.lock(), (0..5).collect::<Vec<_>>());
    }
}
