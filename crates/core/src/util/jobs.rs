use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};

use tokio::sync::{mpsc, oneshot};

type Job<T> = dyn FnOnce(&mut T) + Send;

/// Handle to a dedicated thread that owns a `T` and runs submitted jobs
/// against it one at a time, in submission order.
///
/// This is the single-threaded cooperative context of the state machine: the
/// thread exclusively owns its data, jobs never observe a partial mutation
/// from another job, and blocking work (snapshot serialization) is allowed.
///
/// The thread exits when every handle has been dropped.
pub struct JobThread<T> {
    tx: mpsc::Sender<Box<Job<T>>>,
}

impl<T> Clone for JobThread<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<T: Send + 'static> JobThread<T> {
    /// Spawn the thread, constructing its owned data on the thread itself.
    pub fn spawn(init: impl FnOnce() -> T + Send + 'static) -> Self {
        let (tx, mut rx) = mpsc::channel::<Box<Job<T>>>(8);
        std::thread::spawn(move || {
            let mut data = init();
            while let Some(job) = rx.blocking_recv() {
                job(&mut data);
            }
        });
        Self { tx }
    }

    /// Run `f` on the job thread and return its result.
    ///
    /// Panics in `f` are resumed on the caller.
    pub async fn run<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut T) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (ret_tx, ret_rx) = oneshot::channel();
        self.tx
            .send(Box::new(move |data| {
                let result = catch_unwind(AssertUnwindSafe(|| f(data)));
                if let Err(Err(_panic)) = ret_tx.send(result) {
                    log::warn!("uncaught panic on job thread");
                }
            }))
            .await
            .expect("job thread terminated unexpectedly");
        ret_rx
            .await
            .expect("job thread dropped a submitted job")
            .unwrap_or_else(|e| resume_unwind(e))
    }
}
