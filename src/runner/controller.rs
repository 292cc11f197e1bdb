use crate::runner::queue::WorkQueue;
use crate::runner::reconcile::SyncPass;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use std::sync::Arc;

/// Takes keys off the work queue of one syncer and runs a pass for each, with a bounded number
/// of passes at a time. The queue guarantees that a key is never in two passes at once.
pub(crate) struct Controller {
    name: String,
    pass: Arc<SyncPass>,
    queue: Arc<WorkQueue>,
    max_concurrent: usize,
    shutdown: CancellationToken,
}

impl Controller {
    pub(crate) fn new(
        name: impl Into<String>,
        pass: SyncPass,
        queue: Arc<WorkQueue>,
        max_concurrent: usize,
        shutdown: CancellationToken,
    ) -> Controller {
        Controller {
            name: name.into(),
            pass: Arc::new(pass),
            queue,
            max_concurrent: max_concurrent.max(1),
            shutdown,
        }
    }

    /// Runs until shutdown. Passes that are in flight at that point are allowed to finish before
    /// this returns, but no new ones are started.
    pub(crate) async fn run(self) {
        log::info!(
            "Starting controller for syncer '{}' with up to {} concurrent passes",
            self.name,
            self.max_concurrent
        );
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        loop {
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = self.shutdown.cancelled() => break,
            };
            let key = match self.queue.next().await {
                Some(key) => key,
                None => break,
            };
            let pass = self.pass.clone();
            let queue = self.queue.clone();
            tokio::spawn(async move {
                let outcome = pass.run(&key).await;
                queue.done(key, outcome);
                drop(permit);
            });
        }

        log::info!(
            "Controller for syncer '{}' is shutting down, waiting for in-flight passes",
            self.name
        );
        let _ = semaphore.acquire_many(self.max_concurrent as u32).await;
        log::info!("Controller for syncer '{}' stopped", self.name);
    }
}
