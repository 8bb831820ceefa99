use futures::future::BoxFuture;
use std::future::Future;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Runs submitted jobs one at a time, in submission order, on a task of its
/// own. The submitter never waits for a job to run.
///
/// Sessions keep one lane for voice commands and one for snapshot writes:
/// a `play` submitted after a `stop` can never overtake it, and a delete can
/// never land before an earlier save.
pub(crate) struct SerialLane {
    name: &'static str,
    jobs: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
}

impl SerialLane {
    pub fn spawn(name: &'static str) -> Self {
        let (jobs, mut rx) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
            debug!("{} lane closed", name);
        });
        Self { name, jobs }
    }

    pub fn submit<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.jobs.send(Box::pin(job)).is_err() {
            debug!("{} lane is gone, job dropped", self.name);
        }
    }

    /// Resolves once every job submitted so far has finished.
    pub async fn drain(&self) {
        let (done, finished) = oneshot::channel();
        self.submit(async move {
            let _ = done.send(());
        });
        let _ = finished.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::{sync::Arc, time::Duration};

    #[tokio::test]
    async fn slow_jobs_are_never_overtaken() {
        let lane = SerialLane::spawn("test");
        let order = Arc::new(Mutex::new(Vec::new()));

        for (label, delay) in [("slow", 40), ("fast", 0), ("faster", 0)] {
            let order = order.clone();
            lane.submit(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                order.lock().push(label);
            });
        }
        lane.drain().await;

        assert_eq!(*order.lock(), vec!["slow", "fast", "faster"]);
    }
}
