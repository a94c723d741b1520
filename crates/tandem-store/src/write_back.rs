use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tracing::{debug, error};

use crate::config::WriteBackConfig;
use crate::error::StoreResult;

/// A deferred flush of committed state to a driver.
pub type FlushJob = Pin<Box<dyn Future<Output = StoreResult<()>> + Send + 'static>>;

/// Decouples committing a change in memory from persisting it.
///
/// In queued mode jobs run one at a time, in enqueue order, on a background
/// task. In pass-through mode `flush` runs the job inline and hands its result
/// back. `shutdown` switches a queued instance to pass-through for good after
/// the jobs already queued have run.
#[derive(Clone)]
pub struct WriteBack {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    sender: Mutex<Option<mpsc::UnboundedSender<FlushJob>>>,
    in_flight: Arc<watch::Sender<usize>>,
}

impl WriteBack {
    /// A write-back that runs every job inline.
    pub fn pass_through(name: impl Into<String>) -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                sender: Mutex::new(None),
                in_flight: Arc::new(in_flight),
            }),
        }
    }

    /// A write-back that runs jobs on a background task. Must be called
    /// inside a tokio runtime.
    pub fn queued(name: impl Into<String>) -> Self {
        let name = name.into();
        let (in_flight, _) = watch::channel(0usize);
        let in_flight = Arc::new(in_flight);
        let (tx, mut rx) = mpsc::unbounded_channel::<FlushJob>();
        let counter = Arc::clone(&in_flight);
        let task_name = name.clone();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if let Err(e) = job.await {
                    error!(write_back = %task_name, error = %e, "queued flush failed");
                }
                counter.send_modify(|n| *n = n.saturating_sub(1));
            }
            debug!(write_back = %task_name, "write-back consumer finished");
        });
        Self {
            inner: Arc::new(Inner {
                name,
                sender: Mutex::new(Some(tx)),
                in_flight,
            }),
        }
    }

    /// Queued when `protocol` is configured for buffering, pass-through otherwise.
    pub fn for_protocol(config: &WriteBackConfig, protocol: &str) -> Self {
        if config.is_queued(protocol) {
            Self::queued(protocol)
        } else {
            Self::pass_through(protocol)
        }
    }

    pub fn is_queued(&self) -> bool {
        self.inner.sender.lock().expect("write-back lock poisoned").is_some()
    }

    /// Run `job` now (pass-through) or enqueue it (queued). Only pass-through
    /// runs report the job's error; queued failures are logged.
    pub async fn flush(&self, job: FlushJob) -> StoreResult<()> {
        let job = {
            let sender = self.inner.sender.lock().expect("write-back lock poisoned");
            match sender.as_ref() {
                Some(tx) => {
                    self.inner.in_flight.send_modify(|n| *n += 1);
                    match tx.send(job) {
                        Ok(()) => return Ok(()),
                        Err(mpsc::error::SendError(job)) => {
                            self.inner.in_flight.send_modify(|n| *n = n.saturating_sub(1));
                            job
                        }
                    }
                }
                None => job,
            }
        };
        job.await
    }

    pub fn is_idle(&self) -> bool {
        *self.inner.in_flight.borrow() == 0
    }

    /// Wait until no queued job is pending or running.
    pub async fn await_idle(&self) {
        let mut rx = self.inner.in_flight.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Stop queueing. Jobs already queued still run; later jobs run inline.
    pub async fn shutdown(&self) {
        let sender = self.inner.sender.lock().expect("write-back lock poisoned").take();
        if sender.is_some() {
            debug!(write_back = %self.inner.name, "switching write-back to pass-through");
        }
        drop(sender);
        self.await_idle().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn recording_job(log: &Arc<Mutex<Vec<u32>>>, n: u32) -> FlushJob {
        let log = Arc::clone(log);
        Box::pin(async move {
            log.lock().unwrap().push(n);
            Ok(())
        })
    }

    #[tokio::test]
    async fn pass_through_runs_inline() {
        let write_back = WriteBack::pass_through("volatile");
        let log = Arc::new(Mutex::new(Vec::new()));
        write_back.flush(recording_job(&log, 1)).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec![1]);
        assert!(write_back.is_idle());
        assert!(!write_back.is_queued());
    }

    #[tokio::test]
    async fn queued_jobs_run_in_order() {
        let write_back = WriteBack::queued("db");
        let log = Arc::new(Mutex::new(Vec::new()));
        for n in 0..20 {
            write_back.flush(recording_job(&log, n)).await.unwrap();
        }
        write_back.await_idle().await;
        assert_eq!(*log.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn idle_waits_for_running_job() {
        let write_back = WriteBack::queued("db");
        let gate = Arc::new(Notify::new());
        let released = Arc::clone(&gate);
        write_back
            .flush(Box::pin(async move {
                released.notified().await;
                Ok(())
            }))
            .await
            .unwrap();
        assert!(!write_back.is_idle());
        let wait = tokio::time::timeout(Duration::from_millis(20), write_back.await_idle()).await;
        assert!(wait.is_err());
        gate.notify_one();
        tokio::time::timeout(Duration::from_secs(5), write_back.await_idle())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_drains_then_runs_inline() {
        let write_back = WriteBack::queued("db");
        let log = Arc::new(Mutex::new(Vec::new()));
        write_back.flush(recording_job(&log, 1)).await.unwrap();
        write_back.shutdown().await;
        assert_eq!(*log.lock().unwrap(), vec![1]);
        assert!(!write_back.is_queued());
        write_back.flush(recording_job(&log, 2)).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn protocol_selects_mode() {
        let config = WriteBackConfig::default();
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            assert!(WriteBack::for_protocol(&config, "db").is_queued());
            assert!(!WriteBack::for_protocol(&config, "volatile").is_queued());
        });
    }
}
