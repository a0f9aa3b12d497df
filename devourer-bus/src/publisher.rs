use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error};
use miette::Diagnostic;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::Envelope;

/// How long a drain worker waits on the handle queue before rechecking.
const POP_WAIT: Duration = Duration::from_millis(200);

/// Upper bound on submitted-but-unobserved publishes.
const QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Error, Diagnostic)]
#[error(transparent)]
pub struct TransportError(#[from] pub Box<dyn std::error::Error + Send + Sync + 'static>);

/// The downstream bus: one topic, fire-and-observe byte payloads.
#[async_trait]
pub trait BusTransport: Send + Sync + 'static {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;
}

/// Stand-in transport for local runs; deployments inject the real client.
pub struct LogTransport;

#[async_trait]
impl BusTransport for LogTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        debug!("publish to `{topic}`: {} bytes", payload.len());
        Ok(())
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum PublishError {
    #[error("publisher is closed")]
    Closed,

    #[error("could not serialize envelope")]
    Serialize(#[from] serde_json::Error),
}

type PublishHandle = JoinHandle<Result<(), TransportError>>;

struct Shared {
    in_flight: AtomicUsize,
    drained: Notify,
}

/// Serializes envelopes and submits them to the bus without ordering
/// guarantees. Submissions run concurrently; a small worker pool observes
/// their results, logging failures and moving on (at-least-once delivery,
/// reconciled downstream by envelope identity).
pub struct Publisher {
    topic: String,
    transport: Arc<dyn BusTransport>,
    shared: Arc<Shared>,
    tx: Mutex<Option<mpsc::Sender<PublishHandle>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Publisher {
    pub fn new(topic: &str, transport: Arc<dyn BusTransport>) -> Publisher {
        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get() / 2)
            .unwrap_or(0)
            .max(2);
        Publisher::with_workers(topic, transport, worker_count)
    }

    pub fn with_workers(
        topic: &str,
        transport: Arc<dyn BusTransport>,
        worker_count: usize,
    ) -> Publisher {
        let shared = Arc::new(Shared {
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
        });
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let workers = (0..worker_count)
            .map(|id| {
                let rx = rx.clone();
                let shared = shared.clone();
                tokio::spawn(drain_worker(id, rx, shared))
            })
            .collect();

        Publisher {
            topic: topic.to_owned(),
            transport,
            shared,
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    /// Submits one envelope. Blocks only when the in-flight queue is full.
    pub async fn publish(&self, envelope: &Envelope) -> Result<(), PublishError> {
        let payload = envelope.encode()?;
        let tx = self
            .tx
            .lock()
            .expect("publisher mutex poisoned")
            .clone()
            .ok_or(PublishError::Closed)?;

        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
        let transport = self.transport.clone();
        let topic = self.topic.clone();
        let handle = tokio::spawn(async move { transport.publish(&topic, payload).await });

        if tx.send(handle).await.is_err() {
            // Workers are gone; nobody will observe the handle.
            self.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
            return Err(PublishError::Closed);
        }
        Ok(())
    }

    /// Blocks until every previously submitted publish has terminated,
    /// successfully or not.
    pub async fn wait(&self) {
        loop {
            let drained = self.shared.drained.notified();
            if self.shared.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            drained.await;
        }
    }

    /// Stops intake and drains the queue to quiescence. Idempotent;
    /// `publish` fails with `Closed` afterwards.
    pub async fn close(&self) {
        self.tx.lock().expect("publisher mutex poisoned").take();
        self.wait().await;
        let workers: Vec<_> = self
            .workers
            .lock()
            .expect("publisher mutex poisoned")
            .drain(..)
            .collect();
        for worker in workers {
            if let Err(err) = worker.await {
                error!("publisher worker exited abnormally: {err}");
            }
        }
    }
}

async fn drain_worker(
    id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<PublishHandle>>>,
    shared: Arc<Shared>,
) {
    loop {
        let handle = {
            let mut rx = rx.lock().await;
            match timeout(POP_WAIT, rx.recv()).await {
                Ok(Some(handle)) => handle,
                Ok(None) => break,
                Err(_) => continue,
            }
        };

        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!("bus publish failed: {err}"),
            Err(err) => error!("publish task panicked: {err}"),
        }

        if shared.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            shared.drained.notify_waiters();
        }
    }
    debug!("publisher worker {id} drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Meta;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    struct RecordingTransport {
        sent: StdMutex<Vec<(String, Vec<u8>)>>,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl BusTransport for RecordingTransport {
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push((topic.to_owned(), payload));
            Ok(())
        }
    }

    struct FailingTransport;

    #[async_trait]
    impl BusTransport for FailingTransport {
        async fn publish(&self, _topic: &str, _payload: Vec<u8>) -> Result<(), TransportError> {
            Err(TransportError("bus unavailable".to_string().into()))
        }
    }

    fn envelope(n: i64) -> Envelope {
        Envelope::new(Meta::new("c", "vetsuccess", "clients"), json!({"id": n}))
    }

    #[tokio::test]
    async fn publishes_reach_the_transport() {
        let transport = RecordingTransport::new();
        let publisher = Publisher::with_workers("ingest", transport.clone(), 2);

        for n in 0..3 {
            publisher.publish(&envelope(n)).await.unwrap();
        }
        publisher.wait().await;

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|(topic, _)| topic == "ingest"));
        let parsed: Envelope = serde_json::from_slice(&sent[0].1).unwrap();
        assert_eq!(parsed.meta.data_source, "vetsuccess");
    }

    #[tokio::test]
    async fn failures_are_absorbed_and_drained() {
        let publisher = Publisher::with_workers("ingest", Arc::new(FailingTransport), 2);
        for n in 0..5 {
            publisher.publish(&envelope(n)).await.unwrap();
        }
        // Must not hang even though every publish failed.
        timeout(Duration::from_secs(5), publisher.wait())
            .await
            .expect("wait should drain failed publishes");
        publisher.close().await;
    }

    #[tokio::test]
    async fn publish_after_close_is_refused() {
        let transport = RecordingTransport::new();
        let publisher = Publisher::with_workers("ingest", transport, 2);
        publisher.close().await;
        assert!(matches!(
            publisher.publish(&envelope(1)).await,
            Err(PublishError::Closed)
        ));
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_idle() {
        let publisher = Publisher::with_workers("ingest", RecordingTransport::new(), 2);
        timeout(Duration::from_millis(500), publisher.wait())
            .await
            .expect("idle wait must not block");
        publisher.close().await;
    }
}
