//! Datagram ingestion: a bounded queue drained by worker tasks, with an
//! in-flight counter the refresh scheduler watches.

use std::pin::pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::CommendableApi;

/// Largest datagram the receiver reads; longer payloads are truncated.
pub const MAX_DATAGRAM_SIZE: usize = 8192;

/// Count of accepted payloads that have not finished applying.
#[derive(Debug, Default)]
pub struct Backlog {
    in_flight: AtomicUsize,
    idle: Notify,
}

impl Backlog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    /// Saturates at zero. Wakes idle waiters on the transition to zero.
    pub fn decrement(&self) {
        let previous =
            self.in_flight.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if previous == Ok(1) {
            self.idle.notify_waiters();
        }
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Resolve once the counter reads zero.
    pub async fn wait_idle(&self) {
        loop {
            let mut notified = pin!(self.idle.notified());
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Bounded, ordered work queue in front of the mutation applier.
#[derive(Clone)]
pub struct Ingestor {
    api: CommendableApi,
    sender: mpsc::Sender<Vec<u8>>,
    receiver: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
}

impl Ingestor {
    #[must_use]
    pub fn new(api: CommendableApi) -> Self {
        let (sender, receiver) = mpsc::channel(api.config().queue_capacity.max(1));
        Self { api, sender, receiver: Arc::new(Mutex::new(receiver)) }
    }

    /// Queue one raw payload, waiting for capacity when the queue is full.
    ///
    /// # Errors
    /// Returns an error when the queue has been closed.
    pub async fn submit(&self, payload: Vec<u8>) -> Result<()> {
        let backlog = self.api.backlog();
        backlog.increment();
        if self.sender.send(payload).await.is_err() {
            backlog.decrement();
            return Err(anyhow!("ingestion queue is closed"));
        }
        Ok(())
    }

    /// Start `count` workers sharing the queue. Each applies payloads on a
    /// blocking thread and releases the backlog afterwards, whatever the
    /// outcome.
    #[must_use]
    pub fn spawn_workers(&self, count: usize) -> Vec<JoinHandle<()>> {
        (0..count.max(1))
            .map(|worker| {
                let ingestor = self.clone();
                tokio::spawn(async move { ingestor.drain(worker).await })
            })
            .collect()
    }

    async fn drain(self, worker: usize) {
        loop {
            let next = self.receiver.lock().await.recv().await;
            let Some(payload) = next else {
                tracing::debug!(worker, "ingestion queue closed");
                return;
            };

            let api = self.api.clone();
            match tokio::task::spawn_blocking(move || api.apply_message(&payload)).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    tracing::error!(worker, error = format!("{err:#}"), "mutation failed");
                }
                Err(err) => tracing::error!(worker, error = %err, "mutation task panicked"),
            }
            self.api.backlog().decrement();
        }
    }
}

/// Read datagrams from `socket` forever, queueing each payload.
///
/// # Errors
/// Returns an error when the ingestion queue closes.
pub async fn receive_datagrams(socket: UdpSocket, ingestor: Ingestor) -> Result<()> {
    let mut buffer = vec![0_u8; MAX_DATAGRAM_SIZE];
    loop {
        let (size, peer) = match socket.recv_from(&mut buffer).await {
            Ok(received) => received,
            Err(err) => {
                tracing::warn!(error = %err, "failed to receive datagram");
                continue;
            }
        };
        tracing::trace!(%peer, size, "received datagram");
        ingestor
            .submit(buffer[..size].to_vec())
            .await
            .context("failed to queue received datagram")?;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use commendable_core::{Event, MemoryStore};

    use super::*;
    use crate::EngineConfig;

    fn memory_api() -> CommendableApi {
        CommendableApi::new(Arc::new(MemoryStore::new()), EngineConfig::default())
    }

    fn like_payload(user: &str, object: &str) -> Vec<u8> {
        let event = Event::Like {
            user: user.to_string(),
            object: object.to_string(),
            weight: 1.0,
            dont_activate: false,
        };
        serde_json::to_vec(&event.to_message())
            .unwrap_or_else(|err| panic!("failed to encode fixture message: {err}"))
    }

    // Test IDs: TPIP-001
    #[tokio::test]
    async fn wait_idle_resolves_only_after_the_last_decrement() {
        let backlog = Arc::new(Backlog::new());
        backlog.increment();
        backlog.increment();

        let waiter = tokio::spawn({
            let backlog = Arc::clone(&backlog);
            async move { backlog.wait_idle().await }
        });
        backlog.decrement();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        backlog.decrement();
        backlog.decrement();
        if tokio::time::timeout(Duration::from_secs(2), waiter).await.is_err() {
            panic!("wait_idle did not resolve");
        }
        assert_eq!(backlog.in_flight(), 0);
    }

    // Test IDs: TPIP-002
    #[tokio::test]
    async fn workers_apply_valid_payloads_and_drop_malformed_ones() {
        let api = memory_api();
        let ingestor = Ingestor::new(api.clone());
        let _workers = ingestor.spawn_workers(2);

        for payload in [
            b"not json".to_vec(),
            br#"{"Type":"bogus","Object":"x"}"#.to_vec(),
            br#"{"Type":"like","Object":"x"}"#.to_vec(),
            like_payload("a", "x"),
            like_payload("a", "y"),
        ] {
            ingestor.submit(payload).await.unwrap_or_else(|err| panic!("submit failed: {err}"));
        }
        if tokio::time::timeout(Duration::from_secs(5), api.backlog().wait_idle()).await.is_err() {
            panic!("backlog never drained");
        }

        let likes = api.likes("a").unwrap_or_else(|err| panic!("likes failed: {err}"));
        assert_eq!(likes.len(), 2);
        assert_eq!(api.pending_changes().unwrap_or_else(|err| panic!("{err}")), 2);
    }

    // Test IDs: TPIP-003
    #[tokio::test]
    async fn datagrams_flow_from_socket_into_the_store() {
        let api = memory_api();
        let ingestor = Ingestor::new(api.clone());
        let _workers = ingestor.spawn_workers(1);

        let socket = UdpSocket::bind("127.0.0.1:0")
            .await
            .unwrap_or_else(|err| panic!("failed to bind receiver: {err}"));
        let address = socket.local_addr().unwrap_or_else(|err| panic!("no local addr: {err}"));
        tokio::spawn(receive_datagrams(socket, ingestor));

        let sender = UdpSocket::bind("127.0.0.1:0")
            .await
            .unwrap_or_else(|err| panic!("failed to bind sender: {err}"));
        sender
            .send_to(br#"{"Type":"view","User":"a","Object":"x"}"#, address)
            .await
            .unwrap_or_else(|err| panic!("failed to send datagram: {err}"));

        let observed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let views = api.views("a").unwrap_or_else(|err| panic!("views failed: {err}"));
                if !views.is_empty() {
                    return views;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("datagram was never applied"));
        assert_eq!(observed[0].object, "x");
    }

    // Test IDs: TPIP-004
    #[tokio::test]
    async fn full_queue_holds_submitters_without_dropping_work() {
        let config = EngineConfig { queue_capacity: 1, ..EngineConfig::default() };
        let api = CommendableApi::new(Arc::new(MemoryStore::new()), config);
        let ingestor = Ingestor::new(api.clone());

        ingestor
            .submit(like_payload("a", "x"))
            .await
            .unwrap_or_else(|err| panic!("first submit failed: {err}"));
        let blocked = tokio::spawn({
            let ingestor = ingestor.clone();
            async move { ingestor.submit(like_payload("a", "y")).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());
        assert_eq!(api.backlog().in_flight(), 2);

        let _workers = ingestor.spawn_workers(1);
        match tokio::time::timeout(Duration::from_secs(5), blocked).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => panic!("second submit failed: {err}"),
            Ok(Err(err)) => panic!("submit task panicked: {err}"),
            Err(elapsed) => panic!("second submit never got capacity: {elapsed}"),
        }
        if tokio::time::timeout(Duration::from_secs(5), api.backlog().wait_idle()).await.is_err() {
            panic!("backlog never drained");
        }
        let likes = api.likes("a").unwrap_or_else(|err| panic!("likes failed: {err}"));
        assert_eq!(likes.len(), 2);
    }
}
