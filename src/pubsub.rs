//! Invoice update fan-out.
//!
//! Processors publish every invoice post-image onto one fan-in channel; a
//! single dispatcher task delivers each update to all subscribers. Each
//! delivery is bounded by a send timeout, and a subscriber that cannot be
//! delivered to in time is evicted so it can never stall the pipeline.
//! Deliveries for one update are joined before the next update is taken,
//! which keeps every subscriber's view of a given invoice in status order.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use indexmap::IndexMap;
use log::{debug, warn};
use thiserror::Error;
use tokio::{
    select,
    sync::{
        mpsc::{channel, error::TryRecvError, Receiver, Sender},
        watch,
    },
    task::JoinHandle,
    time::error::Elapsed,
};
use uuid::Uuid;

use crate::invoice::Invoice;

/// Max size of a subscriber's backlog before sends start blocking.
const SUBSCRIPTION_BUFFER_LEN: usize = 8;

/// A means of receiving invoice updates, returned by
/// [`PaymentGateway::subscribe`](crate::PaymentGateway::subscribe).
pub struct Subscriber(Receiver<Invoice>);

impl Subscriber {
    fn new(receiver: Receiver<Invoice>) -> Subscriber {
        Subscriber(receiver)
    }

    /// Waits for an invoice update.
    ///
    /// Returns `None` if the subscriber was evicted or the gateway shut
    /// down.
    pub async fn recv(&mut self) -> Option<Invoice> {
        self.0.recv().await
    }

    /// Attempts to retrieve an invoice update without blocking.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no update, or if the channel is closed.
    pub fn try_recv(&mut self) -> Result<Invoice, SubscriberError> {
        Ok(self.0.try_recv()?)
    }

    /// Waits for an invoice update, giving up after `timeout`.
    ///
    /// Returns `None` if the channel is closed.
    ///
    /// # Errors
    ///
    /// Returns an error if no update is received in time.
    pub async fn recv_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Invoice>, SubscriberError> {
        Ok(tokio::time::timeout(timeout, self.0.recv()).await?)
    }
}

/// Fan-out dispatcher state: the registry of active subscribers.
pub(crate) struct Publisher {
    subscribers: Mutex<IndexMap<Uuid, Sender<Invoice>>>,
    send_timeout: Duration,
}

impl Publisher {
    pub(crate) fn new(send_timeout: Duration) -> Publisher {
        Publisher {
            subscribers: Mutex::new(IndexMap::new()),
            send_timeout,
        }
    }

    /// Register a new subscriber for all invoice updates.
    pub(crate) fn subscribe(&self) -> Subscriber {
        let (tx, rx) = channel(SUBSCRIPTION_BUFFER_LEN);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(Uuid::new_v4(), tx);
        Subscriber::new(rx)
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver one update to every subscriber, evicting the ones that time
    /// out or hung up.
    pub(crate) async fn dispatch(&self, invoice: &Invoice) {
        let targets: Vec<(Uuid, Sender<Invoice>)> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut deliveries = Vec::with_capacity(targets.len());
        for (id, tx) in targets {
            let update = invoice.clone();
            let timeout = self.send_timeout;
            deliveries.push((
                id,
                tokio::spawn(async move { tx.send_timeout(update, timeout).await.is_err() }),
            ));
        }

        for (id, delivery) in deliveries {
            if delivery.await.unwrap_or(true) {
                warn!("Subscriber {id} did not accept an update within the send timeout; evicting");
                self.subscribers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .shift_remove(&id);
            }
        }
    }

    /// Spawn the dispatcher task over the fan-in channel. Runs until the
    /// channel closes or `shutdown` flips.
    pub(crate) fn spawn(
        self: &Arc<Self>,
        mut events: Receiver<Invoice>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let publisher = self.clone();
        tokio::spawn(async move {
            loop {
                select! {
                    _ = shutdown.changed() => break,
                    event = events.recv() => match event {
                        Some(invoice) => {
                            debug!("Invoice {} changed status to {}", invoice.id, invoice.status);
                            publisher.dispatch(&invoice).await;
                        }
                        None => break,
                    },
                }
            }
            debug!("Invoice dispatcher stopped");
        })
    }
}

/// An error receiving from a [`Subscriber`].
#[derive(Error, Debug)]
pub enum SubscriberError {
    /// Timed out before receiving an update.
    #[error("subscriber timed out before receiving update: {0}")]
    RecvTimeout(#[from] Elapsed),
    /// No update available.
    #[error("failed to retrieve update: {0}")]
    TryRecv(#[from] TryRecvError),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use chrono::Utc;
    use tokio::sync::{mpsc, watch};
    use uuid::Uuid;

    use super::Publisher;
    use crate::{
        coin::CoinType,
        invoice::{Invoice, InvoiceStatus},
    };

    fn update(status: InvoiceStatus) -> Invoice {
        let now = Utc::now();
        Invoice {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            coin: CoinType::Btc,
            crypto_address: "bc1qtest".to_string(),
            required_amount: 1.0,
            actual_amount: None,
            confirmations_required: 1,
            status,
            created_at: now,
            confirmed_at: None,
            expires_at: now + Duration::from_secs(60),
            tx_id: None,
        }
    }

    #[tokio::test]
    async fn delivers_to_all_subscribers() {
        let publisher = Arc::new(Publisher::new(Duration::from_millis(200)));
        let mut a = publisher.subscribe();
        let mut b = publisher.subscribe();

        publisher.dispatch(&update(InvoiceStatus::Pending)).await;

        assert_eq!(a.try_recv().unwrap().status, InvoiceStatus::Pending);
        assert_eq!(b.try_recv().unwrap().status, InvoiceStatus::Pending);
    }

    #[tokio::test]
    async fn evicts_slow_subscriber_and_keeps_the_rest() {
        let publisher = Arc::new(Publisher::new(Duration::from_millis(100)));
        let mut healthy_a = publisher.subscribe();
        // Never read from this one.
        let _slow = publisher.subscribe();
        let mut healthy_b = publisher.subscribe();
        assert_eq!(publisher.subscriber_count(), 3);

        // Fill the slow subscriber's buffer, then push the undeliverable
        // update that triggers eviction.
        for _ in 0..=super::SUBSCRIPTION_BUFFER_LEN {
            publisher.dispatch(&update(InvoiceStatus::Pending)).await;
            while healthy_a.try_recv().is_ok() {}
            while healthy_b.try_recv().is_ok() {}
        }
        assert_eq!(publisher.subscriber_count(), 2);

        // The survivors still receive updates.
        publisher.dispatch(&update(InvoiceStatus::Confirmed)).await;
        assert_eq!(healthy_a.try_recv().unwrap().status, InvoiceStatus::Confirmed);
        assert_eq!(healthy_b.try_recv().unwrap().status, InvoiceStatus::Confirmed);
    }

    #[tokio::test]
    async fn dropped_subscriber_is_evicted() {
        let publisher = Arc::new(Publisher::new(Duration::from_millis(100)));
        let subscriber = publisher.subscribe();
        drop(subscriber);

        publisher.dispatch(&update(InvoiceStatus::Pending)).await;
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn dispatcher_task_forwards_fan_in() {
        let publisher = Arc::new(Publisher::new(Duration::from_millis(200)));
        let (events_tx, events_rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = publisher.spawn(events_rx, shutdown_rx);

        let mut subscriber = publisher.subscribe();
        events_tx.send(update(InvoiceStatus::PendingMempool)).await.unwrap();

        let received = subscriber
            .recv_timeout(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.status, InvoiceStatus::PendingMempool);

        drop(events_tx);
        handle.await.unwrap();
    }
}
