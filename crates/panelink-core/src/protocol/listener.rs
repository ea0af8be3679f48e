//! Event listeners
//!
//! A listener receives every message dispatched for the event it is
//! registered under. Two flavours exist:
//!
//! - [`OneShotListener`]: backs `request_with_result`; a single waiter picks
//!   up the latest reply.
//! - [`QueueListener`]: backs [`EventStream`]; every message is queued in
//!   arrival order until the consumer pulls it.

use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use super::message::Message;
use super::registry::ListenerRegistry;
use super::{ProtocolError, Result};

/// Receiver side of event dispatch
#[async_trait]
pub trait Listener: Send + Sync {
    /// Hand a dispatched message to the listener
    async fn deliver(&self, message: &Message) -> Result<()>;

    /// Stop the listener; pending waits end without a message
    async fn cancel(&self) -> Result<()>;
}

/// Holds the latest delivered message for one waiter at a time
#[derive(Default)]
pub struct OneShotListener {
    slot: Mutex<Option<Message>>,
    notify: Notify,
    waiter: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

impl OneShotListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the next delivery.
    ///
    /// A delivery that happened before the call is returned immediately.
    /// Fails with [`ProtocolError::Timeout`] once `timeout` elapses and with
    /// [`ProtocolError::Cancelled`] if the listener is cancelled first.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<Message> {
        let _waiter = self.waiter.lock().await;
        let notified = async {
            tokio::select! {
                biased;
                _ = self.notify.notified() => Ok(()),
                _ = self.cancel.cancelled() => Err(ProtocolError::Cancelled),
            }
        };
        match timeout {
            Some(t) => tokio::time::timeout(t, notified)
                .await
                .map_err(|_| ProtocolError::Timeout)??,
            None => notified.await?,
        }
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ProtocolError::Cancelled)
    }
}

#[async_trait]
impl Listener for OneShotListener {
    async fn deliver(&self, message: &Message) -> Result<()> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(message.clone());
        self.notify.notify_one();
        Ok(())
    }

    async fn cancel(&self) -> Result<()> {
        self.cancel.cancel();
        Ok(())
    }
}

/// Queues every delivered message for an [`EventStream`]
pub struct QueueListener {
    tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

impl QueueListener {
    /// Create a listener together with the receiving end of its queue
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }
}

#[async_trait]
impl Listener for QueueListener {
    async fn deliver(&self, message: &Message) -> Result<()> {
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            // A dropped receiver means the stream is already gone
            Some(tx) => tx.send(message.clone()).map_err(|_| ProtocolError::Cancelled),
            None => Err(ProtocolError::Cancelled),
        }
    }

    async fn cancel(&self) -> Result<()> {
        // Dropping the sender ends the stream once the queue drains
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        Ok(())
    }
}

/// Stream of messages for one event.
///
/// Each stream has its own listener and queue, so two streams for the same
/// event both see every message. The listener is deregistered when the
/// stream is dropped. After the connection closes the stream yields whatever
/// was already queued (including the `closed` notification) and then ends.
pub struct EventStream {
    event: String,
    listener: Arc<dyn Listener>,
    rx: mpsc::UnboundedReceiver<Message>,
    registry: Arc<ListenerRegistry>,
}

impl EventStream {
    pub(crate) fn subscribe(registry: Arc<ListenerRegistry>, event: &str) -> Self {
        let (listener, rx) = QueueListener::new();
        let listener: Arc<dyn Listener> = Arc::new(listener);
        registry.add_listener(event, listener.clone());
        Self {
            event: event.to_string(),
            listener,
            rx,
            registry,
        }
    }

    /// Event this stream is subscribed to
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Next message, or `None` once the listener has been cancelled
    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

impl Stream for EventStream {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.registry.remove_listener(&self.event, &self.listener);
    }
}
