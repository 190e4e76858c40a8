//! In-process message bus.
//!
//! Topic-addressed mailboxes supporting broadcast (`publish`), round-robin
//! point-to-point delivery (`send`) and request/reply with a deadline
//! (`request`). Payloads are [`Event`] values carrying `Arc`-shared records;
//! cloning an event never copies record data.
//!
//! Every subscriber owns a bounded queue. When a queue is full or closed the
//! message is dropped and counted on the `bus_dropped` counter; delivery is
//! at-most-once on failure and exactly-once on success, FIFO per topic
//! queue.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::warn;

use crate::error::{Error, Result};
use crate::media::sdp::SdpSession;
use crate::media::session::RtprSession;
use crate::metric::{self, Tags};
use crate::packet::Packet;
use crate::sip::SipEvent;
use crate::sip::call::SipCall;
use crate::sip::transaction::SipTransaction;
use crate::storage::StoreRequest;
use crate::udf::{UdfCall, UdfReply};

/// Queue depth of a subscriber mailbox.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

const DROPPED_COUNTER: &str = "bus_dropped";

/// A record travelling over the bus.
#[derive(Debug, Clone)]
pub enum Event {
    /// A decoded packet from the capture front-end.
    Packet(Arc<Packet>),
    /// A packet paired with its parsed SIP message.
    Sip(Arc<SipEvent>),
    /// A terminated SIP transaction.
    Transaction(Arc<SipTransaction>),
    /// A terminated SIP call.
    Call(Arc<SipCall>),
    /// A terminated RTP report session.
    Media(Arc<RtprSession>),
    /// SDP session descriptions negotiated in signaling.
    SdpInfo(Arc<Vec<SdpSession>>),
    /// A document headed for the persistence writer.
    Store(Arc<StoreRequest>),
    /// A user-defined function invocation.
    Udf(Arc<UdfCall>),
}

/// Reply to a bus request.
#[derive(Debug)]
pub enum Reply {
    Udf(UdfReply),
}

/// A message delivered to a subscriber mailbox.
#[derive(Debug)]
pub struct BusMessage {
    pub event: Event,
    /// Present on requests; the handler answers through it.
    pub reply: Option<oneshot::Sender<Reply>>,
}

struct SubscriberSlot {
    id: u64,
    tx: mpsc::Sender<BusMessage>,
}

#[derive(Default)]
struct Topic {
    subscribers: Vec<SubscriberSlot>,
    next_id: u64,
    cursor: usize,
}

impl Topic {
    fn prune(&mut self) {
        self.subscribers.retain(|slot| !slot.tx.is_closed());
    }
}

/// A subscriber handle: the mailbox receiver plus the identity needed to
/// unsubscribe.
pub struct Subscription {
    topic: String,
    id: u64,
    receiver: mpsc::Receiver<BusMessage>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> std::result::Result<BusMessage, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }
}

#[derive(Default)]
struct Inner {
    topics: DashMap<String, Topic>,
}

/// The process-wide message bus. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct Bus(Arc<Inner>);

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a mailbox on `topic` with the default queue depth.
    pub fn subscribe(&self, topic: impl Into<String>) -> Subscription {
        self.subscribe_with_capacity(topic, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn subscribe_with_capacity(&self, topic: impl Into<String>, capacity: usize) -> Subscription {
        let topic = topic.into();
        let (tx, receiver) = mpsc::channel(capacity);
        let mut entry = self.0.topics.entry(topic.clone()).or_default();
        let id = entry.next_id;
        entry.next_id += 1;
        entry.subscribers.push(SubscriberSlot { id, tx });

        Subscription {
            topic,
            id,
            receiver,
        }
    }

    /// Removes one subscriber from `topic`. Dropping the [`Subscription`]
    /// receiver has the same effect lazily.
    pub fn unsubscribe(&self, topic: &str, id: u64) {
        if let Some(mut entry) = self.0.topics.get_mut(topic) {
            entry.subscribers.retain(|slot| slot.id != id);
        }
    }

    /// Topic names with at least one live subscriber.
    pub fn endpoints(&self) -> Vec<String> {
        let mut names = Vec::new();
        for mut entry in self.0.topics.iter_mut() {
            entry.prune();
            if !entry.subscribers.is_empty() {
                names.push(entry.key().clone());
            }
        }
        names
    }

    /// Broadcasts `event` to every subscriber of `topic`.
    pub fn publish(&self, topic: &str, event: Event) {
        let Some(mut entry) = self.0.topics.get_mut(topic) else {
            self.dropped(topic, "no subscriber");
            return;
        };
        entry.prune();
        if entry.subscribers.is_empty() {
            drop(entry);
            self.dropped(topic, "no subscriber");
            return;
        }
        for slot in &entry.subscribers {
            let message = BusMessage {
                event: event.clone(),
                reply: None,
            };
            if slot.tx.try_send(message).is_err() {
                self.dropped(topic, "queue full");
            }
        }
    }

    /// Delivers `event` to one subscriber of `topic`, chosen round-robin.
    pub fn send(&self, topic: &str, event: Event) {
        if self
            .deliver_one(
                topic,
                BusMessage {
                    event,
                    reply: None,
                },
            )
            .is_err()
        {
            self.dropped(topic, "no subscriber or queue full");
        }
    }

    /// Sends a request to one subscriber and awaits its reply.
    pub async fn request(&self, topic: &str, event: Event, deadline: Duration) -> Result<Reply> {
        let (tx, rx) = oneshot::channel();
        self.deliver_one(
            topic,
            BusMessage {
                event,
                reply: Some(tx),
            },
        )
        .map_err(|_| Error::NoSubscriber(topic.to_string()))?;

        match timeout(deadline, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::ChannelClosed(topic.to_string())),
            Err(_) => Err(Error::RequestTimeout(topic.to_string())),
        }
    }

    fn deliver_one(&self, topic: &str, message: BusMessage) -> std::result::Result<(), BusMessage> {
        let Some(mut entry) = self.0.topics.get_mut(topic) else {
            return Err(message);
        };
        entry.prune();
        if entry.subscribers.is_empty() {
            return Err(message);
        }

        // One round-robin pass over the mailboxes; the first one with free
        // capacity takes the message.
        let count = entry.subscribers.len();
        let start = entry.cursor;
        entry.cursor = (entry.cursor + 1) % count;
        let mut message = message;
        for offset in 0..count {
            let slot = &entry.subscribers[(start + offset) % count];
            match slot.tx.try_send(message) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::TrySendError::Full(returned))
                | Err(mpsc::error::TrySendError::Closed(returned)) => message = returned,
            }
        }
        Err(message)
    }

    fn dropped(&self, topic: &str, reason: &'static str) {
        warn!(topic, reason, "bus message dropped");
        metric::counter(DROPPED_COUNTER, &Tags::new().with("topic", topic.to_string()));
    }
}
