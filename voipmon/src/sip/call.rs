//! SIP call aggregation.
//!
//! Joins terminated `sip_call` transactions into dialogs keyed by Call-ID.
//! Dialog-level aggregation runs on a single worker; per-call ordering is
//! preserved because every transaction of one call leaves the same
//! transaction shard.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use tracing::debug;

use super::transaction::{SipTransaction, TransactionState};
use crate::bus::{Bus, Event, Subscription};
use crate::config::SipCallConfig;
use crate::metric::{self, Tags};
use crate::packet::Attributes;
use crate::storage::Sink;

/// Topic carrying terminated call-pipeline transactions.
pub const CALL_TRANSACTION_TOPIC: &str = "sip_call_transaction";

/// Topic receiving terminated calls.
pub const CALL_TOPIC: &str = "call";

const CALLS_COLLECTION_PREFIX: &str = "sip_calls";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Trying,
    Ringing,
    Answered,
    Ended,
    Failed,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Trying => "trying",
            CallState::Ringing => "ringing",
            CallState::Answered => "answered",
            CallState::Ended => "ended",
            CallState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended | CallState::Failed)
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dialog under aggregation: the ordered transactions of one Call-ID.
#[derive(Debug)]
pub struct SipCall {
    pub call_id: String,
    /// Distinct `(from-tag, to-tag)` pairs seen on this dialog.
    pub legs: BTreeSet<(String, String)>,
    pub transactions: Vec<Arc<SipTransaction>>,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub attributes: Attributes,
}

impl SipCall {
    fn new(transaction: &SipTransaction) -> Self {
        Self {
            call_id: transaction.call_id.clone(),
            legs: BTreeSet::new(),
            transactions: Vec::new(),
            state: CallState::Trying,
            created_at: transaction.created_at,
            updated_at: transaction.updated_at,
            answered_at: None,
            terminated_at: None,
            attributes: Attributes::new(),
        }
    }

    fn attach(&mut self, transaction: Arc<SipTransaction>) {
        self.updated_at = self.updated_at.max(transaction.updated_at);

        let from_tag = transaction.from_tag().unwrap_or_default().to_string();
        let to_tag = transaction.to_tag().unwrap_or_default().to_string();
        if !from_tag.is_empty() || !to_tag.is_empty() {
            self.legs.insert((from_tag, to_tag));
        }

        match transaction.cseq_method.as_str() {
            "INVITE" => self.on_invite(&transaction),
            "BYE" => {
                self.state = CallState::Ended;
                self.terminated_at = transaction.terminated_at;
            }
            _ => {}
        }

        self.transactions.push(transaction);
    }

    fn on_invite(&mut self, transaction: &SipTransaction) {
        if self.state == CallState::Trying && transaction.ringing_at.is_some() {
            self.state = CallState::Ringing;
        }
        match transaction.state {
            TransactionState::Succeed => {
                if self.answered_at.is_none() {
                    self.state = CallState::Answered;
                    self.answered_at = transaction.terminated_at;
                }
            }
            state if state.is_final() => {
                // A failed re-INVITE does not end an answered call.
                if !matches!(self.state, CallState::Answered | CallState::Ended) {
                    self.state = CallState::Failed;
                    self.terminated_at = transaction.terminated_at;
                }
            }
            _ => {}
        }
    }

    /// Talk time, answer to hangup.
    pub fn duration_millis(&self) -> Option<i64> {
        match (self.answered_at, self.terminated_at) {
            (Some(answered), Some(terminated)) => Some((terminated - answered).num_milliseconds()),
            _ => None,
        }
    }

    /// Time from the initial INVITE to the answer.
    pub fn setup_time_millis(&self) -> Option<i64> {
        self.answered_at
            .map(|answered| (answered - self.created_at).num_milliseconds())
    }

    pub fn document(&self) -> serde_json::Value {
        let first = self.transactions.first();
        json!({
            "created_at": self.created_at.timestamp_millis(),
            "answered_at": self.answered_at.map(|at| at.timestamp_millis()),
            "terminated_at": self.terminated_at.map(|at| at.timestamp_millis()),
            "duration": self.duration_millis(),
            "setup_time": self.setup_time_millis(),
            "call_id": &self.call_id,
            "state": self.state.as_str(),
            "caller": first.and_then(|tsx| tsx.caller()),
            "callee": first.and_then(|tsx| tsx.callee()),
            "src_addr": first.map(|tsx| tsx.src_addr.addr.to_string()),
            "dst_addr": first.map(|tsx| tsx.dst_addr.addr.to_string()),
            "legs": self.legs.len(),
            "transactions": self.transactions.len(),
            "attributes": &self.attributes,
        })
    }
}

/// Worker joining transactions into calls.
pub struct SipCallWorker {
    bus: Bus,
    sink: Sink,
    subscription: Subscription,
    calls: HashMap<String, SipCall>,
    config: SipCallConfig,
}

impl SipCallWorker {
    pub fn new(bus: &Bus, sink: Sink, config: &SipCallConfig) -> Self {
        Self {
            bus: bus.clone(),
            sink,
            subscription: bus.subscribe(CALL_TRANSACTION_TOPIC),
            calls: HashMap::new(),
            config: config.clone(),
        }
    }

    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(self.config.expiration_delay());
        loop {
            tokio::select! {
                message = self.subscription.recv() => match message {
                    Some(message) => {
                        if let Event::Transaction(transaction) = message.event {
                            if let Some(call) = self.on_transaction(transaction) {
                                self.terminate(call);
                            }
                        }
                    }
                    None => break,
                },
                _ = tick.tick() => self.expire(),
            }
        }
    }

    fn on_transaction(&mut self, transaction: Arc<SipTransaction>) -> Option<SipCall> {
        let call_id = transaction.call_id.clone();
        let call = self
            .calls
            .entry(call_id.clone())
            .or_insert_with(|| SipCall::new(&transaction));
        call.attach(transaction);

        if call.terminated_at.is_some() {
            return self.calls.remove(&call_id);
        }
        None
    }

    fn expire(&mut self) {
        let now = Utc::now();
        let timeout = ChronoDuration::from_std(self.config.aggregation_timeout())
            .unwrap_or_else(|_| ChronoDuration::milliseconds(i64::MAX / 2));

        let mut expired: Vec<String> = self
            .calls
            .iter()
            .filter(|(_, call)| call.updated_at + timeout < now)
            .map(|(call_id, _)| call_id.clone())
            .collect();
        expired.sort_by_key(|call_id| self.calls[call_id].updated_at);

        for call_id in expired {
            let mut call = self.calls.remove(&call_id).expect("expired key");
            call.terminated_at = Some(call.updated_at + timeout);
            if !call.state.is_terminal() {
                call.state = CallState::Failed;
            }
            debug!(call_id = %call.call_id, "call expired without termination");
            self.terminate(call);
        }
    }

    fn terminate(&mut self, call: SipCall) {
        metric::counter("sip_calls", &Tags::new().with("state", call.state.as_str()));
        if let Some(duration) = call.duration_millis() {
            metric::timer("sip_call_duration", &Tags::new(), duration as f64);
        }

        self.sink
            .store(CALLS_COLLECTION_PREFIX, call.created_at, call.document());
        self.bus.send(CALL_TOPIC, Event::Call(Arc::new(call)));
    }
}
