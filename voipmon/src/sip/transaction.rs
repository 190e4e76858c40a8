//! SIP transaction aggregation.
//!
//! One worker per shard topic joins request/response pairs into
//! transactions and terminates them on a final response or by timer. The
//! worker owns its transaction map; expiry runs on the same task, so the
//! map needs no lock. Within a shard, transactions are emitted in the order
//! they terminate.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use tracing::{debug, warn};

use super::SipEvent;
use super::message::SipMessage;
use crate::bus::{Bus, Event, Subscription};
use crate::config::SipTransactionConfig;
use crate::metric::{self, Tags};
use crate::packet::{Address, AttrValue, Attributes};
use crate::storage::Sink;
use crate::udf::UdfDispatcher;

/// Transaction identity: dialog, command sequence and the per-hop branch of
/// the topmost Via. Requests and responses carry the same fields, so both
/// sides of an exchange derive the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TsxKey {
    pub call_id: String,
    pub cseq_num: u32,
    pub cseq_method: String,
    pub branch: String,
}

impl TsxKey {
    pub fn from_message(message: &SipMessage) -> Option<Self> {
        let call_id = message.call_id()?.to_string();
        let cseq = message.cseq()?;
        let branch = message.top_via_branch().unwrap_or_default().to_string();
        Some(Self {
            call_id,
            cseq_num: cseq.num,
            cseq_method: cseq.method,
            branch,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Trying,
    Proceeding,
    Succeed,
    Failed,
    Redirected,
    Canceled,
    Unauthorized,
}

impl TransactionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Trying => "trying",
            TransactionState::Proceeding => "proceeding",
            TransactionState::Succeed => "succeed",
            TransactionState::Failed => "failed",
            TransactionState::Redirected => "redirected",
            TransactionState::Canceled => "canceled",
            TransactionState::Unauthorized => "unauthorized",
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, TransactionState::Trying | TransactionState::Proceeding)
    }

    fn from_status(code: u16) -> Self {
        match code {
            100..=199 => TransactionState::Proceeding,
            200..=299 => TransactionState::Succeed,
            300..=399 => TransactionState::Redirected,
            401 | 407 => TransactionState::Unauthorized,
            487 => TransactionState::Canceled,
            _ => TransactionState::Failed,
        }
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request/response exchange under aggregation.
///
/// Holds at most one request and one response; a provisional response is
/// replaced when the final one arrives. `terminated_at` is set only by a
/// final response or by timer expiry.
#[derive(Debug)]
pub struct SipTransaction {
    pub call_id: String,
    pub cseq_num: u32,
    pub cseq_method: String,
    pub branch: String,
    pub src_addr: Address,
    pub dst_addr: Address,
    pub request: Option<Arc<SipEvent>>,
    pub response: Option<Arc<SipEvent>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub terminated_at: Option<DateTime<Utc>>,
    /// First 18x response timestamp, kept for dialog-level ringing state.
    pub ringing_at: Option<DateTime<Utc>>,
    pub state: TransactionState,
    pub attributes: Attributes,
}

impl SipTransaction {
    fn new(key: &TsxKey, event: &SipEvent) -> Self {
        Self {
            call_id: key.call_id.clone(),
            cseq_num: key.cseq_num,
            cseq_method: key.cseq_method.clone(),
            branch: key.branch.clone(),
            src_addr: event.packet.src_addr.clone(),
            dst_addr: event.packet.dst_addr.clone(),
            request: None,
            response: None,
            created_at: event.packet.created_at,
            updated_at: event.packet.created_at,
            terminated_at: None,
            ringing_at: None,
            state: TransactionState::Trying,
            attributes: Attributes::new(),
        }
    }

    fn attach(&mut self, event: Arc<SipEvent>) {
        self.updated_at = event.packet.created_at;
        if event.message.is_request() {
            if self.request.is_none() {
                self.src_addr = event.packet.src_addr.clone();
                self.dst_addr = event.packet.dst_addr.clone();
                self.request = Some(event);
            }
            return;
        }

        let Some(code) = event.message.status_code() else {
            return;
        };
        let final_attached = self
            .response
            .as_ref()
            .and_then(|response| response.message.status_code())
            .is_some_and(|existing| existing >= 200);
        if final_attached {
            // At most one final response per transaction.
            return;
        }

        if (180..200).contains(&code) && self.ringing_at.is_none() {
            self.ringing_at = Some(event.packet.created_at);
        }
        self.state = TransactionState::from_status(code);
        if code >= 200 {
            self.terminated_at = Some(event.packet.created_at);
        }
        self.response = Some(event);
    }

    pub fn response_code(&self) -> Option<u16> {
        self.response
            .as_ref()
            .and_then(|response| response.message.status_code())
    }

    fn message(&self) -> Option<&SipMessage> {
        self.request
            .as_ref()
            .or(self.response.as_ref())
            .map(|event| &event.message)
    }

    pub fn caller(&self) -> Option<&str> {
        self.message().and_then(|message| message.from_uri())
    }

    pub fn callee(&self) -> Option<&str> {
        self.message().and_then(|message| message.to_uri())
    }

    pub fn from_tag(&self) -> Option<&str> {
        self.message().and_then(|message| message.from_tag())
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.response
            .as_ref()
            .and_then(|event| event.message.to_tag())
            .or_else(|| self.message().and_then(|message| message.to_tag()))
    }

    pub fn duration_millis(&self) -> Option<i64> {
        self.terminated_at
            .map(|terminated| (terminated - self.created_at).num_milliseconds())
    }

    /// Flat view handed to the transaction UDF.
    fn udf_payload(&self) -> Attributes {
        let mut payload = Attributes::new();
        payload.insert("call_id".into(), self.call_id.as_str().into());
        payload.insert("method".into(), self.cseq_method.as_str().into());
        payload.insert("state".into(), self.state.as_str().into());
        payload.insert(
            "created_at".into(),
            AttrValue::Number(self.created_at.timestamp_millis() as f64),
        );
        payload.insert("src_addr".into(), self.src_addr.to_string().into());
        payload.insert("dst_addr".into(), self.dst_addr.to_string().into());
        if let Some(host) = &self.src_addr.host {
            payload.insert("src_host".into(), host.as_str().into());
        }
        if let Some(host) = &self.dst_addr.host {
            payload.insert("dst_host".into(), host.as_str().into());
        }
        if let Some(caller) = self.caller() {
            payload.insert("caller".into(), caller.into());
        }
        if let Some(callee) = self.callee() {
            payload.insert("callee".into(), callee.into());
        }
        payload
    }

    /// Index document written on termination.
    pub fn document(&self) -> serde_json::Value {
        json!({
            "created_at": self.created_at.timestamp_millis(),
            "terminated_at": self.terminated_at.map(|at| at.timestamp_millis()),
            "duration": self.duration_millis(),
            "src_addr": self.src_addr.addr.to_string(),
            "src_port": self.src_addr.port,
            "src_host": &self.src_addr.host,
            "dst_addr": self.dst_addr.addr.to_string(),
            "dst_port": self.dst_addr.port,
            "dst_host": &self.dst_addr.host,
            "call_id": &self.call_id,
            "method": &self.cseq_method,
            "cseq_num": self.cseq_num,
            "branch": &self.branch,
            "state": self.state.as_str(),
            "response_code": self.response_code(),
            "caller": self.caller(),
            "callee": self.callee(),
            "attributes": &self.attributes,
        })
    }
}

/// Shard worker joining SIP messages into transactions.
pub struct SipTransactionWorker {
    prefix: &'static str,
    shard: usize,
    bus: Bus,
    sink: Sink,
    udf: UdfDispatcher,
    subscription: Subscription,
    transactions: HashMap<TsxKey, SipTransaction>,
    config: SipTransactionConfig,
}

impl SipTransactionWorker {
    pub fn new(
        bus: &Bus,
        sink: Sink,
        udf: UdfDispatcher,
        prefix: &'static str,
        shard: usize,
        config: &SipTransactionConfig,
    ) -> Self {
        Self {
            prefix,
            shard,
            bus: bus.clone(),
            sink,
            udf,
            subscription: bus.subscribe(format!("{prefix}_{shard}")),
            transactions: HashMap::new(),
            config: config.clone(),
        }
    }

    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(self.config.expiration_delay());
        loop {
            tokio::select! {
                message = self.subscription.recv() => match message {
                    Some(message) => {
                        if let Event::Sip(event) = message.event {
                            if let Some(transaction) = self.on_event(event) {
                                self.terminate(transaction).await;
                            }
                        }
                    }
                    None => break,
                },
                _ = tick.tick() => self.expire().await,
            }
        }
    }

    /// Attaches the message to its transaction; returns the transaction
    /// once a final response has terminated it.
    fn on_event(&mut self, event: Arc<SipEvent>) -> Option<SipTransaction> {
        let key = match TsxKey::from_message(&event.message) {
            Some(key) => key,
            None => {
                warn!(prefix = self.prefix, "SIP event without transaction identity");
                return None;
            }
        };

        let transaction = self
            .transactions
            .entry(key.clone())
            .or_insert_with(|| SipTransaction::new(&key, &event));
        transaction.attach(event);

        if transaction.terminated_at.is_some() {
            return self.transactions.remove(&key);
        }
        None
    }

    /// Timer-driven safety net: terminates transactions that never saw a
    /// final response.
    async fn expire(&mut self) {
        let now = Utc::now();
        let timeout = ChronoDuration::from_std(self.config.termination_timeout())
            .unwrap_or_else(|_| ChronoDuration::milliseconds(i64::MAX / 2));

        let mut expired: Vec<TsxKey> = self
            .transactions
            .iter()
            .filter(|(_, transaction)| transaction.updated_at + timeout < now)
            .map(|(key, _)| key.clone())
            .collect();
        // Emission order equals termination order.
        expired.sort_by_key(|key| self.transactions[key].updated_at);

        for key in expired {
            let mut transaction = self.transactions.remove(&key).expect("expired key");
            transaction.terminated_at = Some(transaction.updated_at + timeout);
            if !transaction.state.is_final() {
                transaction.state = TransactionState::Failed;
            }
            debug!(
                call_id = %transaction.call_id,
                method = %transaction.cseq_method,
                "transaction expired without final response"
            );
            self.terminate(transaction).await;
        }
    }

    async fn terminate(&mut self, mut transaction: SipTransaction) {
        let endpoint = format!("{}_transaction_udf", self.prefix);
        let reply = self.udf.execute(&endpoint, transaction.udf_payload()).await;
        if !reply.accepted {
            debug!(
                call_id = %transaction.call_id,
                endpoint,
                "transaction discarded by UDF"
            );
            return;
        }
        transaction.attributes.extend(reply.attributes);

        metric::counter(
            format!("{}_transactions", self.prefix),
            &Tags::new().with("state", transaction.state.as_str()),
        );

        self.sink.store(
            &format!("{}_index{}", self.prefix, self.shard),
            transaction.created_at,
            transaction.document(),
        );

        let transaction = Arc::new(transaction);
        self.bus.send(
            &format!("{}_transaction", self.prefix),
            Event::Transaction(transaction),
        );
    }
}
