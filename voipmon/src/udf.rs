//! User-defined function dispatcher.
//!
//! UDFs are ordinary bus subscribers on well-known topics
//! (`sip_invite_transaction_udf`, ...). The dispatcher keeps a periodic
//! snapshot of the registered endpoints; invoking an endpoint that is not in
//! the snapshot succeeds immediately as a no-op. A failing or timed-out UDF
//! also degrades to the no-op success: a UDF must never lose telemetry.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::time::interval;
use tracing::{debug, error, warn};

use crate::bus::{Bus, Event, Reply};
use crate::config::UdfConfig;
use crate::packet::{AttrValue, Attributes};

/// Invocation payload handed to a UDF: a flat view of the record under
/// judgment.
#[derive(Debug, Clone, Default)]
pub struct UdfCall {
    pub payload: Attributes,
}

/// UDF verdict: whether to keep the record, plus attributes to merge into
/// it.
#[derive(Debug, Default)]
pub struct UdfReply {
    pub accepted: bool,
    pub attributes: Attributes,
}

impl UdfReply {
    /// The no-op success every failure path collapses to.
    pub fn accepted_empty() -> Self {
        Self {
            accepted: true,
            attributes: Attributes::new(),
        }
    }
}

struct Inner {
    bus: Bus,
    endpoints: RwLock<HashSet<String>>,
    check_period: Duration,
    execution_timeout: Duration,
}

/// Cheap to clone; clones share the endpoint snapshot.
#[derive(Clone)]
pub struct UdfDispatcher(Arc<Inner>);

impl UdfDispatcher {
    pub fn new(bus: Bus, config: &UdfConfig) -> Self {
        let dispatcher = Self(Arc::new(Inner {
            bus,
            endpoints: RwLock::new(HashSet::new()),
            check_period: config.check_period(),
            execution_timeout: config.execution_timeout(),
        }));
        dispatcher.refresh();
        dispatcher
    }

    /// Spawns the periodic endpoint-snapshot refresh.
    pub fn start(&self) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let mut tick = interval(dispatcher.0.check_period);
            loop {
                tick.tick().await;
                dispatcher.refresh();
            }
        });
    }

    /// Re-reads the set of registered bus endpoints.
    pub fn refresh(&self) {
        let endpoints: HashSet<String> = self.0.bus.endpoints().into_iter().collect();
        debug!(count = endpoints.len(), "refreshed UDF endpoint snapshot");
        *self.0.endpoints.write().expect("endpoint lock") = endpoints;
    }

    fn knows(&self, endpoint: &str) -> bool {
        self.0
            .endpoints
            .read()
            .expect("endpoint lock")
            .contains(endpoint)
    }

    /// Invokes `endpoint` with `payload`.
    ///
    /// Returns the UDF verdict, or the no-op success when the endpoint is
    /// unregistered or misbehaves.
    pub async fn execute(&self, endpoint: &str, payload: Attributes) -> UdfReply {
        if !self.knows(endpoint) {
            return UdfReply::accepted_empty();
        }

        let call = Arc::new(UdfCall { payload });
        match self
            .0
            .bus
            .request(endpoint, Event::Udf(call), self.0.execution_timeout)
            .await
        {
            Ok(Reply::Udf(mut reply)) => {
                filter_attributes(endpoint, &mut reply.attributes);
                reply
            }
            Err(err) => {
                error!(endpoint, %err, "UDF failed, passing record through");
                UdfReply::accepted_empty()
            }
        }
    }
}

/// Keeps only string and boolean attribute values.
fn filter_attributes(endpoint: &str, attributes: &mut Attributes) {
    attributes.retain(|key, value| match value {
        AttrValue::String(_) | AttrValue::Bool(_) => true,
        AttrValue::Number(_) => {
            warn!(endpoint, key, "dropping unsupported UDF attribute value");
            false
        }
    });
}
