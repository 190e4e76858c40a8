//! Capture agent registry and management socket.
//!
//! Agents announce themselves with periodic `register` datagrams over UDP.
//! The registry tracks their liveness and, whenever signaling publishes SDP
//! session descriptions, pushes them to every RTP-enabled agent so it can
//! correlate RTP streams to calls. Send failures are logged and never
//! retried: the next report publishes the session again.

use std::collections::HashMap;
use std::net::SocketAddr;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::bus::{Bus, Event, Subscription};
use crate::config::ManagementConfig;
use crate::error::Result;
use crate::media::sdp::SdpSession;
use crate::media::session::SDP_TOPIC;
use crate::storage::Sink;

const HOSTS_COLLECTION: &str = "hosts";

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct RegisterPayload {
    #[allow(dead_code)]
    timestamp: i64,
    name: String,
    #[serde(default)]
    config: AgentConfig,
}

#[derive(Debug, Default, Deserialize)]
struct AgentConfig {
    /// Agent-side host descriptor, persisted verbatim to `hosts`.
    host: Option<Value>,
    rtp: Option<RtpSetting>,
}

#[derive(Debug, Deserialize)]
struct RtpSetting {
    enabled: bool,
}

/// A registered capture agent.
#[derive(Debug, Clone)]
pub struct RemoteHost {
    pub name: String,
    pub addr: SocketAddr,
    pub last_update: DateTime<Utc>,
    pub rtp_enabled: bool,
}

/// Worker owning the management UDP socket and the agent registry.
pub struct ManagementSocket {
    socket: UdpSocket,
    sink: Sink,
    subscription: Subscription,
    hosts: HashMap<String, RemoteHost>,
    /// Cached "any agent processes media" flag.
    send_sdp_sessions: bool,
    config: ManagementConfig,
}

impl ManagementSocket {
    pub async fn bind(bus: &Bus, sink: Sink, config: &ManagementConfig) -> Result<Self> {
        let addr = config.socket_addr()?;
        let socket = UdpSocket::bind(addr).await?;
        info!(addr = %socket.local_addr()?, "management socket listening");

        Ok(Self {
            socket,
            sink,
            subscription: bus.subscribe(SDP_TOPIC),
            hosts: HashMap::new(),
            send_sdp_sessions: false,
            config: config.clone(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn run(mut self) {
        let mut buf = vec![0u8; 8192];
        let mut tick = tokio::time::interval(self.config.expiration_delay());
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, addr)) => self.on_datagram(&buf[..len], addr),
                    Err(err) => error!(%err, "management socket receive failed"),
                },
                message = self.subscription.recv() => match message {
                    Some(message) => {
                        if let Event::SdpInfo(sessions) = message.event {
                            self.push_sdp(&sessions).await;
                        }
                    }
                    None => break,
                },
                _ = tick.tick() => self.sweep(),
            }
        }
    }

    fn on_datagram(&mut self, raw: &[u8], addr: SocketAddr) {
        let envelope: Envelope = match serde_json::from_slice(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(%addr, %err, "dropping malformed management datagram");
                return;
            }
        };
        match envelope.kind.as_str() {
            "register" => self.on_register(envelope.payload, addr),
            other => warn!(%addr, kind = other, "dropping unknown management message"),
        }
    }

    fn on_register(&mut self, payload: Value, addr: SocketAddr) {
        let payload: RegisterPayload = match serde_json::from_value(payload) {
            Ok(payload) => payload,
            Err(err) => {
                debug!(%addr, %err, "dropping malformed register payload");
                return;
            }
        };
        let rtp_enabled = payload
            .config
            .rtp
            .as_ref()
            .is_some_and(|setting| setting.enabled);

        match self.hosts.get_mut(&payload.name) {
            Some(host) => {
                host.addr = addr;
                host.last_update = Utc::now();
                host.rtp_enabled = rtp_enabled;
            }
            None => {
                info!(name = %payload.name, %addr, rtp_enabled, "capture agent registered");
                if let Some(host) = payload.config.host {
                    if host.get("name").is_some() {
                        self.sink.upsert(HOSTS_COLLECTION, "name", host);
                    } else {
                        warn!(name = %payload.name, "agent host descriptor lacks a name, not persisted");
                    }
                }
                self.hosts.insert(
                    payload.name.clone(),
                    RemoteHost {
                        name: payload.name,
                        addr,
                        last_update: Utc::now(),
                        rtp_enabled,
                    },
                );
            }
        }
        self.recompute_flag();
    }

    async fn push_sdp(&self, sessions: &[SdpSession]) {
        if !self.send_sdp_sessions {
            return;
        }
        for session in sessions {
            let datagram = json!({
                "type": "sdp_session",
                "payload": session,
            });
            let raw = match serde_json::to_vec(&datagram) {
                Ok(raw) => raw,
                Err(err) => {
                    error!(%err, "SDP session is not serializable");
                    continue;
                }
            };
            for host in self.hosts.values().filter(|host| host.rtp_enabled) {
                if let Err(err) = self.socket.send_to(&raw, host.addr).await {
                    error!(agent = %host.name, %err, "SDP push failed");
                }
            }
        }
    }

    /// Evicts agents that stopped registering.
    fn sweep(&mut self) {
        let now = Utc::now();
        let timeout = ChronoDuration::from_std(self.config.expiration_timeout())
            .unwrap_or_else(|_| ChronoDuration::milliseconds(i64::MAX / 2));

        self.hosts.retain(|name, host| {
            let keep = host.last_update + timeout >= now;
            if !keep {
                info!(name = %name, "capture agent expired");
            }
            keep
        });
        self.recompute_flag();
    }

    fn recompute_flag(&mut self) {
        self.send_sdp_sessions = self.hosts.values().any(|host| host.rtp_enabled);
    }
}
