//! # voipmon
//!
//! Correlation and aggregation core of a passive VoIP monitoring pipeline.
//!
//! Capture agents decode traffic into [`packet::Packet`] records and feed
//! them onto the in-process [`bus`]. The SIP pipeline groups messages into
//! transactions and calls, the media pipeline pairs RTP quality reports
//! into sessions and scores them, and every stage writes time-bucketed raw
//! documents through [`storage`] and emits tagged metrics through
//! [`metric`]. The [`management`] socket keeps the registry of capture
//! agents and pushes SDP session descriptions back to them.

pub mod bus;
pub mod config;
pub mod management;
pub mod media;
pub mod metric;
pub mod packet;
pub mod sip;
pub mod storage;
pub mod udf;

mod error;

pub use bus::Bus;
pub use config::Config;
pub use error::{Error, Result};

#[cfg(test)]
#[macro_use]
extern crate assert_matches;
