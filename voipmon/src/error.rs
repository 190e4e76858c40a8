use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("missing required configuration key '{0}'")]
    MissingConfig(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed SIP message: {0}")]
    SipParse(String),

    #[error("malformed RTP report: {0}")]
    ReportParse(String),

    #[error("unknown RTP report source {0}")]
    UnknownReportSource(u8),

    #[error("no subscriber on topic '{0}'")]
    NoSubscriber(String),

    #[error("request to topic '{0}' timed out")]
    RequestTimeout(String),

    #[error("bus queue for topic '{0}' is closed")]
    ChannelClosed(String),

    #[error(transparent)]
    Store(#[from] mongodb::error::Error),
}
