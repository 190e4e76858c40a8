use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use voipmon::bus::Bus;
use voipmon::config::Config;
use voipmon::management::ManagementSocket;
use voipmon::media::session::RtprSessionWorker;
use voipmon::sip::ROUTE_PREFIXES;
use voipmon::sip::call::SipCallWorker;
use voipmon::sip::handler::SipMessageHandler;
use voipmon::sip::transaction::SipTransactionWorker;
use voipmon::storage::{MongoStore, Sink, StorageWriter};
use voipmon::udf::UdfDispatcher;
use voipmon::{Error, Result};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "voipmon.toml".to_string());
    let config = Config::from_file(&path)?;

    let bus = Bus::new();
    let sink = Sink::new(bus.clone(), config.time_suffix.clone());

    let mongo = config
        .mongo
        .as_ref()
        .ok_or(Error::MissingConfig("mongo.uri"))?;
    let store = Arc::new(MongoStore::connect(&mongo.uri, &mongo.db).await?);
    tokio::spawn(StorageWriter::new(&bus, store, &config.storage).run());

    let udf = UdfDispatcher::new(bus.clone(), &config.udf);
    udf.start();

    tokio::spawn(
        SipMessageHandler::new(&bus, sink.clone(), &config.sip.message, config.instances).run(),
    );

    for prefix in ROUTE_PREFIXES {
        let shards = match prefix {
            "sip_call" | "sip_register" => config.instances,
            _ => 1,
        };
        for shard in 0..shards {
            tokio::spawn(
                SipTransactionWorker::new(
                    &bus,
                    sink.clone(),
                    udf.clone(),
                    prefix,
                    shard,
                    &config.sip.transaction,
                )
                .run(),
            );
        }
    }
    tokio::spawn(SipCallWorker::new(&bus, sink.clone(), &config.sip.call).run());
    tokio::spawn(RtprSessionWorker::new(&bus, sink.clone(), &config.media.rtp_r).run());

    let management = ManagementSocket::bind(&bus, sink, &config.management).await?;
    tokio::spawn(management.run());

    info!("voipmon started");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
