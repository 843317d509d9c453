//! CLI entry point for sensorhub.
//!
//! One subcommand per OS process role:
//!
//! ```bash
//! sensorhub broker            # own the buffers, serve remote handles
//! sensorhub mqtt              # MQTT ingestor -> MqttRx buffer
//! sensorhub raw               # raw frame server -> RawRx buffer
//! sensorhub drain --buffer raw-rx   # RX buffer -> storage
//! ```
//!
//! All roles read `config/default.toml` (or `--config <name>` for
//! `config/<name>.toml`).

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use log::info;

use sensorhub::config::Settings;
use sensorhub::drain::DrainWorker;
use sensorhub::ingest::{RawFrameServer, SubscriptionIngestor};
use sensorhub::storage::{JsonlStore, MemoryStore, QueueStore};
use sensorhub::{BrokerClient, BufferBroker, BufferName, BufferRegistry};

#[derive(Parser)]
#[command(name = "sensorhub")]
#[command(about = "Telemetry ingestion hub with a cross-process buffer broker", long_about = None)]
struct Cli {
    /// Config name under config/ (without extension)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log every MQTT protocol event
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the buffer broker process
    Broker,
    /// Run the MQTT subscription ingestor
    Mqtt,
    /// Run the raw frame server
    Raw,
    /// Run a drain worker for one RX buffer
    Drain {
        /// Which buffer to drain
        #[arg(long, value_enum, default_value_t = DrainBuffer::RawRx)]
        buffer: DrainBuffer,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum DrainBuffer {
    MqttRx,
    RawRx,
}

impl From<DrainBuffer> for BufferName {
    fn from(value: DrainBuffer) -> Self {
        match value {
            DrainBuffer::MqttRx => BufferName::MqttRx,
            DrainBuffer::RawRx => BufferName::RawRx,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::new(cli.config.as_deref())?;

    env_logger::Builder::new()
        .parse_filters(&settings.log_level)
        .init();

    match cli.command {
        Commands::Broker => run_broker(settings).await,
        Commands::Mqtt => run_mqtt(settings, cli.verbose).await,
        Commands::Raw => run_raw(settings).await,
        Commands::Drain { buffer } => run_drain(settings, buffer.into()).await,
    }
}

async fn run_broker(settings: Settings) -> Result<()> {
    let registry = BufferRegistry::new();
    let broker = BufferBroker::bind(
        &settings.broker.addr(),
        settings.broker.credential.clone(),
        registry,
    )
    .await?;
    broker.serve().await?;
    Ok(())
}

async fn run_mqtt(settings: Settings, verbose: bool) -> Result<()> {
    let client = BrokerClient::connect(
        settings.broker.addr(),
        settings.broker.credential.clone(),
    )
    .await?;
    let rx_handle = client.get(BufferName::MqttRx).await?;

    let mut ingestor = SubscriptionIngestor::new(settings.mqtt.clone(), verbose);
    ingestor.setup().await?;

    let shutdown = ingestor.shutdown_signal();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Interrupt received, stopping ingestor");
        shutdown.trigger();
    });

    ingestor.run(rx_handle).await?;
    ingestor.stop().await?;
    Ok(())
}

async fn run_raw(settings: Settings) -> Result<()> {
    let client = BrokerClient::connect(
        settings.broker.addr(),
        settings.broker.credential.clone(),
    )
    .await?;
    let rx_handle = client.get(BufferName::RawRx).await?;

    let server = RawFrameServer::bind(&settings.raw.bind_addr, settings.raw.queue_depth).await?;
    let shutdown = server.shutdown_signal();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Interrupt received, stopping raw server");
        shutdown.trigger();
    });

    server.run(rx_handle).await?;
    Ok(())
}

async fn run_drain(settings: Settings, buffer: BufferName) -> Result<()> {
    let client = BrokerClient::connect(
        settings.broker.addr(),
        settings.broker.credential.clone(),
    )
    .await?;
    let source = client.get(buffer).await?;

    let store: Box<dyn QueueStore> = match settings.storage.default_format.as_str() {
        "memory" => Box::new(MemoryStore::new()),
        _ => Box::new(JsonlStore::create(&settings.storage.default_path)?),
    };

    let worker = DrainWorker::new();
    let kill = worker.shutdown_signal();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Interrupt received, stopping drain worker");
        kill.trigger();
    });

    worker.run(source, store.as_ref()).await?;
    Ok(())
}
