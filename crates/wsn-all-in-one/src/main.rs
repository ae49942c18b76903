mod config;
mod runner;
mod telemetry;
mod transport;

use anyhow::Context;
use config::ServiceConfig;
use runner::Runner;
use std::sync::Arc;
use telemetry::{init_telemetry, TelemetryConfig};
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use transport::{SerialCommandSink, SerialTransport};
use wsn_broker::{
    Binding, BrokerPublisher, BrokerSession, CookHandler, ExchangeKind, ForwardHandler,
    NatsBroker, RawDrainTask,
};
use wsn_domain::{
    CommandSink, CookService, DataForwarder, DeviceStateStore, JsonFileStorage, RawFrameService,
    Schedule,
};
use wsn_http::{HttpDataSink, HttpSinkConfig};
use wsn_payload::FrameCodec;

/// Frames buffered between the serial reader and the raw stage.
const RAW_QUEUE_CAPACITY: usize = 256;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = init_telemetry(&TelemetryConfig {
        log_level: config.log_level.clone(),
        log_format: config.log_format.clone(),
    }) {
        eprintln!("Failed to initialize telemetry: {}", e);
        std::process::exit(1);
    }

    info!(
        nats_url = %config.nats_url,
        wire_format = %config.wire_format,
        "Starting wsn-all-in-one service"
    );
    debug!("Configuration: {:?}", config);

    let runner = match build_runner(&config) {
        Ok(runner) => runner,
        Err(e) => {
            error!("Failed to initialize pipeline: {:#}", e);
            std::process::exit(1);
        }
    };

    if runner.process_count() == 0 {
        error!("No stage enabled, set WSN_SERIAL_PORT, WSN_COOK_ENABLED or WSN_HTTP_URL");
        std::process::exit(1);
    }

    if let Err(e) = runner.run().await {
        error!("Service stopped with error: {:#}", e);
        std::process::exit(1);
    }
    info!("Service stopped");
}

fn build_runner(config: &ServiceConfig) -> anyhow::Result<Runner> {
    let mut runner = Runner::new().with_closer_timeout(config.shutdown_timeout());
    let mut serial_sink: Option<SerialCommandSink> = None;

    // Raw stage: serial port -> raw exchange
    if let Some(port) = &config.serial_port {
        let address = hex::decode(&config.serial_address)
            .with_context(|| format!("invalid serial address '{}'", config.serial_address))?;
        let (tx, rx) = mpsc::channel(RAW_QUEUE_CAPACITY);
        let transport = SerialTransport::open(port, config.serial_baud, address, tx)
            .with_context(|| format!("failed to open serial port {port}"))?;
        let sink = transport.command_sink();
        serial_sink = Some(sink.clone());

        let broker = Arc::new(NatsBroker::new(&config.nats_url, config.connect_timeout()));
        let publisher = Arc::new(BrokerPublisher::new(broker.clone(), &config.raw_exchange));
        let state = open_state(config, "raw")?;
        let service = RawFrameService::new(publisher, Arc::new(sink), state);

        let mut session = BrokerSession::new(
            "raw",
            broker,
            vec![Binding::publish(&config.raw_exchange, ExchangeKind::Fanout)],
            config.prefetch,
        )
        .with_background_task(Box::new(RawDrainTask::new(service, rx)));

        runner = runner
            .with_named_process("raw", move |ctx| async move {
                session.run(ctx).await.map_err(anyhow::Error::from)
            })
            .with_closer(move || async move {
                info!("Stopping serial reader");
                if let Some(handle) = transport.shutdown() {
                    tokio::task::spawn_blocking(move || handle.join())
                        .await?
                        .map_err(|_| anyhow::anyhow!("serial reader panicked"))?;
                }
                Ok(())
            });
    }

    // Cook stage: raw exchange -> data exchange
    if config.cook_enabled {
        let key = config.cipher_key.as_deref().map(str::as_bytes);
        let codec = FrameCodec::new(config.wire_format, key, config.verify_encrypted_name)
            .context("invalid cipher key")?;

        let broker = Arc::new(NatsBroker::new(&config.nats_url, config.connect_timeout()));
        let publisher = Arc::new(BrokerPublisher::new(broker.clone(), &config.data_exchange));
        let state = open_state(config, "raw_cook")?;
        let mut service = CookService::new(codec, publisher, state)
            .with_max_pending_bytes(config.max_pending_bytes);
        if let Some(sink) = serial_sink {
            let commands: Arc<dyn CommandSink> = Arc::new(sink);
            service = service.with_commands(
                commands,
                vec![
                    Schedule::rssi_poll(config.rssi_poll_interval()),
                    Schedule::time_sync(config.time_sync_interval()),
                ],
            );
        }

        let mut session = BrokerSession::new(
            "cook",
            broker,
            vec![
                Binding::consume(&config.raw_exchange, ExchangeKind::Fanout, &config.cook_queue),
                Binding::publish(&config.data_exchange, ExchangeKind::Fanout),
            ],
            config.prefetch,
        )
        .with_handler(Box::new(CookHandler::new(service)));

        runner = runner.with_named_process("cook", move |ctx| async move {
            session.run(ctx).await.map_err(anyhow::Error::from)
        });
    }

    // Forward stage: data exchange -> HTTP
    if let Some(url) = &config.http_url {
        let sink = HttpDataSink::new(HttpSinkConfig {
            url: url.clone(),
            token: config.http_token.clone(),
            timeout: config.http_timeout(),
        })?;
        let forwarder = DataForwarder::new(Arc::new(sink));

        let broker = Arc::new(NatsBroker::new(&config.nats_url, config.connect_timeout()));
        let mut session = BrokerSession::new(
            "forward",
            broker,
            vec![Binding::consume(
                &config.data_exchange,
                ExchangeKind::Fanout,
                &config.forward_queue,
            )],
            config.prefetch,
        )
        .with_handler(Box::new(ForwardHandler::new(forwarder, config.http_backoff())));

        runner = runner.with_named_process("forward", move |ctx| async move {
            session.run(ctx).await.map_err(anyhow::Error::from)
        });
    }

    Ok(runner)
}

fn open_state(config: &ServiceConfig, stage: &str) -> anyhow::Result<DeviceStateStore> {
    let path = config.state_file(stage);
    let store = DeviceStateStore::open(Box::new(JsonFileStorage::new(&path)))
        .with_context(|| format!("failed to load device state from {}", path.display()))?;
    info!(stage, devices = store.len(), "Device state loaded");
    Ok(store)
}
