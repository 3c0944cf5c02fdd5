pub mod config;
pub mod decision;
pub mod mqtt;
pub mod relay;

use crate::config::RelayConfig;
use crate::decision::{DecisionEvaluator, DecisionRuntime};
use crate::mqtt::{ActuatorSink, MqttHandler, MqttLink};
use crate::relay::{RelayHandle, TemperatureAlertRelay};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const EVENT_CHANNEL_CAPACITY: usize = 100;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = RelayConfig::load(std::env::args_os().nth(1).map(PathBuf::from)).await?;

    let runtime = DecisionRuntime::load_dir(&config.decision.models_dir).await?;
    info!("Loaded {} decision model(s)", runtime.len());
    for key in runtime.model_keys() {
        debug!("Available model: {}", key);
    }
    let model = runtime
        .get_model(&config.decision.namespace, &config.decision.model)
        .ok_or_else(|| {
            eyre!(
                "Decision model not found: {}#{}",
                config.decision.namespace,
                config.decision.model
            )
        })?;
    info!(
        "Using decision model {} ({})",
        model.key(),
        model.description().unwrap_or("no description")
    );
    let evaluator: Arc<dyn DecisionEvaluator> = model;

    let cancel = CancellationToken::new();
    let connect_timeout = config.broker.connect_timeout();

    // Actuator first, so no reading is classified without somewhere to send it
    let (actuator_handler, actuator_link) =
        MqttHandler::new(&config.broker, &config.actuator.client_id, Vec::new(), None)?;
    let actuator_task = actuator_handler.spawn(cancel.child_token());
    let actuator_link = Arc::new(actuator_link);
    actuator_link.wait_connected(connect_timeout).await?;
    info!("Actuator link '{}' connected", actuator_link.client_id());

    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let relay = TemperatureAlertRelay::configure(
        evaluator,
        actuator_link.clone(),
        config.relay_settings(),
    );
    let mut relay_handle = RelayHandle::start(relay, events_rx);

    let (ingest_handler, ingest_link) = MqttHandler::new(
        &config.broker,
        &config.ingest.client_id,
        vec![config.ingest.topic.clone()],
        Some(events_tx),
    )?;
    let mut ingest_task = ingest_handler.spawn(cancel.child_token());
    if let Err(e) = ingest_link.wait_connected(connect_timeout).await {
        error!("Ingest link failed to connect: {}", e);
        shutdown(&ingest_link, &mut relay_handle, vec![ingest_task, actuator_task], &cancel)
            .await;
        return Err(e.into());
    }
    info!(
        "Ingest link '{}' connected, listening on {}",
        ingest_link.client_id(),
        config.ingest.topic
    );

    tokio::select! {
        res = shutdown_signal() => {
            if let Err(e) = res {
                warn!("Unable to listen for shutdown signals: {}", e);
            }
            info!("Shutdown requested");
        }
        _ = &mut ingest_task => {
            warn!("Ingest link stopped: {:?}", ingest_link.status().error_messages.last());
        }
    }

    shutdown(&ingest_link, &mut relay_handle, vec![ingest_task, actuator_task], &cancel).await;
    Ok(())
}

async fn shutdown(
    ingest_link: &MqttLink,
    relay_handle: &mut RelayHandle,
    link_tasks: Vec<JoinHandle<()>>,
    cancel: &CancellationToken,
) {
    if let Err(e) = ingest_link.disconnect() {
        warn!("Ingest disconnect failed: {}", e);
    }

    match relay_handle.shutdown().await {
        Ok(status) => info!(
            "Final relay status: received={} published={} decode_errors={} evaluation_errors={} publish_errors={} connection_losses={} last={:?}",
            status.messages_received,
            status.messages_published,
            status.decode_errors,
            status.evaluation_errors,
            status.publish_errors,
            status.connection_losses,
            status.last_classification
        ),
        Err(e) => error!("Relay shutdown failed: {}", e),
    }

    for task in link_tasks {
        if task.is_finished() {
            continue;
        }
        if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
            debug!("Link task did not finish within the grace period");
        }
    }
    cancel.cancel();
    info!("Shutdown complete");
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|level| Level::from_str(level.trim()).ok())
        .unwrap_or(Level::INFO);

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
