//! Talentflow Worker - correlation engine and command dispatcher.
//!
//! This binary:
//! 1. Connects to RabbitMQ (with backoff) and consumes the inbound queue
//! 2. Delivers replies to callers waiting in this process
//! 3. Executes inbound commands and answers on their reply queue
//! 4. Serves the HTTP surface that issues calls

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use lapin::{
    options::{BasicConsumeOptions, BasicQosOptions, QueueDeclareOptions},
    types::FieldTable,
};
use tokio::{net::TcpListener, signal, sync::watch};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use talentflow::queue::connect_with_retry;
use talentflow::web::{self, AppState};
use talentflow::{
    AmqpPublisher, Config, CorrelationRegistry, Dispatcher, HttpManpowerRequests, MailgunMailer,
    Producer, Worker,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("worker_starting");

    let config = Config::from_env();
    info!(
        amqp_url_set = !config.amqp_url.is_empty(),
        inbound_queue = %config.inbound_queue,
        request_queue = %config.request_queue,
        call_timeout_ms = config.call_timeout_ms,
        correlation_expiry_ms = config.correlation_expiry_ms,
        ack_mode = ?config.ack_mode(),
        shutdown_grace_ms = config.shutdown_grace_ms,
        mailgun_configured = config.mailgun_api_key.is_some() && config.mailgun_domain.is_some(),
        port = config.port,
        "config_loaded"
    );

    run(config).await
}

async fn run(config: Config) -> Result<()> {
    let (stop_tx, stop_rx) = watch::channel(false);
    let stop_tx = Arc::new(stop_tx);

    {
        let stop_tx = Arc::clone(&stop_tx);
        tokio::spawn(async move {
            shutdown_signal().await;
            stop_tx.send_replace(true);
        });
    }

    let conn = connect_with_retry(&config.amqp_url, &config.connect_policy()).await?;

    let channel = conn.create_channel().await.context("Failed to create channel")?;

    info!("rabbitmq_channel_created");

    channel
        .basic_qos(config.prefetch_count, BasicQosOptions::default())
        .await
        .context("Failed to set QoS")?;

    info!(prefetch_count = config.prefetch_count, "rabbitmq_qos_set");

    channel
        .queue_declare(
            &config.inbound_queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .context("Failed to declare inbound queue")?;

    info!(queue = %config.inbound_queue, "rabbitmq_queue_declared");

    let deliveries = channel
        .basic_consume(
            &config.inbound_queue,
            &config.consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .context("Failed to start consumer")?;

    info!(queue = %config.inbound_queue, "rabbitmq_consumer_started");

    let publisher = AmqpPublisher::new(config.amqp_url.clone(), vec![config.request_queue.clone()]);

    let registry = match config.correlation_expiry() {
        Some(ttl) => CorrelationRegistry::with_expiry(ttl),
        None => CorrelationRegistry::new(),
    };

    let http = reqwest::Client::builder()
        .timeout(config.http_timeout())
        .build()
        .context("Failed to create HTTP client")?;

    let dispatcher = Dispatcher::new(
        publisher.clone(),
        MailgunMailer::from_config(http.clone(), &config),
        HttpManpowerRequests::from_config(http, &config),
    );
    let worker = Worker::new(registry.clone(), dispatcher, config.ack_mode())
        .with_drain_timeout(config.shutdown_grace());

    let producer = Producer::new(
        publisher.clone(),
        registry,
        config.request_queue.clone(),
        config.inbound_queue.clone(),
    );
    let app = web::router(AppState::new(Arc::new(producer), config.call_timeout()));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "web_server_listening");
    info!("worker_ready");

    let server_stop = stopped(stop_rx.clone());
    let server = async {
        axum::serve(listener, app)
            .with_graceful_shutdown(server_stop)
            .await
    };

    // Returns only once in-flight commands have replied or the grace ran out,
    // so the publisher below is still open for their replies.
    let pump = async {
        worker.pump(deliveries, stopped(stop_rx)).await;
        // A closed consumer takes the HTTP side down with it.
        stop_tx.send_replace(true);
    };

    let (served, ()) = tokio::join!(server, pump);
    served.context("Server error")?;

    publisher.close().await;

    if let Err(e) = channel.close(200, "Normal shutdown").await {
        warn!(error = %e, "rabbitmq_channel_close_error");
    }
    if let Err(e) = conn.close(200, "Normal shutdown").await {
        warn!(error = %e, "rabbitmq_connection_close_error");
    }

    info!("worker_shutdown_complete");
    Ok(())
}

/// Resolves once the stop flag flips.
async fn stopped(mut stop: watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            break;
        }
    }
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("worker_stopping");
}
