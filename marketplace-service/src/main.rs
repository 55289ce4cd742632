use anyhow::Result;
use clap::Parser;
use marketplace_service::cancellation::CancellationService;
use marketplace_service::config::Args;
use marketplace_service::outbox::OutboxProcessor;
use marketplace_service::payments::{KafkaPaymentGateway, PaymentGateway, PaymentReplyHandler};
use marketplace_service::{api, connect_pool, run_migrations};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::FutureProducer;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    let config = args.engine_config()?;

    info!("Running database migrations...");
    run_migrations(&args.database_url)?;
    info!("Migrations completed successfully");

    let pool = connect_pool(&args.database_url).await?;

    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", &args.kafka_brokers)
        .set("message.timeout.ms", "5000")
        .create()?;

    let reply_consumer: StreamConsumer = ClientConfig::new()
        .set("group.id", "marketplace-service-replies")
        .set("bootstrap.servers", &args.kafka_brokers)
        .set("enable.partition.eof", "false")
        .set("session.timeout.ms", "6000")
        .set("enable.auto.commit", "true")
        .create()?;
    reply_consumer.subscribe(&[&args.reply_topic])?;

    let payments: Arc<dyn PaymentGateway> = Arc::new(KafkaPaymentGateway::new(
        producer.clone(),
        args.payment_command_topic.clone(),
        args.checkout_base_url.clone(),
    ));

    let outbox_processor = OutboxProcessor::new(pool.clone(), producer.clone(), args.notification_topic.clone());
    let reply_handler = PaymentReplyHandler::new(pool.clone());
    let sweeper = CancellationService::new(pool.clone(), payments.clone(), config.abandon_after);
    let sweep_interval = config.sweep_interval;

    tokio::spawn(async move {
        outbox_processor.run().await;
    });

    tokio::spawn(async move {
        reply_handler.run(reply_consumer).await;
    });

    tokio::spawn(async move {
        sweeper.run(sweep_interval).await;
    });

    let app = api::create_router(api::AppState::new(pool, config, payments));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;

    info!("Marketplace service listening on port {}", args.port);

    axum::serve(listener, app).await?;

    Ok(())
}
