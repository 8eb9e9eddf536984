use anyhow::Context;
use cdc::CdcManager;
use clap::Parser;
use connectors::JobContext;
use ingest_queue::{Queue, S3PayloadStore, SqsQueue};
use ingest_sql::TenantPools;
use std::sync::Arc;
use tokio::sync::watch;
use vault::SsmVault;

mod collaborators;
mod harness;
mod registry;

use collaborators::{HttpIndexWriter, QueueIndexingTrigger, SalesforceCdcCredentials};

/// ingestd is the worker daemon of the ingestion plane: it consumes jobs
/// from the ingest queue, runs connector extractors, and (optionally) hosts
/// the CDC listener fleet.
#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// URL of the control-plane postgres database.
    #[clap(long = "control-database", env = "CONTROL_DATABASE_URL")]
    control_database_url: String,
    /// URL of the ingest FIFO queue.
    #[clap(long = "ingest-queue-url", env = "INGEST_QUEUE_URL")]
    ingest_queue_url: String,
    /// URL of the document-indexing queue consumed by the transformer stage.
    #[clap(long = "indexing-queue-url", env = "INDEXING_QUEUE_URL")]
    indexing_queue_url: String,
    /// S3 bucket holding queue payloads over the message size cap.
    #[clap(long = "payload-bucket", env = "QUEUE_PAYLOAD_BUCKET")]
    payload_bucket: String,
    /// Base URL of the index writer service.
    #[clap(long = "index-writer-url", env = "INDEX_WRITER_URL")]
    index_writer_url: String,
    /// KMS key encrypting vault parameters and offloaded payloads.
    #[clap(long = "kms-key-id", env = "KMS_KEY_ID")]
    kms_key_id: String,
    /// Concurrent jobs per worker process.
    #[clap(long, default_value = "16", env = "JOB_PERMITS")]
    permits: u32,
    /// Max connections per tenant database pool.
    #[clap(long = "tenant-pool-size", default_value = "4")]
    tenant_pool_size: u32,
    /// Also run the CDC listener fleet in this process.
    #[clap(long = "serve-cdc", env = "SERVE_CDC")]
    serve_cdc: bool,
    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Consume and process ingest jobs (the default).
    Serve,
    /// Enqueue a root job for a tenant and exit.
    Enqueue {
        /// The job `source` discriminator, e.g. salesforce_backfill_root.
        #[clap(long)]
        source: String,
        #[clap(long)]
        tenant: String,
    },
    /// Run one source's health check for a tenant and exit.
    Health {
        #[clap(long)]
        source: models::SourceKind,
        #[clap(long)]
        tenant: String,
    },
}

fn main() -> Result<(), anyhow::Error> {
    // Structured logs to stderr; RUST_LOG selects the filter.
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing default failed");

    let args = Args::parse();
    tracing::info!(
        permits = args.permits,
        serve_cdc = args.serve_cdc,
        "ingestd starting"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(async_main(args));
    runtime.shutdown_timeout(std::time::Duration::from_secs(5));
    result
}

async fn async_main(mut args: Args) -> anyhow::Result<()> {
    let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;

    let vault = Arc::new(SsmVault::new(
        aws_sdk_ssm::Client::new(&aws_config),
        args.kms_key_id.clone(),
    ));
    let payloads = Arc::new(S3PayloadStore::new(
        aws_sdk_s3::Client::new(&aws_config),
        args.payload_bucket.clone(),
        args.kms_key_id.clone(),
    ));
    let sqs = aws_sdk_sqs::Client::new(&aws_config);
    let ingest_queue: Arc<dyn Queue> = Arc::new(SqsQueue::new(
        sqs.clone(),
        args.ingest_queue_url.clone(),
        payloads.clone(),
    ));
    let indexing_queue: Arc<dyn Queue> = Arc::new(SqsQueue::new(
        sqs,
        args.indexing_queue_url.clone(),
        payloads,
    ));

    let ctx = JobContext {
        queue: ingest_queue,
        vault: vault.clone(),
        pools: Arc::new(TenantPools::new(vault, args.tenant_pool_size)),
        index: Arc::new(HttpIndexWriter::new(args.index_writer_url.clone())?),
        indexing: Arc::new(QueueIndexingTrigger::new(indexing_queue)),
        limits: Arc::new(limiter::Registry::new()),
    };

    match args.command.take().unwrap_or(Command::Serve) {
        Command::Serve => serve(args, ctx).await,
        Command::Enqueue { source, tenant } => {
            let config = registry::root_job(&source, &tenant)
                .with_context(|| format!("unknown root job source {source:?}"))?;
            ctx.queue.send_backfill_ingest(&config).await?;
            tracing::info!(%source, %tenant, "enqueued root job");
            Ok(())
        }
        Command::Health { source, tenant } => {
            let status = registry::health_registry().run(&ctx, source, &tenant).await;
            println!(
                "{}: {}",
                if status.healthy { "ok" } else { "FAIL" },
                status.message
            );
            anyhow::ensure!(status.healthy, "health check failed");
            Ok(())
        }
    }
}

async fn serve(args: Args, ctx: JobContext) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(?err, "failed to install signal handler");
        }
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let worker = harness::Worker {
        ctx: ctx.clone(),
        registry: Arc::new(registry::extractor_registry()),
        permits: args.permits,
    };

    if args.serve_cdc {
        let control_pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(4)
            .connect(&args.control_database_url)
            .await
            .context("failed to connect control-plane database")?;
        let manager = CdcManager::new(
            control_pool,
            Arc::new(SalesforceCdcCredentials::new(ctx.clone())),
            ctx.queue.clone(),
        );
        let cdc_shutdown = shutdown_rx.clone();
        tokio::join!(worker.serve(shutdown_rx), manager.run(cdc_shutdown));
    } else {
        worker.serve(shutdown_rx).await;
    }

    tracing::info!("ingestd stopped");
    Ok(())
}
