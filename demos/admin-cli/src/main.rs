//! Wires Submission, Admin, Poller and JobFinalizer against either a
//! configured PostgreSQL store or an in-memory one, in the spirit of the
//! teacher's small wiring-only example binaries (`http-fetcher`,
//! `ai-summarizer`): no ceremony beyond what `clap` and `tracing-subscriber`
//! need.

use anyhow::{bail, Context, Result};
use batchflow_core::artifact_index::{ArtifactIndex, ReusePolicy};
use batchflow_core::clock::{SharedClock, SystemClock, WorkerId};
use batchflow_core::config::Config;
use batchflow_core::export::ExportProcedure;
use batchflow_core::finalizer::JobFinalizer;
use batchflow_core::http::{self, AppState};
use batchflow_core::lease::LeaseManager;
use batchflow_core::poller::{Poller, PollerConfig};
use batchflow_core::retry::{RetryConfig, RetryPolicy};
use batchflow_core::submission::{Submission, SubmissionItem, SubmissionRequest};
use batchflow_core::upload::Uploader;
use batchflow_core::{Admin, Executor, Store};
use batchflow_memory::MemoryStore;
use batchflow_postgres::{PgExportProcedure, PgStore};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "batchflow-admin", about = "Submit and inspect batch CSV export jobs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a new export job. Each --item is `indexKey:effectiveDateYYYYMMDD:asofIndicator`.
    Submit {
        #[arg(long = "item", required = true)]
        items: Vec<String>,
    },
    /// Print the status of a job by its job_key.
    Status { job_key: String },
    /// Re-drive a DLQ unit back to PENDING.
    Redrive { input_id: Uuid },
    /// Run poller + periodic finalizer against the configured store.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("loading configuration")?;

    // `serve` needs a real database export procedure to call, so it always
    // runs against Postgres regardless of what the other subcommands use.
    if matches!(&cli.command, Command::Serve) {
        let procedure_sql = std::env::var("EXPORT_PROCEDURE_SQL")
            .context("EXPORT_PROCEDURE_SQL must name the stored procedure to call (e.g. \"SELECT * FROM export_procedure($1, $2, $3)\")")?;
        if config.database_url.is_empty() {
            bail!("DATABASE_URL must be set to run `serve`");
        }
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await
            .context("connecting to postgres")?;
        let store = Arc::new(PgStore::new(pool.clone()));
        let clock: SharedClock = Arc::new(SystemClock);
        let export: Arc<dyn ExportProcedure> = Arc::new(PgExportProcedure::new(pool, procedure_sql));
        return serve(store, config, clock, export).await;
    }

    if config.database_url.is_empty() {
        tracing::warn!("DATABASE_URL is not set; running against an in-memory store");
        let store = Arc::new(MemoryStore::new());
        run(store, config, cli.command).await
    } else {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await
            .context("connecting to postgres")?;
        let store = Arc::new(PgStore::new(pool));
        run(store, config, cli.command).await
    }
}

async fn run<S: Store + 'static>(store: Arc<S>, config: Config, command: Command) -> Result<()> {
    let clock: SharedClock = Arc::new(SystemClock);

    match command {
        Command::Submit { items } => {
            let submission = Submission::new(store, clock, config.submission_max_units_per_job);
            let parsed = items.into_iter().map(parse_item).collect::<Result<Vec<_>>>()?;
            let job_key = submission
                .submit(SubmissionRequest { items: parsed })
                .await?;
            println!("submitted {job_key}");
        }
        Command::Status { job_key } => {
            let admin = Admin::new(store);
            match admin.status_by_key(&job_key).await? {
                Some(view) => println!("{}", serde_json::to_string_pretty(&view)?),
                None => bail!("no job with job_key {job_key}"),
            }
        }
        Command::Redrive { input_id } => {
            let admin = Admin::new(store);
            admin.redrive(input_id).await?;
            println!("redriven {input_id}");
        }
        Command::Serve => unreachable!("handled in main before store selection"),
    }

    Ok(())
}

/// Runs a poller and periodic finalizer until the process is killed.
///
/// The export procedure is the one collaborator a real deployment must
/// supply itself (spec.md §1 non-goal: the procedure's own SQL is out of
/// scope). Against Postgres this wires `PgExportProcedure` with the SQL
/// given via `EXPORT_PROCEDURE_SQL`; against the in-memory store there is
/// no database to call, so `serve` requires Postgres.
async fn serve<S: Store + 'static>(
    store: Arc<S>,
    config: Config,
    clock: SharedClock,
    export: Arc<dyn ExportProcedure>,
) -> Result<()> {
    let worker_id = WorkerId::generate();
    tracing::info!(%worker_id, "batchflow worker starting");

    let lease_manager = Arc::new(LeaseManager::new(
        store.clone(),
        clock.clone(),
        config.worker_lease_seconds,
    ));
    let artifact_index = ArtifactIndex::new(
        store.clone(),
        clock.clone(),
        ReusePolicy {
            enabled: config.file_reuse_enabled,
            days: config.file_reuse_days,
            timezone: config.timezone,
        },
    );
    let retry_policy = RetryPolicy::new(RetryConfig {
        max_attempts: config.retry_max_attempts,
        base_delay_ms: config.retry_base_delay_ms,
        max_delay_ms: config.retry_max_delay_ms,
    });

    let aws_conf = aws_config::load_from_env().await;
    let uploader: Arc<dyn Uploader> = Arc::new(batchflow_core::S3Uploader::new(
        aws_sdk_s3::Client::new(&aws_conf),
        config.storage_bucket.clone(),
    ));

    let executor = Arc::new(
        Executor::new(
            store.clone(),
            clock.clone(),
            artifact_index,
            retry_policy,
            export,
            uploader,
            config.storage_base_path.clone(),
        )
        .with_lease_manager(lease_manager.clone()),
    );
    let finalizer = Arc::new(JobFinalizer::new(store.clone()));

    let http_addr = std::env::var("HTTP_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let app_state = Arc::new(AppState {
        submission: Arc::new(Submission::new(
            store.clone(),
            clock.clone(),
            config.submission_max_units_per_job,
        )),
        admin: Arc::new(Admin::new(store.clone())),
    });
    let listener = tokio::net::TcpListener::bind(&http_addr)
        .await
        .with_context(|| format!("binding HTTP listener on {http_addr}"))?;
    tracing::info!(addr = %http_addr, "admin HTTP surface listening");
    let http_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, http::router(app_state)).await {
            tracing::error!(error = %e, "HTTP server exited");
        }
    });

    let poller = Poller::new(
        store.clone(),
        clock,
        lease_manager,
        executor,
        finalizer.clone(),
        worker_id,
        PollerConfig {
            batch_size: config.worker_poll_batch_size,
            poll_interval: config.worker_poll_interval,
            max_in_flight: config.worker_max_in_flight,
        },
    );

    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let finalizer_rx = shutdown_rx.clone();
    let finalizer_handle = tokio::spawn(async move {
        finalizer.run_periodic(config.finalizer_interval, finalizer_rx).await;
    });

    tokio::select! {
        _ = poller.run(shutdown_rx) => {}
        _ = finalizer_handle => {}
        _ = http_handle => {}
    }

    Ok(())
}

fn parse_item(raw: String) -> Result<SubmissionItem> {
    let mut parts = raw.splitn(3, ':');
    let index_key = parts.next().context("missing indexKey")?.to_string();
    let effective_date: i32 = parts
        .next()
        .context("missing effectiveDate")?
        .parse()
        .context("effectiveDate must be an integer YYYYMMDD")?;
    let asof_indicator = parts.next().context("missing asofIndicator")?.to_string();

    Ok(SubmissionItem {
        index_key,
        effective_date,
        asof_indicator,
    })
}
