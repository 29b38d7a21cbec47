use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use shoe_service_rs::backend::{SupabaseClient, SupabaseConfig};
use shoe_service_rs::config::ServiceConfig;
use shoe_service_rs::metrics::run_metrics_flush_loop;
use shoe_service_rs::model::CnnClassifier;
use shoe_service_rs::retrain::{train_from_directory, RetrainSettings};
use shoe_service_rs::routes::{self, AppState};
use shoe_service_rs::utils::ensure_model_artifact;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "shoe_service.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP service (default)
    Serve,
    /// Train the model artifact from a `<label>/<images>` folder
    Train {
        #[arg(long)]
        data_dir: PathBuf,

        #[arg(long)]
        epochs: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let result = match args.command.unwrap_or(Command::Serve) {
        Command::Serve => run_server(&args.config).await,
        Command::Train { data_dir, epochs } => run_training(&args.config, data_dir, epochs).await,
    };

    if let Err(e) = result {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn run_server(config_path: &str) -> anyhow::Result<()> {
    let config = ServiceConfig::load(config_path)?;

    ensure_model_artifact(
        &config.model_path,
        config.model_url.as_deref(),
        config.model_url_token.as_deref(),
    )
    .await?;
    let classifier = CnnClassifier::load(&config.model_path, config.confidence_threshold)?;

    let client = Arc::new(SupabaseClient::new(SupabaseConfig {
        url: config.supabase_url.clone(),
        key: config.supabase_key.clone(),
        bucket: config.bucket.clone(),
        timeout: config.remote_timeout(),
    })?);

    tokio::fs::create_dir_all(&config.upload_dir).await?;
    tokio::fs::create_dir_all(&config.retrain_dir).await?;

    let interval = config.metrics_interval();
    let state = Arc::new(AppState::new(
        config,
        Arc::new(classifier),
        client.clone(),
        client.clone(),
    ));

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    tokio::spawn(run_metrics_flush_loop(
        state.metrics.clone(),
        client,
        interval,
        tx.subscribe(),
    ));

    routes::serve(state, tx.subscribe()).await?;
    Ok(())
}

async fn run_training(
    config_path: &str,
    data_dir: PathBuf,
    epochs: Option<usize>,
) -> anyhow::Result<()> {
    let config = ServiceConfig::load_for_training(config_path)?;
    let mut settings = RetrainSettings::from_config(&config);
    if let Some(epochs) = epochs {
        settings.epochs = epochs;
    }

    tracing::info!(
        "Training from {} for {} epochs",
        data_dir.display(),
        settings.epochs
    );
    let report =
        tokio::task::spawn_blocking(move || train_from_directory(&data_dir, &settings)).await??;
    tracing::info!(
        "Trained on {} images; model written to {}",
        report.train_samples,
        config.model_path.display()
    );
    Ok(())
}
