use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use pipeline::config::AppConfig;
use pipeline::hub::{HfHubClient, HubUploader};
use pipeline::tracking::{ExperimentTracker, LocalTracker, MlflowTracker};
use pipeline::{serve, stages};

#[derive(Parser)]
#[command(name = "engine-pipeline")]
#[command(about = "Engine condition training and deployment pipeline", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every stage enabled by the RUN_* toggles, in order
    Run,
    /// Upload the raw CSV to the dataset repo
    RegisterData,
    /// Analyze, split and write processed data, then upload it
    Prepare {
        /// Write locally only
        #[arg(long)]
        no_upload: bool,
    },
    /// Upload already prepared data
    PushData,
    /// Search, fit and save the model
    Train,
    /// Upload the saved model to the model repo
    RegisterModel,
    /// Upload the deployment folder to the Space
    Deploy,
    /// Serve predictions over HTTP
    Serve,
}

fn hub(cfg: &AppConfig) -> Result<HfHubClient> {
    Ok(HfHubClient::new(&cfg.hf_endpoint, cfg.token()?))
}

fn tracker(cfg: &AppConfig) -> Box<dyn ExperimentTracker> {
    match &cfg.mlflow_tracking_uri {
        Some(uri) => Box::new(MlflowTracker::new(uri, &cfg.experiment_name)),
        None => Box::new(LocalTracker::new(&cfg.tracking_dir, &cfg.experiment_name)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = AppConfig::from_env()?;

    match cli.command {
        Command::Run => {
            cfg.validate_for_run()?;
            let hub = hub(&cfg)?;
            let mut tracker = tracker(&cfg);
            info!(tracker = tracker.name(), "pipeline: configured");
            stages::run_all(&cfg, &hub, tracker.as_mut()).await?;
        }
        Command::RegisterData => {
            stages::register_dataset(&cfg, &hub(&cfg)?).await?;
        }
        Command::Prepare { no_upload } => {
            if no_upload {
                stages::prepare_data(&cfg, None).await?;
            } else {
                let hub = hub(&cfg)?;
                stages::prepare_data(&cfg, Some(&hub as &dyn HubUploader)).await?;
            }
        }
        Command::PushData => {
            stages::push_dataset(&cfg, &hub(&cfg)?).await?;
        }
        Command::Train => {
            let mut tracker = tracker(&cfg);
            stages::train_model(&cfg, tracker.as_mut()).await?;
        }
        Command::RegisterModel => {
            stages::register_model(&cfg, &hub(&cfg)?).await?;
        }
        Command::Deploy => {
            stages::deploy_app(&cfg, &hub(&cfg)?).await?;
        }
        Command::Serve => {
            serve::serve(&cfg).await?;
        }
    }
    Ok(())
}
