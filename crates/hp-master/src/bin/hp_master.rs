//! Runs one experiment to completion against in-process collaborators.
//!
//! Usage: `hp-master [experiment.json]`. The path may also come from
//! `HPX_EXPERIMENT_CONFIG`; without either a small random search is run.
//! Controller settings are read from the JSON file named by
//! `HPX_CONTROLLER_CONFIG`, then from `HPX_*` overrides.

use anyhow::Context;
use hp_master::{
    spawn_experiment, Collaborators, ControllerConfig, JobRegistry, LoggingCheckpointGc,
    MemoryResourceManager, MemoryStore, SimulatedLauncher,
};
use hp_types::{Experiment, ExperimentConfig, HyperparameterSpace, Length, SearcherConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn load_experiment_config() -> anyhow::Result<ExperimentConfig> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("HPX_EXPERIMENT_CONFIG").ok());
    let Some(path) = path else {
        return Ok(ExperimentConfig::new(
            "demo",
            SearcherConfig::random(4, Length::batches(100)),
        )
        .with_hyperparameters(
            HyperparameterSpace::new()
                .add_int("layers", 1, 8)
                .add_log("learning_rate", -5.0, -1.0, 10.0, None),
        ));
    };
    let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_experiment_config()?;
    config.validate().context("invalid experiment config")?;
    let settings_path = std::env::var_os("HPX_CONTROLLER_CONFIG").map(PathBuf::from);
    let settings = ControllerConfig::load(settings_path.as_deref())?;

    let store = Arc::new(MemoryStore::new());
    let (jobs, job_events) = JobRegistry::with_events();
    let deps = Collaborators {
        store: store.clone(),
        rm: Arc::new(MemoryResourceManager::default()),
        launcher: Arc::new(SimulatedLauncher),
        gc: Arc::new(LoggingCheckpointGc),
        jobs,
    };

    let experiment = Experiment::new(1, config, 1, "hp");
    info!(name = %experiment.config.name, job_id = %experiment.job_id, "submitting experiment");
    let running = spawn_experiment(experiment, deps, settings).await?;
    let experiment = running.wait().await?;

    for event in job_events.try_iter() {
        info!(?event, "job event");
    }
    info!(
        state = %experiment.state,
        progress = experiment.progress.unwrap_or_default(),
        "experiment finished"
    );
    Ok(())
}
