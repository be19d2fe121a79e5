use std::{path::PathBuf, process};

use anyhow::{ensure, Context};
use structopt::StructOpt;
use tracing_subscriber::*;

use fedlora_core::{RoundId, FIRST_ROUND};
use fedlora_server::{
    orchestrator::Orchestrator,
    settings::Settings,
    signal,
    stages::SimulatedStage,
    state_machine::{events::EventSubscriber, RoundSettings},
    storage::{ArtifactId, ArtifactStore, Discovery, ResultsLog},
};

#[macro_use]
extern crate tracing;

#[derive(Debug, StructOpt)]
#[structopt(name = "Coordinator")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Runs the federated rounds
    Run {
        /// Number of rounds to run [default: federation.rounds]
        #[structopt(long)]
        rounds: Option<u64>,
        /// Round to start with [default: 1]
        #[structopt(long, conflicts_with = "resume")]
        start_round: Option<RoundId>,
        /// Starts with the round after the latest aggregated adapter
        #[structopt(long)]
        resume: bool,
    },
    /// Prints the latest aggregated adapter
    Latest,
    /// Prints the artifact index statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::from_args();

    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let Settings {
        federation: federation_settings,
        model: model_settings,
        collection: collection_settings,
        storage: storage_settings,
        log: log_settings,
    } = settings;

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let store = ArtifactStore::open(&storage_settings)
        .await
        .with_context(|| {
            format!(
                "failed to open the artifact store in {:?}",
                storage_settings.root
            )
        })?;

    match opt.command {
        Command::Run {
            rounds,
            start_round,
            resume,
        } => {
            let num_rounds = rounds.unwrap_or(federation_settings.rounds);
            let stage = SimulatedStage::new(
                model_settings.clone(),
                federation_settings.seed,
                &storage_settings,
                store.clone(),
            );
            let (trigger, interrupt) = signal::interrupt();
            let (orchestrator, event_subscriber) = Orchestrator::new(
                RoundSettings {
                    federation: federation_settings,
                    collection: collection_settings,
                },
                model_settings,
                stage,
                store,
                ResultsLog::new(storage_settings.results_dir()),
                interrupt,
            );

            let start_round = if resume {
                orchestrator
                    .resume_round()
                    .await
                    .context("failed to discover the latest round")?
            } else {
                start_round.unwrap_or(FIRST_ROUND)
            };
            ensure!(
                start_round >= FIRST_ROUND,
                "rounds start at {}",
                FIRST_ROUND
            );

            tokio::spawn(async move {
                signal::shutdown().await;
                trigger.trigger();
            });
            tokio::spawn(log_phases(event_subscriber));

            let summary = orchestrator
                .run_from(start_round, num_rounds)
                .await
                .context("failed to persist the round results")?;
            info!("run finished with status {}", summary.status);
        }
        Command::Latest => match store.latest_round().await? {
            Discovery::Found(round) => {
                let metadata = store
                    .aggregation_metadata(round)
                    .await
                    .with_context(|| format!("failed to read the metadata of round {}", round))?;
                let dir = store.artifact_dir(&ArtifactId::Aggregated { round });
                println!("{}", dir.display());
                println!("{}", serde_json::to_string_pretty(&metadata)?);
            }
            Discovery::NotFound => {
                eprintln!(
                    "no aggregated adapter found, the next run starts with round {}",
                    Discovery::NotFound.round()
                );
                process::exit(2);
            }
        },
        Command::Stats => {
            println!("{}", serde_json::to_string_pretty(&store.stats().await)?);
        }
    }
    Ok(())
}

async fn log_phases(subscriber: EventSubscriber) {
    let mut listener = subscriber.phase_listener();
    while let Some(event) = listener.changed().await {
        debug!("round {} entered the {} phase", event.round, event.event);
    }
}
