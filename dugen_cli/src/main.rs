use dugen_core::config::{CommandEngineSettings, ConfigInputDelivery, DugenConfig, EngineType};
use dugen_core::engine::{CommandEngine, CoverageReport, InProcessEngine, TestEngine};
use dugen_core::generator::PutGenerator;
use dugen_core::handle::PutRecord;
use dugen_core::orchestrator::{CancellationToken, CycleOrchestrator, RunSummary};
use dugen_core::put_files::PutFileWriter;
use dugen_core::store::CoverageStore;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Replaces the program of the command engine.
    #[clap(long)]
    target_command: Option<String>,
    #[clap(short, long)]
    max_cycles: Option<usize>,
    /// Assembly identifier; `DUGEN_ASSEMBLY` still takes precedence.
    #[clap(short, long)]
    assembly: Option<String>,
    #[clap(short, long)]
    verbose: bool,
}

/// Reports the target pair of every PUT as covered. Lets a run be exercised
/// end to end without an external engine.
fn echo_harness(batch: &[PutRecord]) -> CoverageReport {
    CoverageReport {
        covered: batch.iter().map(|record| record.pair.to_candidate()).collect(),
        observed: Vec::new(),
    }
}

fn load_config(cli: &Cli) -> Result<DugenConfig, anyhow::Error> {
    match &cli.config_file {
        Some(config_path) => {
            info!("Loading configuration from specified path: {config_path:?}");
            DugenConfig::load_from_file(config_path)
        }
        None => {
            let default_config_path = PathBuf::from("dugen.toml");
            if default_config_path.exists() {
                info!("No config file specified, loading default: {default_config_path:?}");
                DugenConfig::load_from_file(&default_config_path)
            } else {
                info!("No config file specified and 'dugen.toml' not found, using defaults");
                Ok(DugenConfig::default())
            }
        }
    }
}

fn apply_overrides(cli: Cli, config: &mut DugenConfig) {
    if let Some(max_cycles) = cli.max_cycles {
        config.orchestrator.max_cycles = max_cycles;
    }
    if let Some(assembly) = cli.assembly {
        config.metadata.assembly = Some(assembly);
    }
    if let Some(target_cmd_str) = cli.target_command {
        if config.engine.engine_type == EngineType::Command {
            let cmd_settings =
                config
                    .engine
                    .command_settings
                    .get_or_insert_with(|| CommandEngineSettings {
                        command: Vec::new(),
                        input_delivery: ConfigInputDelivery::StdIn,
                        working_dir: None,
                    });
            if !cmd_settings.command.is_empty() {
                cmd_settings.command[0] = target_cmd_str;
            } else {
                cmd_settings.command.push(target_cmd_str);
            }
        } else {
            warn!("--target-command specified but engine type is not 'command', override ignored");
        }
    }
}

fn build_engine(config: &DugenConfig) -> Result<Box<dyn TestEngine>, anyhow::Error> {
    let engine: Box<dyn TestEngine> = match config.engine.engine_type {
        EngineType::InProcess => Box::new(InProcessEngine::new(echo_harness)),
        EngineType::Command => Box::new(CommandEngine::new(config.engine.command_engine_config()?)),
    };
    info!(engine = engine.name(), "Using test engine");
    Ok(engine)
}

fn print_summary(summary: &RunSummary) {
    println!("Run terminated: {:?}", summary.reason);
    for cycle in &summary.cycles {
        println!(
            "  cycle {:>3}: candidates {}, accepted {}, rejected {}, new pairs {}, PUTs {} (+{} resent), newly covered {}, engine {:?}",
            cycle.cycle,
            cycle.candidates,
            cycle.accepted,
            cycle.rejected,
            cycle.new_pairs,
            cycle.puts_emitted,
            cycle.puts_resent,
            cycle.newly_covered,
            cycle.engine
        );
    }
    for ty in &summary.store.types {
        println!(
            "  {}: {}/{} pairs covered, {} PUTs",
            ty.declaring_type, ty.covered, ty.pairs, ty.puts
        );
    }
    println!(
        "Total: {}/{} pairs covered, {} PUTs generated",
        summary.store.total_covered(),
        summary.store.total_pairs(),
        summary.store.total_puts()
    );
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = load_config(&cli)?;
    apply_overrides(cli, &mut config);
    info!("Effective configuration: {config:#?}");

    let views = config.metadata.load_views(config.orchestrator.view_policy)?;

    let store = match &config.store.persist_path {
        Some(path) => Arc::new(
            CoverageStore::open(path, config.store.snapshot_format)
                .map_err(|e| anyhow::anyhow!("Failed to open store at {:?}: {}", path, e))?,
        ),
        None => Arc::new(CoverageStore::new()),
    };

    let generator = PutGenerator::new(Arc::clone(&store), config.generation.build_strategy()?)
        .with_threads(config.orchestrator.threads);
    let engine = build_engine(&config)?;

    let mut orchestrator = CycleOrchestrator::new(
        Arc::clone(&store),
        views,
        generator,
        engine,
        config.orchestrator.settings(),
    );
    if let Some(put_dir) = &config.output.put_dir {
        orchestrator = orchestrator.with_put_writer(PutFileWriter::new(put_dir)?);
    }
    if let Some(path) = &config.store.persist_path {
        orchestrator = orchestrator.with_persistence(path, config.store.snapshot_format);
    }

    // Nothing cancels this token here. An interrupted process keeps the
    // snapshot saved after the last finished cycle.
    let start_time = Instant::now();
    let summary = orchestrator.run(&CancellationToken::new());
    info!("Run finished in {:.2?}", start_time.elapsed());
    print_summary(&summary);

    Ok(())
}
