mod cli;

use std::path::Path;

use anyhow::Result;
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;

use cf_adapters::{ProviderRegistry, ToolRegistry};
use cf_core::config::Config;
use cf_core::events::ProgressEvent;
use cf_core::{FrameSelection, RunId, Stage};
use cf_pipeline::{expand_inputs, RunHandle, RunManager, RunOutcome};
use cf_store::{CheckpointStatus, CheckpointStore};
use cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "captionforge=trace,cf_core=debug,cf_store=debug,cf_adapters=debug,cf_pipeline=debug"
                .to_string()
        } else {
            "captionforge=info,cf_core=info,cf_store=info,cf_adapters=info,cf_pipeline=info"
                .to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .init();

    let config = Config::load_or_default(cli.config.as_deref());

    match cli.command {
        Commands::Run {
            inputs,
            run_id,
            stages,
            provider,
            model,
            prompt_style,
            report,
            concurrency,
            timeout,
            frame_interval,
            scene_threshold,
        } => {
            let mut params = config.run_parameters();
            if let Some(stages) = stages {
                params.stages = Stage::parse_list(&stages)?;
            }
            if let Some(provider) = provider {
                params.provider = provider;
            }
            if let Some(model) = model {
                params.model = model;
            }
            if let Some(style) = prompt_style {
                params.prompt_style = style;
            }
            if let Some(n) = concurrency {
                params.max_concurrent = n;
            }
            if let Some(secs) = timeout {
                params.item_timeout_secs = secs;
            }
            if let Some(seconds) = frame_interval {
                params.frame_selection = FrameSelection::Interval { seconds };
            }
            if let Some(threshold) = scene_threshold {
                params.frame_selection = FrameSelection::Scene { threshold };
            }
            params.report_path = report;

            let sources = expand_inputs(&inputs)?;
            if sources.is_empty() {
                anyhow::bail!("No images or videos found in the given inputs");
            }
            let run_id = run_id.unwrap_or_default();

            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async {
                let manager = build_manager(&config);
                println!("Run {run_id}: {} sources", sources.len());
                let handle = manager.start(run_id, sources, params)?;
                drive(handle).await
            })
        }
        Commands::Resume { run_id } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async {
                let manager = build_manager(&config);
                let (handle, summary) = manager.recover(run_id)?;
                println!(
                    "Resuming run {run_id} at stage {}: {} done, {} failed, {} remaining",
                    summary.stage, summary.already_done, summary.failed, summary.remaining
                );
                if summary.stranded > 0 {
                    println!("  {} interrupted items queued again", summary.stranded);
                }
                drive(handle).await
            })
        }
        Commands::Status { run_id, json } => show_status(&config, run_id, json),
        Commands::List => list_runs(&config),
        Commands::RetryFailed { run_id, resume } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async {
                let manager = build_manager(&config);
                let count = manager.reprocess_failed(run_id)?;
                println!("Queued {count} failed items of run {run_id} again");
                if resume && count > 0 {
                    let (handle, _) = manager.recover(run_id)?;
                    return drive(handle).await;
                }
                Ok(())
            })
        }
        Commands::Discard { run_id } => {
            let manager = build_manager(&config);
            manager.acknowledge(run_id)?;
            println!("Discarded checkpoint of run {run_id}");
            Ok(())
        }
        Commands::CheckTools => check_tools(&config),
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
    }
}

fn build_manager(config: &Config) -> RunManager {
    for warning in config.validate() {
        tracing::warn!("Config: {warning}");
    }
    RunManager::new(
        CheckpointStore::new(config.checkpoint_dir.clone()),
        ProviderRegistry::from_config(&config.providers),
        ToolRegistry::discover(&config.tools),
    )
}

/// Print progress until the run ends. Ctrl-C asks for a stop at the next
/// item boundary.
async fn drive(handle: RunHandle) -> Result<()> {
    let run_id = handle.run_id();

    let mut events = handle.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(n)) => tracing::debug!("Skipped {n} progress events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let control = handle.control().clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nStopping after the items in flight finish...");
            control.stop();
        }
    });

    let outcome = handle.wait().await;
    interrupt.abort();
    // The printer ends once the run's event bus is dropped.
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), printer).await;

    match outcome? {
        RunOutcome::Completed(report) => {
            println!(
                "\nRun {run_id} complete: {} done, {} failed",
                report.counts.done, report.counts.failed
            );
            for failure in report.failures() {
                println!(
                    "  ✗ {} [{}]: {}",
                    failure.path.display(),
                    failure.stage,
                    failure.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        RunOutcome::Stopped(counts) => {
            println!(
                "\nRun {run_id} stopped: {} done, {} remaining",
                counts.done,
                counts.remaining()
            );
            println!("Continue with: captionforge resume {run_id}");
        }
    }
    Ok(())
}

fn print_event(event: &ProgressEvent) {
    println!(
        "[{}] {}/{} {} -> {:?} ({:.1}s, avg {:.1}s)",
        event.stage,
        event.index,
        event.total,
        event.item_id,
        event.new_state,
        event.elapsed_for_item.as_secs_f64(),
        event.running_average.as_secs_f64()
    );
}

fn show_status(config: &Config, run_id: RunId, json: bool) -> Result<()> {
    let manager = build_manager(config);
    let status = manager.status(run_id)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("Run: {}", status.run_id);
        println!("Phase: {:?}", status.phase);
        println!("Stage: {}", status.stage);
        let c = &status.counts;
        println!(
            "Items: {} total, {} done, {} failed, {} pending, {} processing, {} paused",
            c.total(),
            c.done,
            c.failed,
            c.pending,
            c.processing,
            c.paused
        );
    }

    Ok(())
}

fn list_runs(config: &Config) -> Result<()> {
    let manager = build_manager(config);
    let runs = manager.list_checkpoints()?;
    if runs.is_empty() {
        println!("No stored runs in {}", config.checkpoint_dir.display());
        return Ok(());
    }

    for run in runs {
        let description = match &run.status {
            Ok(CheckpointStatus::Resumable(summary)) => format!(
                "resumable at {} ({} done, {} failed, {} remaining)",
                summary.stage, summary.already_done, summary.failed, summary.remaining
            ),
            Ok(CheckpointStatus::Complete(counts)) => {
                format!("complete ({} done, {} failed)", counts.done, counts.failed)
            }
            Err(e) => format!("unreadable: {e}"),
        };
        let live = if run.live { " [live]" } else { "" };
        println!("{}{live}  {description}", run.run_id);
    }

    Ok(())
}

fn check_tools(config: &Config) -> Result<()> {
    println!("Checking external tools...\n");

    let tools = ToolRegistry::discover(&config.tools).check_all();
    let mut all_ok = true;

    for tool in &tools {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, tool.name);

        if let Some(ref version) = tool.version {
            print!(" ({})", version);
        }

        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }

        println!();
    }

    println!();
    if all_ok {
        println!("All required tools are available!");
    } else {
        println!("Some tools are missing. Video frames and image conversion need ffmpeg.");
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {}", p.display());
            Config::from_json(&std::fs::read_to_string(p)?)?
        }
        None => {
            println!("No config file specified, using defaults");
            Config::default()
        }
    };

    let warnings = config.validate();
    println!("✓ Configuration parsed");
    println!("  Checkpoints: {}", config.checkpoint_dir.display());
    println!("  Output: {}", config.output_dir.display());
    println!(
        "  Defaults: provider {}, model {}, stages {}",
        config.defaults.provider,
        config.defaults.model,
        config
            .defaults
            .stages
            .iter()
            .map(|s| s.name())
            .collect::<Vec<_>>()
            .join(",")
    );
    for warning in &warnings {
        println!("  ⚠ {warning}");
    }

    Ok(())
}
