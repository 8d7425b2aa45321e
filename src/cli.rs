use cf_core::RunId;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "captionforge")]
#[command(author, version, about = "Resumable batch captioning for images and video frames")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a new run over directories and/or media files
    Run {
        /// Directories to scan or files to process
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Run id (a new one is generated if omitted)
        #[arg(long)]
        run_id: Option<RunId>,

        /// Comma-separated stage list, e.g. "acquire,normalize,annotate,report"
        #[arg(long)]
        stages: Option<String>,

        /// Annotation provider
        #[arg(long)]
        provider: Option<String>,

        /// Model passed to the provider
        #[arg(long)]
        model: Option<String>,

        /// Prompt style (concise, detailed, alt-text, keywords)
        #[arg(long)]
        prompt_style: Option<String>,

        /// Write the final report to this file
        #[arg(long)]
        report: Option<PathBuf>,

        /// Maximum items in flight at once
        #[arg(long)]
        concurrency: Option<usize>,

        /// Per-item timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Extract one video frame every N seconds
        #[arg(long, conflicts_with = "scene_threshold")]
        frame_interval: Option<f64>,

        /// Extract one video frame per scene change above this score (0.0 - 1.0)
        #[arg(long)]
        scene_threshold: Option<f64>,
    },

    /// Resume an interrupted run from its checkpoint
    Resume {
        run_id: RunId,
    },

    /// Show the state of a stored run
    Status {
        run_id: RunId,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List stored checkpoints
    List,

    /// Queue the failed items of a stored run again
    RetryFailed {
        run_id: RunId,

        /// Resume the run right away
        #[arg(long)]
        resume: bool,
    },

    /// Delete the checkpoint of a finished run
    Discard {
        run_id: RunId,
    },

    /// Check that required external tools are available
    CheckTools,

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        config: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_takes_overrides() {
        let cli = Cli::try_parse_from([
            "captionforge",
            "--verbose",
            "run",
            "photos",
            "clip.mp4",
            "--stages",
            "acquire,annotate",
            "--concurrency",
            "4",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Run {
                inputs,
                stages,
                concurrency,
                run_id,
                ..
            } => {
                assert_eq!(inputs, vec![PathBuf::from("photos"), PathBuf::from("clip.mp4")]);
                assert_eq!(stages.as_deref(), Some("acquire,annotate"));
                assert_eq!(concurrency, Some(4));
                assert!(run_id.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn frame_options_are_exclusive() {
        let parsed = Cli::try_parse_from([
            "captionforge",
            "run",
            "clip.mp4",
            "--frame-interval",
            "2",
            "--scene-threshold",
            "0.4",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn run_ids_must_be_uuids() {
        assert!(Cli::try_parse_from(["captionforge", "resume", "not-a-run"]).is_err());
        let id = RunId::new();
        let arg = id.to_string();
        let cli = Cli::try_parse_from(["captionforge", "resume", arg.as_str()]).unwrap();
        assert!(matches!(cli.command, Commands::Resume { run_id } if run_id == id));
    }
}
