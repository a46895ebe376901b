use crate::database::Stage;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "podcast-orchestrator")]
#[command(author, version, about = "Download, transcription and enrichment worker orchestration")]
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
    /// Run the control loop that keeps every stage's worker pool filled
    Supervise,

    /// Process one feed's items for one stage until none are left
    Worker {
        /// download, transcribe or enrich
        #[arg(long)]
        stage: Stage,

        /// Feed (queue) name
        #[arg(long)]
        feed: String,
    },

    /// Fetch feed catalogs and record new entries as pending items
    Discover {
        /// Only this feed; every feed with a URL otherwise
        #[arg(long)]
        feed: Option<String>,
    },

    /// Reset items stuck in progress after a crash and clear stale locks
    Recover,

    /// Print item counts per status and per queue as JSON
    Stats {
        /// Restrict status counts to one queue
        #[arg(long)]
        queue: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_worker() {
        let cli = Cli::try_parse_from([
            "podcast-orchestrator",
            "--config",
            "orchestrator.yaml",
            "worker",
            "--stage",
            "transcribe",
            "--feed",
            "PodX",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("orchestrator.yaml")));
        match cli.command {
            Commands::Worker { stage, feed } => {
                assert_eq!(stage, Stage::Transcribe);
                assert_eq!(feed, "PodX");
            }
            _ => panic!("expected worker subcommand"),
        }
    }

    #[test]
    fn test_unknown_stage_rejected() {
        let result = Cli::try_parse_from([
            "podcast-orchestrator",
            "worker",
            "--stage",
            "diarize",
            "--feed",
            "PodX",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_discover_without_feed() {
        let cli = Cli::try_parse_from(["podcast-orchestrator", "discover"]).unwrap();
        assert!(matches!(cli.command, Commands::Discover { feed: None }));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["podcast-orchestrator", "stats", "-v", "--queue", "PodX"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Stats { queue: Some(ref q) } if q == "PodX"));
    }
}
