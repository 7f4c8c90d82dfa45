use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use fwscope::validate::MixedLabelPolicy;

#[derive(Parser, Debug)]
#[command(name = "fwscope")]
#[command(author = "FwScope")]
#[command(version = "0.1.0")]
#[command(about = "Fingerprint firewall types from externally observable probe behavior", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true, help = "Config file (default: <config dir>/fwscope/config.json if present)")]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Log tool invocations, exit codes and parsed features")]
    pub debug: bool,

    #[arg(long, global = true, value_enum, default_value = "human", help = "Output format")]
    pub format: OutputFormat,

    #[arg(short = 'f', long, global = true, help = "Write the result summary to this file instead of stdout")]
    pub output_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Probe targets and append labeled feature rows to a dataset
    Collect {
        #[arg(help = "Target IP, hostname, IP range (IP1-IP2), or CIDR. Can be specified multiple times.")]
        targets: Vec<String>,

        #[arg(short = 'i', long, help = "File with one target spec per line")]
        targets_file: Option<PathBuf>,

        #[arg(short, long, help = "Label assignments, e.g. 192.168.56.10=0,192.168.56.11=3 (0 none, 1 stateless, 2 stateful, 3 proxy)")]
        labels: Option<String>,

        #[arg(short, long, help = "Samples per target (default: collection.repeat)")]
        repeat: Option<u32>,

        #[arg(short, long, default_value = "data/firewall_dataset.csv", help = "Dataset CSV to write")]
        output: PathBuf,

        #[arg(long, help = "Replace the dataset instead of appending to it")]
        overwrite: bool,

        #[arg(long, help = "Abort if any sample has every probe fail")]
        strict: bool,
    },

    /// Train a classifier on a labeled dataset
    Train {
        #[arg(default_value = "data/firewall_dataset.csv")]
        dataset: PathBuf,

        #[arg(short, long, help = "Model artifact path (default: artifacts.model)")]
        model: Option<PathBuf>,

        #[arg(short, long, help = "Evaluation report path (default: artifacts.report)")]
        report: Option<PathBuf>,
    },

    /// Probe live targets and predict their firewall type
    Classify {
        #[arg(help = "Target IP, hostname, IP range (IP1-IP2), or CIDR. Can be specified multiple times.")]
        targets: Vec<String>,

        #[arg(short = 'i', long, help = "File with one target spec per line")]
        targets_file: Option<PathBuf>,

        #[arg(short, long, help = "Model artifact path (default: artifacts.model)")]
        model: Option<PathBuf>,
    },

    /// Score a trained model against a pre-collected dataset
    Validate {
        dataset: PathBuf,

        #[arg(short, long, help = "Model artifact path (default: artifacts.model)")]
        model: Option<PathBuf>,

        #[arg(long, value_enum, help = "Handling of partially labeled datasets (default: validation.mixed_labels)")]
        mixed_labels: Option<MixedLabels>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq)]
pub enum OutputFormat {
    #[value(name = "human", help = "Human-readable output")]
    Human,
    #[value(name = "json", help = "JSON output")]
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq)]
pub enum MixedLabels {
    #[value(name = "unlabeled", help = "Predict every row")]
    Unlabeled,
    #[value(name = "evaluate", help = "Score the labeled rows only")]
    Evaluate,
    #[value(name = "reject", help = "Refuse the dataset")]
    Reject,
}

impl From<MixedLabels> for MixedLabelPolicy {
    fn from(value: MixedLabels) -> Self {
        match value {
            MixedLabels::Unlabeled => MixedLabelPolicy::TreatAsUnlabeled,
            MixedLabels::Evaluate => MixedLabelPolicy::EvaluateLabeled,
            MixedLabels::Reject => MixedLabelPolicy::Reject,
        }
    }
}
