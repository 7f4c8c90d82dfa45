mod cli;
mod output;

use std::net::IpAddr;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fwscope::classify::FirewallClassifier;
use fwscope::config::{parse_label_map, FingerprintConfig};
use fwscope::dataset::{Dataset, DatasetBuilder};
use fwscope::error::FwError;
use fwscope::features::FeatureExtractor;
use fwscope::model::{train, TrainedModel};
use fwscope::network::collect_targets;
use fwscope::probe::command::missing_tools;
use fwscope::probe::{is_root, CommandProbeAdapter};
use fwscope::validate::{predictions_path, validate, MixedLabelPolicy, ValidationOutcome};

use crate::cli::{Cli, Command, OutputFormat};
use crate::output::OutputWriter;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("fwscope={}", default_level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {:#}", "Error:".red().bold(), err);
            let code = err
                .downcast_ref::<FwError>()
                .map(FwError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code as u8)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = FingerprintConfig::load(cli.config.as_deref())?;
    let writer = OutputWriter::new(cli.format, cli.output_file.clone());

    match cli.command {
        Command::Collect {
            targets,
            targets_file,
            labels,
            repeat,
            output,
            overwrite,
            strict,
        } => {
            let mut config = match labels {
                Some(spec) => config.with_labels(parse_label_map(&spec)?),
                None => config,
            };
            if strict {
                config.collection.strict = true;
            }
            let repeat = repeat.unwrap_or(config.collection.repeat);
            let targets = collect_targets(&targets, targets_file.as_deref())?;
            preflight()?;

            let unlabeled: Vec<String> = targets
                .iter()
                .filter(|t| !config.labels.contains_key(*t))
                .map(IpAddr::to_string)
                .collect();
            if !unlabeled.is_empty() {
                warn!("no label for {}; rows will be unlabeled", unlabeled.join(", "));
            }

            let config = Arc::new(config);
            let adapter = CommandProbeAdapter::new(config.probes.clone());
            let builder = DatasetBuilder::new(FeatureExtractor::new(adapter, config.clone()))
                .with_progress(cli.format == OutputFormat::Human);

            let cancel = builder.cancel_flag();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, stopping after the current sample");
                    cancel.store(true, Ordering::SeqCst);
                }
            });

            info!(
                "collecting {} target(s) x {} iteration(s) into {}",
                targets.len(),
                repeat,
                output.display()
            );
            let summary = builder.build(&targets, &config.labels, repeat).await?;

            if overwrite {
                summary.dataset.save(&output)?;
            } else {
                summary.dataset.append_to(&output)?;
            }
            writer.write_collection(&summary, &output)?;
        }

        Command::Train {
            dataset,
            model,
            report,
        } => {
            let model_path = model.unwrap_or_else(|| config.artifacts.model.clone());
            let report_path = report.unwrap_or_else(|| config.artifacts.report.clone());

            let data = Dataset::load(&dataset)?;
            info!("loaded {} rows from {}", data.len(), dataset.display());
            let (trained, evaluation) = train(&data, &config.training)?;

            trained
                .save(&model_path)
                .with_context(|| format!("saving model to {}", model_path.display()))?;
            evaluation
                .save(&report_path)
                .with_context(|| format!("saving report to {}", report_path.display()))?;
            writer.write_training(&evaluation, &model_path, &report_path)?;
        }

        Command::Classify {
            targets,
            targets_file,
            model,
        } => {
            let model_path = model.unwrap_or_else(|| config.artifacts.model.clone());
            let trained: TrainedModel = TrainedModel::load(&model_path)?;
            let targets = collect_targets(&targets, targets_file.as_deref())?;
            preflight()?;

            let config = Arc::new(config);
            let adapter = CommandProbeAdapter::new(config.probes.clone());
            let classifier = FirewallClassifier::new(trained, FeatureExtractor::new(adapter, config))?;
            let results = classifier.classify_batch(&targets).await?;
            writer.write_classifications(&results)?;
        }

        Command::Validate {
            dataset,
            model,
            mixed_labels,
        } => {
            let model_path = model.unwrap_or_else(|| config.artifacts.model.clone());
            let trained: TrainedModel = TrainedModel::load(&model_path)?;
            let data = Dataset::load(&dataset)?;
            let policy = mixed_labels
                .map(MixedLabelPolicy::from)
                .unwrap_or(config.validation.mixed_labels);

            let outcome = validate(&data, &trained, policy)?;
            let written = match &outcome {
                ValidationOutcome::Predicted(predicted) => {
                    let path = predictions_path(&dataset);
                    predicted.save_predictions(&path)?;
                    Some(path)
                }
                ValidationOutcome::Evaluated(_) => None,
            };
            writer.write_validation(&outcome, written.as_deref())?;
        }
    }

    Ok(())
}

/// Probe tools must be present; raw-socket probes degrade without root.
fn preflight() -> Result<()> {
    let missing = missing_tools();
    if !missing.is_empty() {
        return Err(FwError::ToolsUnavailable(missing).into());
    }
    if !is_root() {
        warn!("not running as root: port scan falls back to connect scan and SYN probes may fail");
    }
    Ok(())
}
