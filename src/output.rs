use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;
use colored::*;
use serde_json::json;

use fwscope::classify::Classification;
use fwscope::dataset::BuildSummary;
use fwscope::label::FirewallLabel;
use fwscope::model::{ClassificationMetrics, EvaluationReport};
use fwscope::validate::{ValidationOutcome, ValidationReport};

use crate::cli::OutputFormat;

pub struct OutputWriter {
    format: OutputFormat,
    file: Option<PathBuf>,
}

impl OutputWriter {
    pub fn new(format: OutputFormat, file: Option<PathBuf>) -> Self {
        Self { format, file }
    }

    fn emit(&self, output: String) -> Result<()> {
        match &self.file {
            Some(path) => {
                let file = File::create(path)?;
                let mut writer = BufWriter::new(file);
                writer.write_all(output.as_bytes())?;
                writer.flush()?;
            }
            None => {
                print!("{}", output);
                io::stdout().flush()?;
            }
        }
        Ok(())
    }

    pub fn write_collection(&self, summary: &BuildSummary, dataset_path: &Path) -> Result<()> {
        let output = match self.format {
            OutputFormat::Json => {
                let flagged: Vec<_> = summary
                    .flagged
                    .iter()
                    .map(|f| json!({ "target": f.target, "iteration": f.iteration, "failures": f.failures }))
                    .collect();
                serde_json::to_string_pretty(&json!({
                    "dataset": dataset_path,
                    "rows": summary.dataset.len(),
                    "label_counts": summary.dataset.label_counts(),
                    "flagged": flagged,
                    "environment_failures": summary.environment,
                    "cancelled": summary.cancelled,
                }))? + "\n"
            }
            OutputFormat::Human => format_collection(summary, dataset_path),
        };
        self.emit(output)
    }

    pub fn write_training(
        &self,
        report: &EvaluationReport,
        model_path: &Path,
        report_path: &Path,
    ) -> Result<()> {
        let output = match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report)? + "\n",
            OutputFormat::Human => format_training(report, model_path, report_path),
        };
        self.emit(output)
    }

    pub fn write_classifications(&self, results: &[Classification]) -> Result<()> {
        let output = match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(results)? + "\n",
            OutputFormat::Human => match results {
                [single] => format_classification_detail(single),
                _ => format_classification_table(results),
            },
        };
        self.emit(output)
    }

    pub fn write_validation(
        &self,
        outcome: &ValidationOutcome,
        predictions_path: Option<&Path>,
    ) -> Result<()> {
        let output = match (self.format, outcome) {
            (OutputFormat::Json, ValidationOutcome::Evaluated(report)) => {
                serde_json::to_string_pretty(report)? + "\n"
            }
            (OutputFormat::Json, ValidationOutcome::Predicted(dataset)) => {
                serde_json::to_string_pretty(&json!({
                    "predictions": predictions_path,
                    "rows": dataset.len(),
                    "label_counts": dataset.label_counts(),
                }))? + "\n"
            }
            (OutputFormat::Human, ValidationOutcome::Evaluated(report)) => format_validation(report),
            (OutputFormat::Human, ValidationOutcome::Predicted(dataset)) => {
                let mut output = format!(
                    "\n{} {} rows had no labels; predictions written to {}\n",
                    "▶".truecolor(0, 255, 65).bold(),
                    dataset.len(),
                    predictions_path
                        .map(|p| p.display().to_string())
                        .unwrap_or_default()
                        .truecolor(255, 255, 255)
                        .bold()
                );
                output.push_str(&format_label_counts(&dataset.label_counts()));
                output
            }
        };
        self.emit(output)
    }
}

fn label_color(label: FirewallLabel) -> ColoredString {
    let name = label.name();
    match label {
        FirewallLabel::NoFirewall => name.truecolor(255, 64, 64).bold(),
        FirewallLabel::Stateless => name.truecolor(255, 140, 0).bold(),
        FirewallLabel::Stateful => name.truecolor(0, 255, 65).bold(),
        FirewallLabel::Proxy => name.truecolor(0, 212, 255).bold(),
    }
}

fn confidence_color(confidence: f64) -> ColoredString {
    let text = format!("{:.1}%", confidence * 100.0);
    if confidence >= 0.8 {
        text.truecolor(0, 255, 65).bold()
    } else if confidence >= 0.5 {
        text.truecolor(255, 140, 0).bold()
    } else {
        text.truecolor(255, 64, 64).bold()
    }
}

fn format_label_counts(counts: &[usize; FirewallLabel::COUNT]) -> String {
    let mut output = String::new();
    for label in FirewallLabel::ALL {
        output.push_str(&format!(
            "  {} {:<12} {}\n",
            u8::from(label).to_string().truecolor(128, 128, 128),
            label.name(),
            counts[label.index()].to_string().truecolor(255, 255, 255).bold()
        ));
    }
    output
}

fn format_collection(summary: &BuildSummary, dataset_path: &Path) -> String {
    let mut output = format!(
        "\n{}\n\n",
        "DATASET COLLECTION COMPLETE".truecolor(0, 255, 65).bold()
    );
    output.push_str(&format!(
        "{} {} {} {}\n",
        format!("{} rows", summary.dataset.len()).truecolor(0, 212, 255).bold(),
        "•".truecolor(64, 64, 64),
        "written to".truecolor(128, 128, 128),
        dataset_path.display().to_string().truecolor(255, 255, 255).bold()
    ));
    output.push_str(&format_label_counts(&summary.dataset.label_counts()));

    let unlabeled = summary.dataset.len() - summary.dataset.labeled_count();
    if unlabeled > 0 {
        output.push_str(&format!(
            "  {} {} unlabeled\n",
            "-".truecolor(128, 128, 128),
            unlabeled
        ));
    }
    for flagged in &summary.flagged {
        output.push_str(&format!(
            "{} {} iteration {}: all probes failed, sentinel row kept\n",
            "⚠".truecolor(255, 140, 0).bold(),
            flagged.target.to_string().truecolor(255, 255, 255),
            flagged.iteration
        ));
    }
    for failure in &summary.environment {
        output.push_str(&format!(
            "{} {} (check tools and privileges)\n",
            "⚠".truecolor(255, 140, 0).bold(),
            failure.to_string().truecolor(255, 140, 0)
        ));
    }
    if summary.cancelled {
        output.push_str(&format!(
            "{} {}\n",
            "⚠".truecolor(255, 140, 0).bold(),
            "run interrupted, partial dataset saved".truecolor(255, 140, 0)
        ));
    }
    output
}

fn format_metrics(metrics: &ClassificationMetrics) -> String {
    let mut output = format!(
        "  {} {}   {} {:.4}   {} {:.4}   {} {:.4}\n\n",
        "accuracy".truecolor(128, 128, 128),
        format!("{:.4}", metrics.accuracy).truecolor(0, 255, 65).bold(),
        "precision".truecolor(128, 128, 128),
        metrics.precision,
        "recall".truecolor(128, 128, 128),
        metrics.recall,
        "f1".truecolor(128, 128, 128),
        metrics.f1
    );
    output.push_str(&format!(
        "  {:<14}{:>10}{:>10}{:>10}{:>10}\n",
        "class", "precision", "recall", "f1", "support"
    ));
    for class in &metrics.per_class {
        output.push_str(&format!(
            "  {:<14}{:>10.4}{:>10.4}{:>10.4}{:>10}\n",
            class.name, class.precision, class.recall, class.f1, class.support
        ));
    }

    output.push_str(&format!("\n  {}\n", "confusion matrix (rows: true, cols: predicted)".truecolor(128, 128, 128)));
    output.push_str(&format!(
        "  {:<14}{}\n",
        "",
        FirewallLabel::ALL
            .iter()
            .map(|l| format!("{:>8}", u8::from(*l)))
            .collect::<String>()
    ));
    for (label, row) in FirewallLabel::ALL.iter().zip(&metrics.confusion_matrix) {
        output.push_str(&format!(
            "  {:<14}{}\n",
            label.name(),
            row.iter().map(|n| format!("{:>8}", n)).collect::<String>()
        ));
    }
    output
}

fn format_training(report: &EvaluationReport, model_path: &Path, report_path: &Path) -> String {
    let mut output = format!("\n{}\n\n", "MODEL TRAINING COMPLETE".truecolor(0, 255, 65).bold());
    output.push_str(&format!(
        "{} {} train {} {} test\n\n",
        "⟦".truecolor(64, 64, 64),
        report.train_samples.to_string().truecolor(191, 64, 191).bold(),
        "•".truecolor(0, 255, 65),
        report.test_samples.to_string().truecolor(191, 64, 191).bold()
    ));
    output.push_str(&format_metrics(&report.test));

    let cv = &report.cross_validation;
    output.push_str(&format!(
        "\n{} {}-fold cross-validation: mean {:.4} (± {:.4}), min {:.4}, max {:.4}\n",
        "▶".truecolor(0, 255, 65).bold(),
        cv.folds,
        cv.mean,
        cv.std,
        cv.min,
        cv.max
    ));

    let curve = &report.learning_curve;
    output.push_str(&format!("{} learning curve\n", "▶".truecolor(0, 255, 65).bold()));
    for ((size, train), test) in curve
        .train_sizes
        .iter()
        .zip(&curve.train_scores)
        .zip(&curve.test_scores)
    {
        output.push_str(&format!("  {:>6} rows  train {:.4}  test {:.4}\n", size, train, test));
    }
    let gap = format!("{:.4}", curve.generalization_gap);
    output.push_str(&format!(
        "  generalization gap {}\n",
        if curve.generalization_gap > 0.1 {
            gap.truecolor(255, 140, 0).bold()
        } else {
            gap.truecolor(0, 255, 65).bold()
        }
    ));

    output.push_str(&format!("{} feature importance\n", "▶".truecolor(0, 255, 65).bold()));
    for entry in report.ranked_importance() {
        let bar = "█".repeat((entry.importance.max(0.0) * 40.0).round() as usize);
        output.push_str(&format!(
            "  {:<22} {:>7.4} {}\n",
            entry.feature,
            entry.importance,
            bar.truecolor(0, 212, 255)
        ));
    }

    output.push_str(&format!(
        "\n{} {}\n{} {}\n",
        "model ".truecolor(128, 128, 128),
        model_path.display(),
        "report".truecolor(128, 128, 128),
        report_path.display()
    ));
    output
}

fn format_classification_detail(result: &Classification) -> String {
    let f = &result.features;
    let mut output = format!(
        "\n{} {} {} {} {}\n\n",
        "▶".truecolor(0, 255, 65).bold(),
        result.target.to_string().truecolor(255, 255, 255).bold(),
        "•".truecolor(64, 64, 64),
        label_color(result.label),
        confidence_color(result.confidence)
    );

    output.push_str(&format!("  {}\n", "key features".truecolor(128, 128, 128)));
    output.push_str(&format!("    icmp reachable      {}\n", f.icmp_reachable));
    output.push_str(&format!("    avg latency         {:.3} ms\n", f.avg_latency));
    output.push_str(&format!("    packet loss         {:.0}%\n", f.packet_loss * 100.0));
    output.push_str(&format!("    filtered ports      {}\n", f.filtered_ports_count));
    output.push_str(&format!("    syn/ack ratio       {:.2}\n", f.syn_ack_ratio));
    output.push_str(&format!("    tcp reset ratio     {:.2}\n", f.tcp_reset_ratio));
    output.push_str(&format!("    http response time  {:.1} ms\n", f.response_time));
    output.push_str(&format!("    headers modified    {}\n", f.header_modified));

    output.push_str(&format!("\n  {}\n", "probabilities".truecolor(128, 128, 128)));
    for (label, p) in FirewallLabel::ALL.iter().zip(&result.probabilities) {
        output.push_str(&format!("    {:<12} {:>6.1}%\n", label.name(), p * 100.0));
    }

    for failure in &result.failed_probes {
        output.push_str(&format!(
            "  {} {}\n",
            "⚠".truecolor(255, 140, 0).bold(),
            failure.to_string().truecolor(128, 128, 128)
        ));
    }
    output
}

fn format_classification_table(results: &[Classification]) -> String {
    let mut output = format!(
        "\n{}\n\n  {:<40} {:<12} {:>10}\n",
        "CLASSIFICATION SUMMARY".truecolor(0, 255, 65).bold(),
        "target",
        "firewall",
        "confidence"
    );
    for result in results {
        let label = format!("{:<12}", result.label.name());
        output.push_str(&format!(
            "  {:<40} {} {:>10}{}\n",
            result.target.to_string(),
            label.truecolor(0, 212, 255).bold(),
            format!("{:.1}%", result.confidence * 100.0),
            if result.failed_probes.is_empty() {
                String::new()
            } else {
                format!("  ({} probe(s) failed)", result.failed_probes.len())
            }
        ));
    }
    output
}

fn format_validation(report: &ValidationReport) -> String {
    let mut output = format!("\n{}\n\n", "VALIDATION REPORT".truecolor(0, 255, 65).bold());
    output.push_str(&format_metrics(&report.metrics));
    if report.skipped_unlabeled > 0 {
        output.push_str(&format!(
            "\n  {} unlabeled row(s) skipped\n",
            report.skipped_unlabeled
        ));
    }

    if report.misclassified.is_empty() {
        output.push_str(&format!(
            "\n{} {}\n",
            "⚡".truecolor(0, 255, 65).bold(),
            "no misclassified rows".truecolor(0, 255, 65)
        ));
    } else {
        output.push_str(&format!(
            "\n{} {} misclassified row(s)\n",
            "⚠".truecolor(255, 140, 0).bold(),
            report.misclassified.len()
        ));
        for miss in &report.misclassified {
            output.push_str(&format!(
                "  row {:>4}  {:<40} predicted {} ({:.1}%), actual {}\n",
                miss.row,
                miss.target.to_string(),
                label_color(miss.predicted),
                miss.confidence * 100.0,
                label_color(miss.actual)
            ));
            let f = &miss.features;
            output.push_str(&format!(
                "{}\n",
                format!(
                    "            icmp {} latency {:.3}ms loss {:.0}% ttl {} filtered {} scan {:.2}s syn/ack {:.2} rst {:.2} http {:.1}ms headers {}",
                    f.icmp_reachable as u8,
                    f.avg_latency,
                    f.packet_loss * 100.0,
                    f.ttl_return,
                    f.filtered_ports_count,
                    f.scan_time,
                    f.syn_ack_ratio,
                    f.tcp_reset_ratio,
                    f.response_time,
                    f.header_modified as u8
                )
                .truecolor(128, 128, 128)
            ));
        }
    }
    output
}
