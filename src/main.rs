use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use textcnn_rs::{
    config::Config, dataset::DataBundle, logging, utils::device, FitOutcome, Trainer,
};

#[derive(Debug, Parser)]
#[command(name = "textcnn", about = "Train a 1-D CNN sentence classifier")]
struct Cli {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Train on the train split with early stopping on the dev split
    Train {
        /// JSON hyperparameter file; defaults are used when omitted
        #[arg(long)]
        config: Option<PathBuf>,
        /// safetensors file with embeddings, x_train, y_train, x_dev, y_dev [, x_test, y_test]
        #[arg(long)]
        data: PathBuf,
        /// Run on CPU even when an accelerator is available
        #[arg(long)]
        cpu: bool,
    },
}

fn train_model(config: Config, data: PathBuf, cpu: bool) -> Result<()> {
    let device = device(cpu)?;
    let bundle = DataBundle::load(&data, &config, &device)
        .with_context(|| format!("loading {}", data.display()))?;

    tracing::info!("train dataset: {}", bundle.train.len());
    tracing::info!("dev dataset: {}", bundle.dev.len());

    let mut trainer = Trainer::new(config, &bundle.embeddings, &device)?;
    let report = trainer.fit(&bundle.train, &bundle.dev)?;
    match report.outcome {
        FitOutcome::Completed => tracing::info!(
            steps = report.state.global_step,
            best_dev_accuracy = report.state.best_dev_accuracy,
            "training completed in {:.0?}",
            report.elapsed
        ),
        FitOutcome::EarlyStopped => tracing::info!(
            steps = report.state.global_step,
            best_dev_accuracy = report.state.best_dev_accuracy,
            "training stopped early in {:.0?}",
            report.elapsed
        ),
        FitOutcome::Cancelled => tracing::warn!("training cancelled"),
    }

    if let Some(test) = &bundle.test {
        let metrics = trainer.evaluate(test)?;
        tracing::info!(
            "Test Loss: {:>6.2}, Test Acc: {:>6.2}%",
            metrics.loss,
            metrics.accuracy * 100.0
        );
    }

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match cli.command {
        Command::Train { config, data, cpu } => {
            let config = match config {
                Some(path) => Config::from_file(&path)
                    .with_context(|| format!("reading config {}", path.display()))?,
                None => Config::default(),
            };
            tracing::debug!(?config, "configuration");
            train_model(config, data, cpu)?;
        }
    }

    Ok(())
}
