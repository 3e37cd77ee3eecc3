use std::{
    fs,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    config::Config,
    dataset::{batch_indices, BatchIter, Dataset},
    error::{Error, Result},
    metrics::{loss_and_metrics, Metrics},
    optimizer::ParameterUpdater,
    text_cnn::{Mode, TextCnn},
};

pub const CHECKPOINT_FILE: &str = "best.safetensors";

/// Stop-criterion bookkeeping for one `fit` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingState {
    pub best_dev_accuracy: f32,
    pub last_improved_step: usize,
    pub global_step: usize,
}

impl Default for TrainingState {
    fn default() -> Self {
        Self {
            best_dev_accuracy: 0.0,
            last_improved_step: 0,
            global_step: 0,
        }
    }
}

impl TrainingState {
    /// Counts a finished training step and returns its 1-based index.
    pub fn advance(&mut self) -> usize {
        self.global_step += 1;
        self.global_step
    }

    /// Records a dev accuracy for the current step; true when it beats the best so far.
    pub fn observe(&mut self, dev_accuracy: f32) -> bool {
        if dev_accuracy > self.best_dev_accuracy {
            self.best_dev_accuracy = dev_accuracy;
            self.last_improved_step = self.global_step;
            true
        } else {
            false
        }
    }

    pub fn steps_since_improvement(&self) -> usize {
        self.global_step - self.last_improved_step
    }

    /// The last improving step has been followed by `require_improvement` more.
    pub fn should_stop(&self, require_improvement: usize) -> bool {
        self.steps_since_improvement() >= require_improvement
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitOutcome {
    Completed,
    EarlyStopped,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct StepReport {
    pub epoch: usize,
    pub step: usize,
    pub train: Metrics,
    /// `None` on steps skipped by `eval_every`.
    pub dev: Option<Metrics>,
    pub improved: bool,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct FitReport {
    pub outcome: FitOutcome,
    pub state: TrainingState,
    pub steps: Vec<StepReport>,
    pub elapsed: Duration,
}

/// Shared flag checked before every training step.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Size-weighted mean loss and accuracy over a whole split, in eval mode.
pub fn evaluate(model: &TextCnn, dataset: &Dataset, batch_size: usize) -> Result<Metrics> {
    let num = dataset.len();
    if num == 0 {
        return Err(Error::numeric("cannot average metrics over an empty dataset"));
    }

    let (mut total_loss, mut total_acc) = (0f64, 0f64);
    for batch in dataset.batches(BatchIter::sequential(num, batch_size)) {
        let (xs, ys, n) = batch?;
        let logits = model.forward(&xs, Mode::Eval)?;
        let (_, metrics) = loss_and_metrics(&logits, &ys)?;
        total_loss += metrics.loss as f64 * n as f64;
        total_acc += metrics.accuracy as f64 * n as f64;
    }

    Metrics::new(
        (total_loss / num as f64) as f32,
        (total_acc / num as f64) as f32,
    )
}

/// Owns the model, its variables and the optimizer for a training run.
pub struct Trainer {
    config: Config,
    model: TextCnn,
    varmap: VarMap,
    updater: ParameterUpdater,
    rng: StdRng,
    cancel: CancelToken,
}

impl Trainer {
    pub fn new(config: Config, embeddings: &Tensor, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let model = TextCnn::new(&config, embeddings, &varmap, device)?;
        let updater = ParameterUpdater::new(&varmap, config.learning_rate)?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            config,
            model,
            varmap,
            updater,
            rng,
            cancel: CancelToken::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn model(&self) -> &TextCnn {
        &self.model
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Handle that stops `fit` before its next training step.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Forward in train mode, loss, then one optimizer update.
    ///
    /// The update runs only after the loss is known to be finite.
    pub fn train_step(&mut self, xs: &Tensor, ys: &Tensor) -> Result<Metrics> {
        let logits = self.model.forward(xs, Mode::Train)?;
        let (loss, metrics) = loss_and_metrics(&logits, ys)?;
        self.updater.step(&loss)?;
        Ok(metrics)
    }

    pub fn evaluate(&self, dataset: &Dataset) -> Result<Metrics> {
        evaluate(&self.model, dataset, self.config.batch_size)
    }

    fn checkpoint_path(&self) -> Option<PathBuf> {
        self.config
            .checkpoint_dir
            .as_ref()
            .map(|dir| dir.join(CHECKPOINT_FILE))
    }

    fn save_checkpoint(&self) -> Result<()> {
        if let Some(path) = self.checkpoint_path() {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            self.varmap.save(&path)?;
            tracing::debug!(path = %path.display(), "saved checkpoint");
        }
        Ok(())
    }

    /// Trains on `train`, evaluating on `dev` after every `eval_every` steps,
    /// until the epochs run out, dev accuracy stalls, or the run is cancelled.
    pub fn fit(&mut self, train: &Dataset, dev: &Dataset) -> Result<FitReport> {
        tracing::info!("Training and evaluating...");
        let start_time = Instant::now();
        let mut state = TrainingState::default();
        let mut steps = Vec::new();

        let finish = |outcome, state, steps| FitReport {
            outcome,
            state,
            steps,
            elapsed: start_time.elapsed(),
        };

        for epoch in 0..self.config.n_epoch {
            tracing::info!("Epoch: {}", epoch + 1);
            let indices = batch_indices(train.len(), self.config.batch_size, true, &mut self.rng);

            for batch in train.batches(indices) {
                if self.cancel.is_cancelled() {
                    tracing::warn!(step = state.global_step, "training cancelled");
                    return Ok(finish(FitOutcome::Cancelled, state, steps));
                }

                let (xs, ys, _) = batch?;
                let train_metrics = self.train_step(&xs, &ys)?;
                let step = state.advance();

                let dev_metrics = if step % self.config.eval_every == 0 {
                    Some(self.evaluate(dev)?)
                } else {
                    None
                };
                let improved = dev_metrics.map_or(false, |m| state.observe(m.accuracy));
                if improved {
                    self.save_checkpoint()?;
                }

                let elapsed = start_time.elapsed();
                let improved_str = if improved { "*" } else { "" };
                match dev_metrics {
                    Some(dev) => tracing::info!(
                        "Iter: {:>6}, Train Loss: {:>6.2}, Train Acc: {:>6.2}%, Val Loss: {:>6.2}, Val Acc: {:>6.2}%, Time: {:.0?} {}",
                        step,
                        train_metrics.loss,
                        train_metrics.accuracy * 100.0,
                        dev.loss,
                        dev.accuracy * 100.0,
                        elapsed,
                        improved_str
                    ),
                    None => tracing::info!(
                        "Iter: {:>6}, Train Loss: {:>6.2}, Train Acc: {:>6.2}%, Time: {:.0?}",
                        step,
                        train_metrics.loss,
                        train_metrics.accuracy * 100.0,
                        elapsed
                    ),
                }

                steps.push(StepReport {
                    epoch,
                    step,
                    train: train_metrics,
                    dev: dev_metrics,
                    improved,
                    elapsed,
                });

                if state.should_stop(self.config.require_improvement) {
                    tracing::warn!(
                        step,
                        best_dev_accuracy = state.best_dev_accuracy,
                        last_improved_step = state.last_improved_step,
                        "No optimization for a long time, auto-stopping..."
                    );
                    return Ok(finish(FitOutcome::EarlyStopped, state, steps));
                }
            }
        }

        Ok(finish(FitOutcome::Completed, state, steps))
    }
}
