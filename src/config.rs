use std::{fs, path::Path, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

fn default_require_improvement() -> usize {
    300
}

fn default_eval_every() -> usize {
    1
}

/// Hyperparameters for the model and the training loop.
///
/// Supplied once at model construction and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Whether the pretrained embedding matrix is trained along with the rest.
    pub update_embeddings: bool,
    pub n_class: usize,
    pub max_sen_len: usize,
    pub embedding_dim: usize,
    pub batch_size: usize,
    pub num_filters: usize,
    pub kernel_size: usize,
    pub n_hidden: usize,
    pub n_epoch: usize,
    pub learning_rate: f64,
    /// Probability of keeping a hidden unit in train mode.
    pub drop_keep_prob: f32,

    /// Steps without a dev-accuracy improvement before training stops.
    #[serde(default = "default_require_improvement")]
    pub require_improvement: usize,
    /// Run the dev evaluation every `eval_every` training steps.
    #[serde(default = "default_eval_every")]
    pub eval_every: usize,
    /// When set, trainable variables are saved here whenever dev accuracy improves.
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
    /// Seed for batch shuffling. `None` draws from OS entropy.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            update_embeddings: true,
            n_class: 8,
            max_sen_len: 50,
            embedding_dim: 50,
            batch_size: 160,
            num_filters: 256,
            kernel_size: 3,
            n_hidden: 256,
            n_epoch: 5,
            learning_rate: 0.01,
            drop_keep_prob: 0.4,
            require_improvement: default_require_improvement(),
            eval_every: default_eval_every(),
            checkpoint_dir: None,
            seed: None,
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("n_class", self.n_class),
            ("max_sen_len", self.max_sen_len),
            ("embedding_dim", self.embedding_dim),
            ("batch_size", self.batch_size),
            ("num_filters", self.num_filters),
            ("kernel_size", self.kernel_size),
            ("n_hidden", self.n_hidden),
            ("n_epoch", self.n_epoch),
            ("eval_every", self.eval_every),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(Error::config(format!("{name} must be greater than 0")));
        }
        if self.kernel_size > self.max_sen_len {
            return Err(Error::config(format!(
                "kernel_size ({}) must not exceed max_sen_len ({})",
                self.kernel_size, self.max_sen_len
            )));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::config(format!(
                "learning_rate must be a positive number, got {}",
                self.learning_rate
            )));
        }
        if !(self.drop_keep_prob > 0.0 && self.drop_keep_prob <= 1.0) {
            return Err(Error::config(format!(
                "drop_keep_prob must be in (0, 1], got {}",
                self.drop_keep_prob
            )));
        }
        Ok(())
    }

    /// Length of the feature map produced by the valid convolution.
    pub fn conv_out_len(&self) -> usize {
        self.max_sen_len - self.kernel_size + 1
    }

    /// Dropout probability as expected by `candle_nn::Dropout`.
    pub fn drop_p(&self) -> f32 {
        1.0 - self.drop_keep_prob
    }
}
