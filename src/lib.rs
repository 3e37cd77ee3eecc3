pub mod classifier_head;
pub mod config;
pub mod conv1d;
pub mod dataset;
pub mod embeddings;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod optimizer;
pub mod text_cnn;
pub mod train;
pub mod utils;

pub use config::Config;
pub use dataset::{DataBundle, Dataset};
pub use error::{Error, Result};
pub use text_cnn::{Mode, TextCnn};
pub use train::{evaluate, FitOutcome, FitReport, Trainer, TrainingState};
