use candle_core::{Tensor, D};
use candle_nn::ops::log_softmax;

use crate::{
    error::{Error, Result},
    utils::argmax_rows,
};

/// Loss and accuracy of one batch, or their size-weighted mean over a split.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Metrics {
    pub loss: f32,
    pub accuracy: f32,
}

impl Metrics {
    /// Rejects NaN/Inf so a diverged step never reaches the optimizer or the report.
    pub fn new(loss: f32, accuracy: f32) -> Result<Self> {
        if !loss.is_finite() {
            return Err(Error::numeric(format!("loss is {loss}")));
        }
        if !accuracy.is_finite() {
            return Err(Error::numeric(format!("accuracy is {accuracy}")));
        }
        Ok(Self { loss, accuracy })
    }
}

fn check_shapes(logits: &Tensor, labels: &Tensor) -> Result<(usize, usize)> {
    let (batch_sz, n_class) = logits
        .dims2()
        .map_err(|_| Error::shape(format!("logits must be rank 2, got {:?}", logits.shape())))?;
    let label_dims = labels
        .dims2()
        .map_err(|_| Error::shape(format!("labels must be rank 2, got {:?}", labels.shape())))?;
    if label_dims != (batch_sz, n_class) {
        return Err(Error::shape(format!(
            "logits {:?} and labels {:?} disagree",
            (batch_sz, n_class),
            label_dims
        )));
    }
    Ok((batch_sz, n_class))
}

/// Mean softmax cross-entropy against one-hot (or soft) labels, as a scalar tensor
/// that stays attached to the graph.
pub fn cross_entropy(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    check_shapes(logits, labels)?;
    let labels = labels.to_dtype(logits.dtype())?;
    // log_softmax subtracts the row max before exponentiating
    let log_probs = log_softmax(logits, D::Minus1)?;
    let per_example = (&labels * &log_probs)?.sum(D::Minus1)?.neg()?;
    Ok(per_example.mean_all()?)
}

/// Fraction of rows whose predicted class matches the labelled class.
pub fn accuracy(logits: &Tensor, labels: &Tensor) -> Result<f32> {
    let (batch_sz, _) = check_shapes(logits, labels)?;
    let predicted = argmax_rows(logits)?;
    let expected = argmax_rows(labels)?;
    let correct = predicted
        .iter()
        .zip(&expected)
        .filter(|(p, e)| p == e)
        .count();
    Ok(correct as f32 / batch_sz as f32)
}

/// Computes the graph-attached loss together with plain batch metrics.
pub fn loss_and_metrics(logits: &Tensor, labels: &Tensor) -> Result<(Tensor, Metrics)> {
    let loss = cross_entropy(logits, labels)?;
    let metrics = Metrics::new(loss.to_vec0::<f32>()?, accuracy(logits, labels)?)?;
    Ok((loss, metrics))
}
