use candle_core::Tensor;
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};

use crate::error::Result;

/// Adam over every trainable variable of a `VarMap`.
///
/// `AdamW` with zero weight decay reduces to plain bias-corrected Adam.
pub struct ParameterUpdater {
    optimizer: AdamW,
    steps: usize,
}

impl ParameterUpdater {
    pub fn new(varmap: &VarMap, learning_rate: f64) -> Result<Self> {
        let params = ParamsAdamW {
            lr: learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        };
        let optimizer = AdamW::new(varmap.all_vars(), params)?;
        Ok(Self {
            optimizer,
            steps: 0,
        })
    }

    /// Backpropagates `loss` and applies exactly one update to every variable.
    pub fn step(&mut self, loss: &Tensor) -> Result<()> {
        self.optimizer.backward_step(loss)?;
        self.steps += 1;
        Ok(())
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};
    use candle_nn::{Init, VarBuilder};

    use super::*;

    #[test]
    fn test_first_step_moves_by_learning_rate() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let x = vb.get_with_hints(1, "x", Init::Const(0.)).unwrap();

        let mut updater = ParameterUpdater::new(&varmap, 0.1).unwrap();
        // d/dx (x - 3)^2 is negative at 0, so Adam steps by +lr
        let loss = (&x - 3.0).unwrap().sqr().unwrap().sum_all().unwrap();
        updater.step(&loss).unwrap();

        let x = varmap.all_vars()[0].to_vec1::<f32>().unwrap()[0];
        assert!((x - 0.1).abs() < 1e-4, "{x}");
        assert_eq!(updater.steps(), 1);
    }

    #[test]
    fn test_converges_towards_minimum() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let x = vb.get_with_hints(1, "x", Init::Const(0.)).unwrap();

        let mut updater = ParameterUpdater::new(&varmap, 0.1).unwrap();
        for _ in 0..200 {
            let loss = (&x - 3.0).unwrap().sqr().unwrap().sum_all().unwrap();
            updater.step(&loss).unwrap();
        }
        let x = varmap.all_vars()[0].to_vec1::<f32>().unwrap()[0];
        assert!((x - 3.0).abs() < 0.1, "{x}");
        assert_eq!(updater.learning_rate(), 0.1);
    }
}
