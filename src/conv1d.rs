use candle_core::{bail, Result, Tensor};
use candle_nn::{Init, Module, VarBuilder};

/// 1-D convolution over the sequence axis with no padding ("valid").
///
/// Input is channels-last (batch, seq_len, in_dim), output is
/// (batch, seq_len - kernel_size + 1, num_filters). Each output position is the
/// window of `kernel_size` consecutive rows, flattened and projected through the
/// filter bank.
pub struct Conv1dValid {
    weight: Tensor, // (num_filters, kernel_size * in_dim)
    bias: Tensor,   // (num_filters)
    kernel_size: usize,
    in_dim: usize,
    num_filters: usize,
}

impl Conv1dValid {
    pub fn new(
        in_dim: usize,
        num_filters: usize,
        kernel_size: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        if kernel_size == 0 {
            bail!("kernel_size must be greater than 0")
        }
        // glorot uniform over (kernel_size, in_dim, num_filters)
        let fan_in = (kernel_size * in_dim) as f64;
        let fan_out = (kernel_size * num_filters) as f64;
        let bound = (6.0 / (fan_in + fan_out)).sqrt();
        let weight = vb.get_with_hints(
            (num_filters, kernel_size * in_dim),
            "weight",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;
        let bias = vb.get_with_hints(num_filters, "bias", Init::Const(0.))?;

        Ok(Self {
            weight,
            bias,
            kernel_size,
            in_dim,
            num_filters,
        })
    }

    /// Stacks every window of `kernel_size` rows: (batch, out_len, kernel_size * in_dim).
    fn windows(&self, xs: &Tensor) -> Result<Tensor> {
        let (_, seq_len, in_dim) = xs.dims3()?;
        if in_dim != self.in_dim {
            bail!("expected input width {}, got {in_dim}", self.in_dim)
        }
        if seq_len < self.kernel_size {
            bail!(
                "sequence length {seq_len} is shorter than kernel_size {}",
                self.kernel_size
            )
        }
        let out_len = seq_len - self.kernel_size + 1;
        let shifted = (0..self.kernel_size)
            .map(|offset| xs.narrow(1, offset, out_len))
            .collect::<Result<Vec<_>>>()?;
        Tensor::cat(&shifted, 2)
    }
}

impl Module for Conv1dValid {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let windows = self.windows(xs)?;
        let (batch_sz, out_len, width) = windows.dims3()?;
        windows
            .reshape((batch_sz * out_len, width))?
            .matmul(&self.weight.t()?)?
            .broadcast_add(&self.bias)?
            .reshape((batch_sz, out_len, self.num_filters))
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{test_utils::to_vec3_round, DType, Device};
    use candle_nn::VarMap;

    use super::*;

    #[test]
    fn test_valid_output_length() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let conv = Conv1dValid::new(4, 6, 3, vb).unwrap();

        let xs = Tensor::ones((2, 5, 4), DType::F32, &device).unwrap();
        let ys = conv.forward(&xs).unwrap();
        assert_eq!(ys.dims3().unwrap(), (2, 3, 6));
    }

    #[test]
    fn test_kernel_equal_to_sequence() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let conv = Conv1dValid::new(2, 3, 4, vb).unwrap();

        let xs = Tensor::ones((1, 4, 2), DType::F32, &device).unwrap();
        assert_eq!(conv.forward(&xs).unwrap().dims3().unwrap(), (1, 1, 3));

        let short = Tensor::ones((1, 3, 2), DType::F32, &device).unwrap();
        assert!(conv.forward(&short).is_err());
    }

    #[test]
    fn test_known_filter_values() {
        let device = Device::Cpu;
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let conv = Conv1dValid::new(1, 2, 2, vb).unwrap();
        // filter 0 sums the window, filter 1 takes the difference of its two rows
        varmap
            .set_one(
                "weight",
                Tensor::new(&[[1f32, 1.], [-1., 1.]], &device).unwrap(),
            )
            .unwrap();
        varmap
            .set_one("bias", Tensor::new(&[0f32, 0.5], &device).unwrap())
            .unwrap();

        let xs = Tensor::new(&[[[1f32], [2.], [4.]]], &device).unwrap();
        let ys = conv.forward(&xs).unwrap();
        assert_eq!(
            to_vec3_round(&ys, 4).unwrap(),
            &[[[3.0, 1.5], [6.0, 2.5]]]
        );
    }
}
