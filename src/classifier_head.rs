use candle_core::{Result, Tensor};
use candle_nn::{Activation, Dropout, Init, Linear, ModuleT, VarBuilder};

/// Dense layer with glorot-uniform weights and zero bias.
fn glorot_linear(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let bound = (6.0 / (in_dim + out_dim) as f64).sqrt();
    let weight = vb.get_with_hints(
        (out_dim, in_dim),
        "weight",
        Init::Uniform {
            lo: -bound,
            up: bound,
        },
    )?;
    let bias = vb.get_with_hints(out_dim, "bias", Init::Const(0.))?;
    Ok(Linear::new(weight, Some(bias)))
}

/// Dense -> dropout -> ReLU -> dense, mapping pooled features to class logits.
pub struct ClassifierHead {
    fc1: Linear,
    dropout: Dropout,
    fc2: Linear,
}

impl ClassifierHead {
    pub fn new(
        in_dim: usize,
        n_hidden: usize,
        n_class: usize,
        drop_p: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        let fc1 = glorot_linear(in_dim, n_hidden, vb.pp("fc1"))?;
        let dropout = Dropout::new(drop_p);
        let fc2 = glorot_linear(n_hidden, n_class, vb.pp("fc2"))?;

        Ok(Self {
            fc1,
            dropout,
            fc2,
        })
    }
}

impl ModuleT for ClassifierHead {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let logits = xs
            .apply(&self.fc1)?
            .apply_t(&self.dropout, train)?
            .apply(&Activation::Relu)?
            .apply(&self.fc2)?;
        Ok(logits)
    }
}
