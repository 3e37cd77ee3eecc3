use candle_core::{DType, Device, Module, ModuleT, Tensor, D};
use candle_nn::{ops::softmax, VarBuilder, VarMap};

use crate::{
    classifier_head::ClassifierHead,
    config::Config,
    conv1d::Conv1dValid,
    dataset::token_ids,
    embeddings::WordEmbedding,
    error::{Error, Result},
    utils::argmax_rows,
};

/// Whether dropout is active for a forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

impl Mode {
    pub fn is_train(self) -> bool {
        self == Mode::Train
    }
}

/// Sentence classifier: embedding lookup, valid 1-D convolution, global max
/// pooling over the sequence, then a dense/dropout/ReLU/dense head.
pub struct TextCnn {
    embedding: WordEmbedding,
    conv: Conv1dValid,
    head: ClassifierHead,
    max_sen_len: usize,
}

impl TextCnn {
    /// Builds the model, registering every trainable variable in `varmap`.
    ///
    /// The embedding matrix joins the trainable set only when
    /// `config.update_embeddings` is set.
    pub fn new(
        config: &Config,
        embeddings: &Tensor,
        varmap: &VarMap,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let (vocab_size, embedding_dim) = embeddings.dims2().map_err(|_| {
            Error::shape(format!(
                "embedding matrix must be rank 2, got {:?}",
                embeddings.shape()
            ))
        })?;
        if embedding_dim != config.embedding_dim {
            return Err(Error::shape(format!(
                "embedding matrix width {embedding_dim} differs from embedding_dim {}",
                config.embedding_dim
            )));
        }
        if vocab_size == 0 {
            return Err(Error::shape("embedding matrix has no rows"));
        }

        let embeddings = embeddings.to_device(device)?.to_dtype(DType::F32)?;
        let vb = VarBuilder::from_varmap(varmap, DType::F32, device);

        let embedding =
            WordEmbedding::new(&embeddings, config.update_embeddings, varmap, "embedding")?;
        let conv = Conv1dValid::new(
            config.embedding_dim,
            config.num_filters,
            config.kernel_size,
            vb.pp("conv"),
        )?;
        let head = ClassifierHead::new(
            config.num_filters,
            config.n_hidden,
            config.n_class,
            config.drop_p(),
            vb.pp("score"),
        )?;
        tracing::debug!(
            vocab_size,
            embedding_dim,
            num_filters = config.num_filters,
            kernel_size = config.kernel_size,
            n_hidden = config.n_hidden,
            n_class = config.n_class,
            "built text cnn"
        );

        Ok(Self {
            embedding,
            conv,
            head,
            max_sen_len: config.max_sen_len,
        })
    }

    pub fn embedding(&self) -> &WordEmbedding {
        &self.embedding
    }

    fn check_tokens(&self, xs: &Tensor) -> Result<Tensor> {
        let (_, seq_len) = xs.dims2().map_err(|_| {
            Error::shape(format!("token ids must be rank 2, got {:?}", xs.shape()))
        })?;
        if seq_len != self.max_sen_len {
            return Err(Error::shape(format!(
                "sequence length {seq_len} differs from max_sen_len {}",
                self.max_sen_len
            )));
        }
        let xs = token_ids(xs)?;
        let vocab_size = self.embedding.vocab_size();
        if let Some(&bad) = xs
            .flatten_all()?
            .to_vec1::<u32>()?
            .iter()
            .find(|&&id| id as usize >= vocab_size)
        {
            return Err(Error::shape(format!(
                "token id {bad} is out of range for vocabulary of {vocab_size}"
            )));
        }
        Ok(xs)
    }

    /// Convolution output before pooling: (batch, max_sen_len - kernel_size + 1, num_filters).
    pub fn feature_map(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.check_tokens(xs)?;
        // (batch, seq_len) --> (batch, seq_len, embedding_dim)
        let embedded = self.embedding.forward(&xs)?;
        Ok(self.conv.forward(&embedded)?)
    }

    /// Strongest activation of every filter anywhere in the sentence: (batch, num_filters).
    pub fn pooled(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(self.feature_map(xs)?.max(1)?)
    }

    /// Raw class scores (batch, n_class).
    pub fn forward(&self, xs: &Tensor, mode: Mode) -> Result<Tensor> {
        let pooled = self.pooled(xs)?;
        Ok(self.head.forward_t(&pooled, mode.is_train())?)
    }

    /// Class probabilities in eval mode.
    pub fn predict_proba(&self, xs: &Tensor) -> Result<Tensor> {
        let logits = self.forward(xs, Mode::Eval)?;
        Ok(softmax(&logits, D::Minus1)?)
    }

    /// Most likely class per sentence.
    pub fn predict(&self, xs: &Tensor) -> Result<Vec<usize>> {
        let logits = self.forward(xs, Mode::Eval)?;
        Ok(argmax_rows(&logits)?)
    }
}
