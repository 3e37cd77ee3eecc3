use candle_core::{Result, Tensor, Var};
use candle_nn::{Embedding, Module, VarMap};

/// Lookup table over a pretrained embedding matrix (vocab_size, embedding_dim).
///
/// Row 0 is the padding/unknown token. When trainable, the matrix is copied into
/// a `Var` registered in the model's `VarMap` so the optimizer updates it.
pub struct WordEmbedding {
    embedding: Embedding,
    vocab_size: usize,
    trainable: bool,
}

impl WordEmbedding {
    pub fn new(weights: &Tensor, trainable: bool, varmap: &VarMap, name: &str) -> Result<Self> {
        let (vocab_size, embedding_dim) = weights.dims2()?;
        let table = if trainable {
            let var = Var::from_tensor(weights)?;
            varmap
                .data()
                .lock()
                .map_err(|_| candle_core::Error::Msg("varmap lock poisoned".to_string()))?
                .insert(name.to_string(), var.clone());
            var.as_tensor().clone()
        } else {
            // A plain tensor is never handed to the optimizer, so it stays frozen.
            weights.clone()
        };
        let embedding = Embedding::new(table, embedding_dim);

        Ok(Self {
            embedding,
            vocab_size,
            trainable,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

    pub fn weights(&self) -> &Tensor {
        self.embedding.embeddings()
    }
}

impl Module for WordEmbedding {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        // (batch_sz, seq_len) --> (batch_sz, seq_len, embedding_dim)
        self.embedding.forward(xs)
    }
}
