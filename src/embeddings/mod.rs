pub mod word_embedding;

pub use word_embedding::WordEmbedding;
