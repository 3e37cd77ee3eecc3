use std::{collections::HashMap, path::Path};

use candle_core::{DType, Device, Tensor};
use rand::{seq::SliceRandom, Rng};

use crate::{
    config::Config,
    error::{Error, Result},
};

/// Lazily partitions `0..len` into batches of `batch_size` indices.
///
/// Every index is produced exactly once. The final batch holds the remainder
/// when `batch_size` does not divide `len`.
#[derive(Debug, Clone)]
pub struct BatchIter {
    order: Vec<usize>,
    batch_size: usize,
    current_idx: usize,
}

impl BatchIter {
    pub fn sequential(len: usize, batch_size: usize) -> Self {
        Self {
            order: (0..len).collect(),
            batch_size: batch_size.max(1),
            current_idx: 0,
        }
    }

    pub fn shuffled<R: Rng + ?Sized>(len: usize, batch_size: usize, rng: &mut R) -> Self {
        let mut iter = Self::sequential(len, batch_size);
        iter.order.shuffle(rng);
        iter
    }

    pub fn num_batches(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }
}

impl Iterator for BatchIter {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_idx >= self.order.len() {
            return None;
        }

        // The last batch may be smaller than `batch_size`.
        let end_idx = (self.current_idx + self.batch_size).min(self.order.len());
        let batch = self.order[self.current_idx..end_idx].to_vec();
        self.current_idx = end_idx;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.order.len() - self.current_idx).div_ceil(self.batch_size);
        (left, Some(left))
    }
}

impl ExactSizeIterator for BatchIter {}

/// Index batches over a dataset of `len` rows; a fresh permutation is drawn when `shuffle` is set.
pub fn batch_indices<R: Rng + ?Sized>(
    len: usize,
    batch_size: usize,
    shuffle: bool,
    rng: &mut R,
) -> BatchIter {
    if shuffle {
        BatchIter::shuffled(len, batch_size, rng)
    } else {
        BatchIter::sequential(len, batch_size)
    }
}

/// Converts token ids to `U32`, range-checking wider integer types before the cast.
///
/// Float tensors are rejected rather than truncated.
pub fn token_ids(xs: &Tensor) -> Result<Tensor> {
    match xs.dtype() {
        DType::U32 => Ok(xs.clone()),
        DType::U8 => Ok(xs.to_dtype(DType::U32)?),
        DType::I64 => {
            let ids = xs.flatten_all()?.to_vec1::<i64>()?;
            if let Some(&bad) = ids.iter().find(|&&id| u32::try_from(id).is_err()) {
                return Err(Error::shape(format!(
                    "token id {bad} does not fit a u32 vocabulary index"
                )));
            }
            Ok(xs.to_dtype(DType::U32)?)
        }
        dtype => Err(Error::shape(format!(
            "token ids must be an integer tensor, got {dtype:?}"
        ))),
    }
}

/// One split of already-numeric examples: token ids `x` (N, max_sen_len) and
/// one-hot labels `y` (N, n_class).
#[derive(Debug, Clone)]
pub struct Dataset {
    x: Tensor,
    y: Tensor,
}

impl Dataset {
    pub fn new(x: Tensor, y: Tensor, config: &Config) -> Result<Self> {
        let (n_x, seq_len) = x
            .dims2()
            .map_err(|_| Error::shape(format!("x must be rank 2, got {:?}", x.shape())))?;
        let (n_y, n_class) = y
            .dims2()
            .map_err(|_| Error::shape(format!("y must be rank 2, got {:?}", y.shape())))?;

        if n_x != n_y {
            return Err(Error::shape(format!("x has {n_x} rows but y has {n_y}")));
        }
        if seq_len != config.max_sen_len {
            return Err(Error::shape(format!(
                "sequence length {seq_len} differs from max_sen_len {}",
                config.max_sen_len
            )));
        }
        if n_class != config.n_class {
            return Err(Error::shape(format!(
                "label width {n_class} differs from n_class {}",
                config.n_class
            )));
        }

        let x = token_ids(&x)?;
        let y = y.to_dtype(DType::F32)?;

        if n_y > 0 {
            let sums = y.sum(1)?.to_vec1::<f32>()?;
            if let Some(row) = sums.iter().position(|s| (s - 1.0).abs() > 1e-5) {
                return Err(Error::shape(format!(
                    "label row {row} sums to {} instead of 1",
                    sums[row]
                )));
            }
        }

        Ok(Self { x, y })
    }

    /// Builds a dataset from plain rows, as handed over by an external loader.
    pub fn from_rows(
        x: &[Vec<u32>],
        y: &[Vec<f32>],
        config: &Config,
        device: &Device,
    ) -> Result<Self> {
        let rows = x.len();
        if let Some(row) = x.iter().position(|r| r.len() != config.max_sen_len) {
            return Err(Error::shape(format!(
                "row {row} has {} tokens, expected {}",
                x[row].len(),
                config.max_sen_len
            )));
        }
        if let Some(row) = y.iter().position(|r| r.len() != config.n_class) {
            return Err(Error::shape(format!(
                "label row {row} has width {}, expected {}",
                y[row].len(),
                config.n_class
            )));
        }
        let x = Tensor::from_vec(x.concat(), (rows, config.max_sen_len), device)?;
        let y = Tensor::from_vec(y.concat(), (y.len(), config.n_class), device)?;
        Self::new(x, y, config)
    }

    pub fn len(&self) -> usize {
        self.x.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Gathers the rows named by `indices` into a `(x, y)` batch.
    pub fn batch(&self, indices: &[usize]) -> Result<(Tensor, Tensor)> {
        let ids = indices.iter().map(|&i| i as u32).collect::<Vec<_>>();
        let ids = Tensor::from_vec(ids, indices.len(), self.x.device())?;
        let xs = self.x.index_select(&ids, 0)?;
        let ys = self.y.index_select(&ids, 0)?;
        Ok((xs, ys))
    }

    /// Turns index batches into `(x, y, n)` tensor batches.
    pub fn batches(
        &self,
        indices: BatchIter,
    ) -> impl Iterator<Item = Result<(Tensor, Tensor, usize)>> + '_ {
        indices.map(move |indices| {
            let (xs, ys) = self.batch(&indices)?;
            Ok((xs, ys, indices.len()))
        })
    }
}

/// Numeric inputs for a full run, as produced by an external corpus pipeline.
#[derive(Debug)]
pub struct DataBundle {
    pub embeddings: Tensor,
    pub train: Dataset,
    pub dev: Dataset,
    pub test: Option<Dataset>,
}

impl DataBundle {
    /// Reads `embeddings`, `x_train`, `y_train`, `x_dev`, `y_dev` and optionally
    /// `x_test`/`y_test` from a safetensors file.
    pub fn load(path: impl AsRef<Path>, config: &Config, device: &Device) -> Result<Self> {
        let mut tensors = candle_core::safetensors::load(path, device)?;
        let embeddings = take(&mut tensors, "embeddings")?.to_dtype(DType::F32)?;

        let train = Dataset::new(
            take(&mut tensors, "x_train")?,
            take(&mut tensors, "y_train")?,
            config,
        )?;
        let dev = Dataset::new(
            take(&mut tensors, "x_dev")?,
            take(&mut tensors, "y_dev")?,
            config,
        )?;
        let test = match (tensors.remove("x_test"), tensors.remove("y_test")) {
            (Some(x), Some(y)) => Some(Dataset::new(x, y, config)?),
            _ => None,
        };

        Ok(Self {
            embeddings,
            train,
            dev,
            test,
        })
    }
}

fn take(tensors: &mut HashMap<String, Tensor>, name: &str) -> Result<Tensor> {
    tensors
        .remove(name)
        .ok_or_else(|| Error::shape(format!("missing tensor `{name}` in data file")))
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn tiny_config() -> Config {
        Config {
            n_class: 2,
            max_sen_len: 5,
            kernel_size: 3,
            batch_size: 2,
            ..Config::default()
        }
    }

    fn tiny_dataset(rows: usize) -> Dataset {
        let config = tiny_config();
        let x = (0..rows)
            .map(|r| (0..5).map(|t| ((r + t) % 10) as u32).collect())
            .collect::<Vec<Vec<u32>>>();
        let y = (0..rows)
            .map(|r| if r % 2 == 0 { vec![1.0, 0.0] } else { vec![0.0, 1.0] })
            .collect::<Vec<Vec<f32>>>();
        Dataset::from_rows(&x, &y, &config, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_sequential_batches_cover_in_order() {
        for (len, batch_size) in [(10, 3), (9, 3), (1, 4), (7, 1)] {
            let batches = BatchIter::sequential(len, batch_size).collect::<Vec<_>>();
            let flat = batches.concat();
            assert_eq!(flat, (0..len).collect::<Vec<_>>());

            let last = batches.last().unwrap().len();
            let expected = if len % batch_size == 0 { batch_size } else { len % batch_size };
            assert_eq!(last, expected);
            assert!(batches[..batches.len() - 1]
                .iter()
                .all(|b| b.len() == batch_size));
        }
    }

    #[test]
    fn test_empty_dataset_yields_nothing() {
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(batch_indices(0, 4, true, &mut rng).count(), 0);
        assert_eq!(batch_indices(0, 4, false, &mut rng).count(), 0);
    }

    #[test]
    fn test_shuffled_is_a_permutation() {
        let mut rng = StdRng::seed_from_u64(7);
        let iter = batch_indices(50, 8, true, &mut rng);
        assert_eq!(iter.len(), 7);
        let mut flat = iter.collect::<Vec<_>>().concat();
        assert_ne!(flat, (0..50).collect::<Vec<_>>());
        flat.sort_unstable();
        assert_eq!(flat, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_four_examples_two_batches() {
        let dataset = tiny_dataset(4);
        let mut rng = StdRng::seed_from_u64(0);
        let batches = dataset
            .batches(batch_indices(dataset.len(), 2, false, &mut rng))
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(batches.len(), 2);

        let (xs, ys, n) = &batches[0];
        assert_eq!(*n, 2);
        assert_eq!(xs.dims(), &[2, 5]);
        assert_eq!(ys.dims(), &[2, 2]);
        assert_eq!(
            xs.to_vec2::<u32>().unwrap(),
            vec![vec![0, 1, 2, 3, 4], vec![1, 2, 3, 4, 5]]
        );

        let (xs, _, _) = &batches[1];
        assert_eq!(
            xs.to_vec2::<u32>().unwrap(),
            vec![vec![2, 3, 4, 5, 6], vec![3, 4, 5, 6, 7]]
        );
    }

    #[test]
    fn test_row_count_mismatch() {
        let config = tiny_config();
        let x = Tensor::zeros((3, 5), DType::U32, &Device::Cpu).unwrap();
        let y = Tensor::from_vec(vec![1f32, 0., 0., 1.], (2, 2), &Device::Cpu).unwrap();
        let err = Dataset::new(x, y, &config).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch(_)));
    }

    #[test]
    fn test_label_width_mismatch() {
        let config = tiny_config();
        let x = vec![vec![0u32; 5]];
        let y = vec![vec![0f32, 0., 1.]];
        let err = Dataset::from_rows(&x, &y, &config, &Device::Cpu).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch(_)));
    }

    #[test]
    fn test_labels_must_be_one_hot() {
        let config = tiny_config();
        let x = vec![vec![0u32; 5]];
        let y = vec![vec![0.5f32, 0.2]];
        let err = Dataset::from_rows(&x, &y, &config, &Device::Cpu).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch(_)));
    }

    #[test]
    fn test_wide_token_id_rejected() {
        let config = tiny_config();
        let device = Device::Cpu;
        let y = Tensor::from_vec(vec![1f32, 0.], (1, 2), &device).unwrap();
        for bad in [4_294_967_297i64, -1] {
            let x = Tensor::new(&[[bad, 2, 3, 0, 0]], &device).unwrap();
            assert!(matches!(
                Dataset::new(x, y.clone(), &config),
                Err(Error::ShapeMismatch(_))
            ));
        }

        let x = Tensor::new(&[[9i64, 2, 3, 0, 0]], &device).unwrap();
        let dataset = Dataset::new(x, y, &config).unwrap();
        let (xs, _) = dataset.batch(&[0]).unwrap();
        assert_eq!(xs.to_vec2::<u32>().unwrap(), vec![vec![9, 2, 3, 0, 0]]);
    }

    #[test]
    fn test_float_token_ids_rejected() {
        let config = tiny_config();
        let x = Tensor::zeros((1, 5), DType::F32, &Device::Cpu).unwrap();
        let y = Tensor::from_vec(vec![1f32, 0.], (1, 2), &Device::Cpu).unwrap();
        assert!(matches!(
            Dataset::new(x, y, &config),
            Err(Error::ShapeMismatch(_))
        ));
    }
}
