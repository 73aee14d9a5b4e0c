//! Paired batched augmentation sampling over (input, label) stacks.
//!
//! A sampler owns two co-registered 4-D stacks, an immutable batch
//! partition over sample indices and a seeded RNG. Every `get_batch` call
//! gathers the indexed samples and augments each (input, label) pair with
//! a fresh rotation/scale draw; the pair shares one matrix. Reshuffling
//! requires building a new sampler.

use ndarray::{Array4, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::{Error, Result};
use crate::transform::{transform_pair, AffineJitter};

/// Split indices `0..n` into `ceil(n / batch_size)` contiguous chunks of
/// `batch_size` samples, the last chunk holding the remainder. With
/// `shuffle` the index order is randomized once before chunking.
pub fn batch_partition(
    n: usize,
    batch_size: usize,
    shuffle: bool,
    rng: &mut StdRng,
) -> Result<Vec<Vec<usize>>> {
    if n == 0 {
        return Err(Error::Config("batch_partition: empty dataset".into()));
    }
    if batch_size == 0 {
        return Err(Error::Config(
            "batch_partition: batch_size must be at least 1".into(),
        ));
    }
    let mut idx: Vec<usize> = (0..n).collect();
    if shuffle {
        idx.shuffle(rng);
    }
    Ok(idx.chunks(batch_size).map(<[usize]>::to_vec).collect())
}

/// Configuration for a paired augmentation sampler.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SamplerConfig {
    /// Samples per batch.
    pub batch_size: usize,
    /// Shuffle the sample order once at construction.
    pub shuffle: bool,
    /// Rotation/scale jitter applied per sample.
    pub jitter: AffineJitter,
    /// Seed for shuffling and per-sample draws.
    pub seed: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            shuffle: false,
            jitter: AffineJitter::default(),
            seed: 0,
        }
    }
}

/// Batched augmenting sampler over an (input, label) stack pair.
#[derive(Debug)]
pub struct PairedAugmenter {
    x: Array4<f32>,
    y: Array4<f32>,
    batches: Vec<Vec<usize>>,
    jitter: AffineJitter,
    rng: StdRng,
}

impl PairedAugmenter {
    /// Build a sampler over co-registered (N, C, H, W) stacks. The stacks
    /// must agree in sample count and image size; channel counts may
    /// differ.
    pub fn new(x: Array4<f32>, y: Array4<f32>, cfg: &SamplerConfig) -> Result<Self> {
        let (nx, _, hx, wx) = x.dim();
        let (ny, _, hy, wy) = y.dim();
        if nx != ny {
            return Err(Error::Shape(format!(
                "paired stacks differ in sample count: {nx} vs {ny}"
            )));
        }
        if (hx, wx) != (hy, wy) {
            return Err(Error::Shape(format!(
                "paired stacks differ in image size: {hx}x{wx} vs {hy}x{wy}"
            )));
        }
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let batches = batch_partition(nx, cfg.batch_size, cfg.shuffle, &mut rng)?;
        Ok(Self {
            x,
            y,
            batches,
            jitter: cfg.jitter,
            rng,
        })
    }

    /// Number of batches in the partition.
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Total sample count across all batches.
    pub fn num_samples(&self) -> usize {
        self.x.dim().0
    }

    /// Image size as (height, width).
    pub fn image_hw(&self) -> (usize, usize) {
        let (_, _, h, w) = self.x.dim();
        (h, w)
    }

    /// Channel counts as (input, label).
    pub fn channels(&self) -> (usize, usize) {
        (self.x.dim().1, self.y.dim().1)
    }

    /// Indices making up batch `idx`; the partition never changes after
    /// construction.
    pub fn batch_indices(&self, idx: usize) -> Result<&[usize]> {
        self.batches
            .get(idx)
            .map(Vec::as_slice)
            .ok_or_else(|| self.out_of_range(idx))
    }

    /// Gather batch `idx` and augment each (input, label) pair with a
    /// fresh independent draw. Returns owned (input, label) batch stacks.
    pub fn get_batch(&mut self, idx: usize) -> Result<(Array4<f32>, Array4<f32>)> {
        let indices = match self.batches.get(idx) {
            Some(b) => b.clone(),
            None => return Err(self.out_of_range(idx)),
        };
        let (_, cx, h, w) = self.x.dim();
        let cy = self.y.dim().1;
        let mut bx = Array4::zeros((indices.len(), cx, h, w));
        let mut by = Array4::zeros((indices.len(), cy, h, w));
        for (row, &i) in indices.iter().enumerate() {
            let (wx, wy) = transform_pair(
                self.x.index_axis(Axis(0), i),
                self.y.index_axis(Axis(0), i),
                &self.jitter,
                &mut self.rng,
            )?;
            bx.index_axis_mut(Axis(0), row).assign(&wx);
            by.index_axis_mut(Axis(0), row).assign(&wy);
        }
        Ok((bx, by))
    }

    fn out_of_range(&self, idx: usize) -> Error {
        Error::Config(format!(
            "batch index {idx} out of range ({} batches)",
            self.batches.len()
        ))
    }
}

/// Batch arrays keyed by layer name. Every name aliases the same array;
/// the relabeling carries no numeric change.
#[derive(Debug, Clone)]
pub struct NamedBatch {
    names: Vec<String>,
    data: Array4<f32>,
}

impl NamedBatch {
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Look an array up by layer name.
    pub fn get(&self, name: &str) -> Option<&Array4<f32>> {
        self.names.iter().any(|n| n == name).then_some(&self.data)
    }

    /// The single underlying array.
    pub fn array(&self) -> &Array4<f32> {
        &self.data
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Array4<f32>)> {
        self.names.iter().map(move |n| (n.as_str(), &self.data))
    }
}

/// Sampler variant that labels each batch with input/output layer names
/// for multi-input, multi-output training.
#[derive(Debug)]
pub struct NamedPairedAugmenter {
    inner: PairedAugmenter,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

impl NamedPairedAugmenter {
    pub fn new(
        x: Array4<f32>,
        y: Array4<f32>,
        cfg: &SamplerConfig,
        input_names: Vec<String>,
        output_names: Vec<String>,
    ) -> Result<Self> {
        if input_names.is_empty() || output_names.is_empty() {
            return Err(Error::Config(
                "named sampler requires at least one input and one output name".into(),
            ));
        }
        Ok(Self {
            inner: PairedAugmenter::new(x, y, cfg)?,
            input_names,
            output_names,
        })
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn get_batch(&mut self, idx: usize) -> Result<(NamedBatch, NamedBatch)> {
        let (bx, by) = self.inner.get_batch(idx)?;
        Ok((
            NamedBatch {
                names: self.input_names.clone(),
                data: bx,
            },
            NamedBatch {
                names: self.output_names.clone(),
                data: by,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::{CenterMode, Jitter};
    use ndarray::Array4;

    fn identity_cfg(batch_size: usize) -> SamplerConfig {
        SamplerConfig {
            batch_size,
            shuffle: false,
            jitter: AffineJitter {
                angle_deg: Jitter::Fixed(0.0),
                scale: Jitter::Fixed(1.0),
                center: CenterMode::HalfHeight,
            },
            seed: 0,
        }
    }

    fn numbered_stack(n: usize, c: usize, h: usize, w: usize) -> Array4<f32> {
        Array4::from_shape_fn((n, c, h, w), |(s, ch, r, col)| {
            (s * 1000 + ch * 100 + r * 10 + col) as f32
        })
    }

    #[test]
    fn test_partition_sizes_with_remainder() {
        let mut rng = StdRng::seed_from_u64(0);
        let batches = batch_partition(100, 32, false, &mut rng).unwrap();
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![32, 32, 32, 4]);
    }

    #[test]
    fn test_partition_covers_each_index_exactly_once() {
        let mut rng = StdRng::seed_from_u64(7);
        let batches = batch_partition(53, 8, true, &mut rng).unwrap();
        assert_eq!(batches.len(), 7, "ceil(53 / 8) batches expected");
        let mut seen: Vec<usize> = batches.into_iter().flatten().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..53).collect::<Vec<_>>());
    }

    #[test]
    fn test_partition_edge_cases() {
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(
            batch_partition(5, 5, false, &mut rng).unwrap(),
            vec![vec![0, 1, 2, 3, 4]]
        );
        assert_eq!(
            batch_partition(3, 10, false, &mut rng).unwrap(),
            vec![vec![0, 1, 2]],
            "batch size above n yields one short batch"
        );
        assert_eq!(batch_partition(3, 1, false, &mut rng).unwrap().len(), 3);
        assert!(batch_partition(0, 4, false, &mut rng).is_err());
        assert!(batch_partition(4, 0, false, &mut rng).is_err());
    }

    #[test]
    fn test_shuffle_is_seed_deterministic() {
        let mut a = StdRng::seed_from_u64(11);
        let mut b = StdRng::seed_from_u64(11);
        assert_eq!(
            batch_partition(40, 7, true, &mut a).unwrap(),
            batch_partition(40, 7, true, &mut b).unwrap()
        );

        let mut c = StdRng::seed_from_u64(11);
        let plain = batch_partition(40, 7, false, &mut c).unwrap();
        assert_eq!(plain[0], vec![0, 1, 2, 3, 4, 5, 6], "unshuffled keeps order");
    }

    #[test]
    fn test_identity_jitter_batch_is_pure_gather() {
        let x = numbered_stack(5, 1, 4, 4);
        let y = numbered_stack(5, 2, 4, 4);
        let mut sampler = PairedAugmenter::new(x.clone(), y.clone(), &identity_cfg(2)).unwrap();
        assert_eq!(sampler.len(), 3);

        let (bx, by) = sampler.get_batch(2).unwrap();
        assert_eq!(bx.dim(), (1, 1, 4, 4), "remainder batch has one sample");
        assert_eq!(bx.index_axis(Axis(0), 0), x.index_axis(Axis(0), 4));
        assert_eq!(by.index_axis(Axis(0), 0), y.index_axis(Axis(0), 4));
    }

    #[test]
    fn test_batch_indices_are_immutable_across_calls() {
        let x = numbered_stack(9, 1, 4, 4);
        let y = numbered_stack(9, 1, 4, 4);
        let cfg = SamplerConfig {
            batch_size: 4,
            shuffle: true,
            seed: 3,
            ..identity_cfg(4)
        };
        let mut sampler = PairedAugmenter::new(x, y, &cfg).unwrap();
        let before: Vec<usize> = sampler.batch_indices(0).unwrap().to_vec();
        let _ = sampler.get_batch(0).unwrap();
        let _ = sampler.get_batch(1).unwrap();
        assert_eq!(
            sampler.batch_indices(0).unwrap(),
            before.as_slice(),
            "partition must not change after construction"
        );
    }

    #[test]
    fn test_pair_spikes_stay_aligned_under_augmentation() {
        let n = 6;
        let mut x = Array4::zeros((n, 1, 16, 16));
        let mut y = Array4::zeros((n, 3, 16, 16));
        for s in 0..n {
            x[[s, 0, 5, 9]] = 1.0;
            y[[s, 2, 5, 9]] = 1.0;
        }
        let cfg = SamplerConfig {
            batch_size: 3,
            shuffle: false,
            jitter: AffineJitter::default(),
            seed: 99,
        };
        let mut sampler = PairedAugmenter::new(x, y, &cfg).unwrap();
        let (bx, by) = sampler.get_batch(0).unwrap();
        for s in 0..3 {
            let px = argmax_hw(&bx, s, 0);
            let py = argmax_hw(&by, s, 2);
            assert_eq!(px, py, "sample {s}: input and label spikes diverged");
        }
    }

    #[test]
    fn test_fresh_draw_per_sample() {
        // Identical samples augmented within one batch should not all
        // land on the same pixel when the angle interval is wide.
        let n = 8;
        let mut x = Array4::zeros((n, 1, 16, 16));
        let mut y = Array4::zeros((n, 1, 16, 16));
        for s in 0..n {
            x[[s, 0, 2, 13]] = 1.0;
            y[[s, 0, 2, 13]] = 1.0;
        }
        let cfg = SamplerConfig {
            batch_size: n,
            shuffle: false,
            jitter: AffineJitter::default(),
            seed: 5,
        };
        let mut sampler = PairedAugmenter::new(x, y, &cfg).unwrap();
        let (bx, _) = sampler.get_batch(0).unwrap();
        let positions: Vec<(usize, usize)> = (0..n).map(|s| argmax_hw(&bx, s, 0)).collect();
        let first = positions[0];
        assert!(
            positions.iter().any(|&p| p != first),
            "eight independent draws from a full turn all matched: {positions:?}"
        );
    }

    #[test]
    fn test_mismatched_stacks_are_rejected() {
        let cfg = identity_cfg(2);
        let err = PairedAugmenter::new(
            Array4::zeros((4, 1, 8, 8)),
            Array4::zeros((5, 1, 8, 8)),
            &cfg,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Shape(_)), "got {err:?}");

        let err = PairedAugmenter::new(
            Array4::zeros((4, 1, 8, 8)),
            Array4::zeros((4, 1, 8, 9)),
            &cfg,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Shape(_)), "got {err:?}");
    }

    #[test]
    fn test_named_sampler_relabels_without_numeric_change() {
        let x = numbered_stack(4, 1, 4, 4);
        let y = numbered_stack(4, 2, 4, 4);
        let cfg = identity_cfg(2);

        let mut plain = PairedAugmenter::new(x.clone(), y.clone(), &cfg).unwrap();
        let mut named = NamedPairedAugmenter::new(
            x,
            y,
            &cfg,
            vec!["frames".to_string()],
            vec!["confmaps".to_string()],
        )
        .unwrap();

        let (px, py) = plain.get_batch(1).unwrap();
        let (nx, ny) = named.get_batch(1).unwrap();
        assert_eq!(nx.get("frames"), Some(&px), "relabeling changed the data");
        assert_eq!(ny.get("confmaps"), Some(&py));
        assert_eq!(nx.get("unknown"), None);
        assert_eq!(nx.names(), ["frames".to_string()]);

        let err = NamedPairedAugmenter::new(
            numbered_stack(2, 1, 4, 4),
            numbered_stack(2, 1, 4, 4),
            &cfg,
            vec![],
            vec!["out".into()],
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    fn argmax_hw(batch: &Array4<f32>, sample: usize, channel: usize) -> (usize, usize) {
        let plane = batch.index_axis(Axis(0), sample);
        let plane = plane.index_axis(Axis(0), channel);
        let mut best = (0, 0);
        for ((r, c), &v) in plane.indexed_iter() {
            if v > plane[best] {
                best = (r, c);
            }
        }
        best
    }
}
