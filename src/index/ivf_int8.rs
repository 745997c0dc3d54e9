//! IVF index over int8 codes.
//!
//! Dot products are accumulated in i32 and only combined in f32, so the
//! L2 form `‖q‖² − 2·q·x + ‖x‖²` is exact for int8 inputs.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::index::ivf::{self, CoreSnapshot, IvfCore, SEGMENT_LEN_FLAT};
use crate::index::{IdSelector, Metric, VectorIndex, DISTANCE_SENTINEL, LABEL_SENTINEL};

fn dot_i8(a: &[i8], b: &[i8]) -> i32 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| x as i32 * y as i32)
        .sum()
}

fn norm_sq_i8(a: &[i8]) -> i32 {
    dot_i8(a, a)
}

fn widen(x: &[i8]) -> Vec<f32> {
    x.iter().map(|&v| v as f32).collect()
}

/// Inverted-file index storing int8 vectors, L2 or cosine scored.
#[derive(Debug)]
pub struct IndexInt8IvfFlat {
    core: IvfCore<i8>,
}

impl IndexInt8IvfFlat {
    /// L2-metric variant.
    pub fn new_l2(d: usize, nlist: usize) -> Result<Self> {
        Self::with_device(d, nlist, Metric::L2, 0)
    }

    /// Cosine-metric variant.
    pub fn new_cosine(d: usize, nlist: usize) -> Result<Self> {
        Self::with_device(d, nlist, Metric::Cosine, 0)
    }

    pub fn with_device(d: usize, nlist: usize, metric: Metric, device_id: u32) -> Result<Self> {
        Ok(IndexInt8IvfFlat {
            core: IvfCore::new(d, nlist, metric, d, SEGMENT_LEN_FLAT, device_id)?,
        })
    }

    pub fn set_nprobe(&mut self, nprobe: usize) {
        self.core.set_nprobe(nprobe);
    }

    pub fn set_segment_len(&mut self, segment_len: usize) {
        self.core.set_segment_len(segment_len);
    }

    pub fn metric(&self) -> Metric {
        self.core.metric
    }

    fn precompute_for(metric: Metric, row: &[i8]) -> f32 {
        let norm_sq = norm_sq_i8(row) as f32;
        match metric {
            Metric::L2 => norm_sq,
            Metric::Cosine => norm_sq.sqrt(),
        }
    }

    pub fn save_all_data<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        ivf::save_snapshot(
            path.as_ref(),
            &Int8Snapshot {
                core: self.core.to_snapshot(),
            },
        )
    }

    pub fn load_all_data<P: AsRef<Path>>(path: P, device_id: u32) -> Result<Self> {
        let snap: Int8Snapshot = ivf::load_snapshot(path.as_ref())?;
        Ok(IndexInt8IvfFlat {
            core: IvfCore::from_snapshot(snap.core, SEGMENT_LEN_FLAT, device_id)?,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct Int8Snapshot {
    core: CoreSnapshot<i8>,
}

impl VectorIndex<i8> for IndexInt8IvfFlat {
    fn dim(&self) -> usize {
        self.core.d
    }

    fn ntotal(&self) -> usize {
        self.core.ntotal
    }

    fn is_trained(&self) -> bool {
        self.core.is_trained()
    }

    fn train(&mut self, x: &[i8]) -> Result<()> {
        self.core.train_coarse(&widen(x))
    }

    fn add_with_ids(&mut self, x: &[i8], ids: &[u32]) -> Result<()> {
        let n = self.core.check_add(x.len(), ids.len())?;
        let d = self.core.d;
        let metric = self.core.metric;
        let assignments = self.core.assign_lists(widen(x))?;
        for i in 0..n {
            let row = &x[i * d..(i + 1) * d];
            let pre = Self::precompute_for(metric, row);
            self.core.lists[assignments[i]].append_row(row, ids[i], Some(pre));
        }
        self.core.ntotal += n;
        Ok(())
    }

    fn add(&mut self, x: &[i8]) -> Result<u32> {
        if !self.core.is_trained() {
            return Err(Error::NotTrained);
        }
        if x.is_empty() || x.len() % self.core.d != 0 {
            return Err(Error::InvalidArgument(
                "add batch length is not a positive multiple of dim".into(),
            ));
        }
        let ids = self.core.take_auto_ids(x.len() / self.core.d);
        let first = ids[0];
        self.add_with_ids(x, &ids)?;
        Ok(first)
    }

    fn remove_ids(&mut self, selector: &IdSelector) -> Result<usize> {
        self.core.remove_where(selector)
    }

    fn search(
        &self,
        queries: &[i8],
        k: usize,
        distances: &mut [f32],
        labels: &mut [u32],
    ) -> Result<()> {
        self.core
            .check_search(queries.len(), k, distances.len(), labels.len())?;
        distances.fill(DISTANCE_SENTINEL);
        labels.fill(LABEL_SENTINEL);
        if self.core.ntotal == 0 {
            return Ok(());
        }

        let probes = self.core.probe_lists(widen(queries))?;
        let d = self.core.d;
        let metric = self.core.metric;
        let results = self.core.scan_lists(&probes, k, |q, _list_id, list, range, out| {
            let qv = &queries[q * d..(q + 1) * d];
            match metric {
                Metric::L2 => {
                    let qq = norm_sq_i8(qv) as f32;
                    for i in range {
                        let cross = dot_i8(qv, list.codes.row(i)) as f32;
                        out.push((qq - 2.0 * cross + list.precompute[i], list.ids[i]));
                    }
                }
                Metric::Cosine => {
                    let qn = (norm_sq_i8(qv) as f32).sqrt();
                    for i in range {
                        let denom = qn * list.precompute[i];
                        let sim = if denom > 0.0 {
                            dot_i8(qv, list.codes.row(i)) as f32 / denom
                        } else {
                            0.0
                        };
                        out.push((-sim, list.ids[i]));
                    }
                }
            }
        });
        ivf::write_output(&results, k, metric, distances, labels);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_codes(n: usize, d: usize, seed: u64) -> Vec<i8> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n * d).map(|_| rng.gen_range(-64i8..64)).collect()
    }

    fn filled(metric: Metric, n: usize, d: usize, nlist: usize) -> (IndexInt8IvfFlat, Vec<i8>) {
        let data = random_codes(n, d, 21);
        let mut index = IndexInt8IvfFlat::with_device(d, nlist, metric, 0).unwrap();
        index.train(&data).unwrap();
        let ids: Vec<u32> = (0..n as u32).collect();
        index.add_with_ids(&data, &ids).unwrap();
        index.set_nprobe(nlist);
        (index, data)
    }

    #[test]
    fn test_l2_self_distance_is_zero() {
        let d = 16;
        let (index, data) = filled(Metric::L2, 128, d, 4);
        for probe in [0usize, 31, 127] {
            let q = &data[probe * d..(probe + 1) * d];
            let mut dist = vec![0.0; 1];
            let mut labels = vec![0u32; 1];
            index.search(q, 1, &mut dist, &mut labels).unwrap();
            assert_eq!(labels[0], probe as u32);
            assert_eq!(dist[0], 0.0);
        }
    }

    #[test]
    fn test_cosine_self_similarity_is_one() {
        let d = 16;
        let (index, data) = filled(Metric::Cosine, 128, d, 4);
        let q = &data[50 * d..51 * d];
        let mut sims = vec![0.0; 3];
        let mut labels = vec![0u32; 3];
        index.search(q, 3, &mut sims, &mut labels).unwrap();
        assert_eq!(labels[0], 50);
        assert!((sims[0] - 1.0).abs() < 1e-5);
        assert!(sims[0] >= sims[1] && sims[1] >= sims[2]);
    }

    #[test]
    fn test_remove_invariant() {
        let d = 16;
        let (mut index, _) = filled(Metric::L2, 100, d, 4);
        let removed = index
            .remove_ids(&IdSelector::range(0, 10).unwrap())
            .unwrap();
        assert_eq!(removed, 10);
        assert_eq!(index.ntotal(), 90);
    }

    #[test]
    fn test_requires_training() {
        let mut index = IndexInt8IvfFlat::new_l2(16, 2).unwrap();
        assert!(matches!(
            index.add_with_ids(&random_codes(1, 16, 0), &[0]),
            Err(Error::NotTrained)
        ));
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let d = 16;
        let (index, data) = filled(Metric::Cosine, 64, d, 2);
        let path = std::env::temp_dir().join("facetrack_int8_snapshot_test.bin");
        index.save_all_data(&path).unwrap();
        let mut restored = IndexInt8IvfFlat::load_all_data(&path, 0).unwrap();
        restored.set_nprobe(2);
        std::fs::remove_file(&path).ok();

        assert_eq!(restored.metric(), Metric::Cosine);
        assert_eq!(restored.ntotal(), 64);
        let q = &data[9 * d..10 * d];
        let mut sims = vec![0.0; 1];
        let mut labels = vec![0u32; 1];
        restored.search(q, 1, &mut sims, &mut labels).unwrap();
        assert_eq!(labels[0], 9);
    }
}
