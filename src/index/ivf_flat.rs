//! IVF index over raw float codes.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::index::ivf::{self, CoreSnapshot, IvfCore, SEGMENT_LEN_FLAT};
use crate::index::quantizer::dot;
use crate::index::{IdSelector, Metric, VectorIndex, DISTANCE_SENTINEL, LABEL_SENTINEL};

/// Inverted-file index storing full-precision vectors per list.
///
/// L2 lists cache `‖x‖²` per row so the scan kernel computes
/// `‖q‖² − 2·q·x + ‖x‖²` from a single dot product; cosine lists cache
/// `‖x‖` (not squared) and combine it with the query's own norm.
#[derive(Debug)]
pub struct IndexIvfFlat {
    core: IvfCore<f32>,
}

impl IndexIvfFlat {
    pub fn new(d: usize, nlist: usize, metric: Metric) -> Result<Self> {
        Self::with_device(d, nlist, metric, 0)
    }

    pub fn with_device(d: usize, nlist: usize, metric: Metric, device_id: u32) -> Result<Self> {
        Ok(IndexIvfFlat {
            core: IvfCore::new(d, nlist, metric, d, SEGMENT_LEN_FLAT, device_id)?,
        })
    }

    pub fn set_nprobe(&mut self, nprobe: usize) {
        self.core.set_nprobe(nprobe);
    }

    pub fn set_segment_len(&mut self, segment_len: usize) {
        self.core.set_segment_len(segment_len);
    }

    pub fn set_workers(&mut self, workers: usize) {
        self.core.set_workers(workers);
    }

    pub fn metric(&self) -> Metric {
        self.core.metric
    }

    fn precompute_for(metric: Metric, row: &[f32]) -> f32 {
        let norm_sq = dot(row, row);
        match metric {
            Metric::L2 => norm_sq,
            Metric::Cosine => norm_sq.sqrt(),
        }
    }

    /// Binary checkpoint of lists, ids and precompute caches.
    pub fn save_all_data<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        ivf::save_snapshot(
            path.as_ref(),
            &FlatSnapshot {
                core: self.core.to_snapshot(),
            },
        )
    }

    /// Restore a checkpoint onto a fresh device stream.
    pub fn load_all_data<P: AsRef<Path>>(path: P, device_id: u32) -> Result<Self> {
        let snap: FlatSnapshot = ivf::load_snapshot(path.as_ref())?;
        Ok(IndexIvfFlat {
            core: IvfCore::from_snapshot(snap.core, SEGMENT_LEN_FLAT, device_id)?,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct FlatSnapshot {
    core: CoreSnapshot<f32>,
}

impl VectorIndex<f32> for IndexIvfFlat {
    fn dim(&self) -> usize {
        self.core.d
    }

    fn ntotal(&self) -> usize {
        self.core.ntotal
    }

    fn is_trained(&self) -> bool {
        self.core.is_trained()
    }

    fn train(&mut self, x: &[f32]) -> Result<()> {
        self.core.train_coarse(x)
    }

    fn add_with_ids(&mut self, x: &[f32], ids: &[u32]) -> Result<()> {
        let n = self.core.check_add(x.len(), ids.len())?;
        let d = self.core.d;
        let metric = self.core.metric;
        let assignments = self.core.assign_lists(x.to_vec())?;
        for i in 0..n {
            let row = &x[i * d..(i + 1) * d];
            let pre = Self::precompute_for(metric, row);
            self.core.lists[assignments[i]].append_row(row, ids[i], Some(pre));
        }
        self.core.ntotal += n;
        Ok(())
    }

    fn add(&mut self, x: &[f32]) -> Result<u32> {
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
        queries: &[f32],
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

        let probes = self.core.probe_lists(queries.to_vec())?;
        let d = self.core.d;
        let metric = self.core.metric;
        let results = self.core.scan_lists(&probes, k, |q, _list_id, list, range, out| {
            let qv = &queries[q * d..(q + 1) * d];
            match metric {
                Metric::L2 => {
                    let qq = dot(qv, qv);
                    for i in range {
                        let key = qq - 2.0 * dot(qv, list.codes.row(i)) + list.precompute[i];
                        out.push((key, list.ids[i]));
                    }
                }
                Metric::Cosine => {
                    let qn = dot(qv, qv).sqrt();
                    for i in range {
                        let denom = qn * list.precompute[i];
                        let sim = if denom > 0.0 {
                            dot(qv, list.codes.row(i)) / denom
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
