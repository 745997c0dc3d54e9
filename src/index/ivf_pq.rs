//! IVF index over product-quantized residual codes.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::index::ivf::{self, CoreSnapshot, IvfCore, SEGMENT_LEN_PQ};
use crate::index::quantizer::{KmeansParams, ProductQuantizer};
use crate::index::{IdSelector, Metric, VectorIndex, DISTANCE_SENTINEL, LABEL_SENTINEL};

/// Inverted-file index storing `m`-byte PQ codes of coarse residuals.
///
/// Distances are approximated by per-sub-space table lookups: each
/// (query, list) pair builds a table from the query's residual against the
/// list centroid, then every code row costs `m` additions.
#[derive(Debug)]
pub struct IndexIvfPq {
    core: IvfCore<u8>,
    pq: ProductQuantizer,
}

impl IndexIvfPq {
    pub fn new(d: usize, nlist: usize, m: usize) -> Result<Self> {
        Self::with_device(d, nlist, m, 0)
    }

    pub fn with_device(d: usize, nlist: usize, m: usize, device_id: u32) -> Result<Self> {
        let pq = ProductQuantizer::new(d, m)?;
        Ok(IndexIvfPq {
            core: IvfCore::new(d, nlist, Metric::L2, m, SEGMENT_LEN_PQ, device_id)?,
            pq,
        })
    }

    pub fn set_nprobe(&mut self, nprobe: usize) {
        self.core.set_nprobe(nprobe);
    }

    pub fn set_segment_len(&mut self, segment_len: usize) {
        self.core.set_segment_len(segment_len);
    }

    pub fn sub_quantizers(&self) -> usize {
        self.pq.sub_quantizers()
    }

    /// Residual of `row` against the centroid of its assigned list.
    fn residual(&self, row: &[f32], list_id: usize, out: &mut [f32]) {
        let centroid = self.core.centroid(list_id);
        for ((dst, x), c) in out.iter_mut().zip(row).zip(centroid) {
            *dst = x - c;
        }
    }

    pub fn save_all_data<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        ivf::save_snapshot(
            path.as_ref(),
            &PqSnapshot {
                core: self.core.to_snapshot(),
                pq: self.pq.clone(),
            },
        )
    }

    pub fn load_all_data<P: AsRef<Path>>(path: P, device_id: u32) -> Result<Self> {
        let snap: PqSnapshot = ivf::load_snapshot(path.as_ref())?;
        Ok(IndexIvfPq {
            core: IvfCore::from_snapshot(snap.core, SEGMENT_LEN_PQ, device_id)?,
            pq: snap.pq,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct PqSnapshot {
    core: CoreSnapshot<u8>,
    pq: ProductQuantizer,
}

impl VectorIndex<f32> for IndexIvfPq {
    fn dim(&self) -> usize {
        self.core.d
    }

    fn ntotal(&self) -> usize {
        self.core.ntotal
    }

    fn is_trained(&self) -> bool {
        self.core.is_trained() && self.pq.is_trained()
    }

    /// Trains the coarse quantizer, then the PQ codebooks on the coarse
    /// residuals of the training set. Idempotent once both are trained.
    fn train(&mut self, x: &[f32]) -> Result<()> {
        if self.is_trained() {
            return Ok(());
        }
        self.core.train_coarse(x)?;
        let d = self.core.d;
        let assignments = self.core.assign_lists(x.to_vec())?;
        let mut residuals = vec![0.0f32; x.len()];
        for (i, row) in x.chunks_exact(d).enumerate() {
            let centroid = self.core.centroid(assignments[i]);
            for (j, (v, c)) in row.iter().zip(centroid).enumerate() {
                residuals[i * d + j] = v - c;
            }
        }
        self.pq.train(&residuals, &KmeansParams::default());
        Ok(())
    }

    fn add_with_ids(&mut self, x: &[f32], ids: &[u32]) -> Result<()> {
        let n = self.core.check_add(x.len(), ids.len())?;
        if !self.pq.is_trained() {
            return Err(Error::NotTrained);
        }
        let d = self.core.d;
        let m = self.pq.sub_quantizers();
        let assignments = self.core.assign_lists(x.to_vec())?;
        let mut residual = vec![0.0f32; d];
        let mut code = vec![0u8; m];
        for i in 0..n {
            let row = &x[i * d..(i + 1) * d];
            self.residual(row, assignments[i], &mut residual);
            self.pq.encode_one(&residual, &mut code);
            self.core.lists[assignments[i]].append_row(&code, ids[i], None);
        }
        self.core.ntotal += n;
        Ok(())
    }

    fn add(&mut self, x: &[f32]) -> Result<u32> {
        if !self.is_trained() {
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
        let core = &self.core;
        let pq = &self.pq;
        let results = core.scan_lists(&probes, k, |q, list_id, list, range, out| {
            let qv = &queries[q * d..(q + 1) * d];
            let centroid = core.centroid(list_id);
            let residual: Vec<f32> = qv.iter().zip(centroid).map(|(v, c)| v - c).collect();
            let table = pq.distance_table(&residual);
            for i in range {
                out.push((pq.table_distance(&table, list.codes.row(i)), list.ids[i]));
            }
        });
        ivf::write_output(&results, k, Metric::L2, distances, labels);
        Ok(())
    }
}
