//! Shared machinery of the IVF index family: inverted-list storage, coarse
//! training and probing, the segmented two-phase search scheduler, parallel
//! removal and snapshot plumbing.
//!
//! Search is two-phase. L1 computes query-to-centroid distances as one dense
//! operation on the device stream and selects `nprobe` candidate lists per
//! query. L2 splits every probed list into fixed-length segments, scans them
//! on a fixed-size producer pool and folds each finished segment into the
//! query's bounded top-k on a fixed-size merge pool. Stage completion
//! propagates by channel closure; the fold is commutative over segments, so
//! completion order never changes the result set.

use std::collections::HashMap;
use std::ops::Range;
use std::path::Path;

use crossbeam::channel::{bounded, unbounded, Sender};
use rayon::prelude::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::buffer::ListBuffer;
use crate::device::DeviceHandle;
use crate::error::{Error, Result};
use crate::index::quantizer::{self, KmeansParams};
use crate::index::topk::TopK;
use crate::index::{check_dim, IdSelector, Metric};

/// Default L2-phase segment length for flat and int8 code layouts.
pub const SEGMENT_LEN_FLAT: usize = 65536;
/// Default L2-phase segment length for PQ code layouts.
pub const SEGMENT_LEN_PQ: usize = 2048;

/// Fixed size of the producer and merge pools.
pub const DEFAULT_WORKERS: usize = 4;

/// One inverted list: code rows plus parallel id and precompute arrays.
///
/// Invariant: `codes.rows() == ids.len()`, and when a precompute cache is
/// carried, `precompute.len() == ids.len()` with `precompute[i]` derived
/// from row `i`.
#[derive(Debug, Clone)]
pub struct InvertedList<T> {
    pub codes: ListBuffer<T>,
    pub ids: Vec<u32>,
    pub precompute: Vec<f32>,
}

impl<T: Copy + Default> InvertedList<T> {
    fn new(code_size: usize) -> Self {
        InvertedList {
            codes: ListBuffer::new(code_size),
            ids: Vec::new(),
            precompute: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn append_row(&mut self, code: &[T], id: u32, precompute: Option<f32>) {
        self.codes.append(code);
        self.ids.push(id);
        if let Some(pre) = precompute {
            self.precompute.push(pre);
        }
        debug_assert_eq!(self.codes.rows(), self.ids.len());
    }

    /// Compact out members matching `pred` by swapping the last valid row
    /// into the hole. Order is not preserved. Returns the removed count.
    pub fn compact_remove<F: Fn(u32) -> bool>(&mut self, pred: F) -> usize {
        let mut removed = 0;
        let mut i = 0;
        while i < self.ids.len() {
            if pred(self.ids[i]) {
                self.ids.swap_remove(i);
                self.codes.swap_remove_row(i);
                if !self.precompute.is_empty() {
                    self.precompute.swap_remove(i);
                }
                removed += 1;
            } else {
                i += 1;
            }
        }
        if removed > 0 {
            self.codes.reclaim();
        }
        removed
    }
}

/// State shared by every IVF variant.
#[derive(Debug)]
pub struct IvfCore<T> {
    pub d: usize,
    pub nlist: usize,
    pub metric: Metric,
    pub lists: Vec<InvertedList<T>>,
    pub ntotal: usize,
    centroids: Vec<f32>,
    trained: bool,
    nprobe: usize,
    next_auto_id: u32,
    segment_len: usize,
    workers: usize,
    kmeans: KmeansParams,
    device: DeviceHandle,
}

impl<T: Copy + Default + Send + Sync> IvfCore<T> {
    pub fn new(
        d: usize,
        nlist: usize,
        metric: Metric,
        code_size: usize,
        segment_len: usize,
        device_id: u32,
    ) -> Result<Self> {
        check_dim(d)?;
        if nlist == 0 {
            return Err(Error::Config("nlist must be positive".into()));
        }
        Ok(IvfCore {
            d,
            nlist,
            metric,
            lists: (0..nlist).map(|_| InvertedList::new(code_size)).collect(),
            ntotal: 0,
            centroids: Vec::new(),
            trained: false,
            nprobe: 1,
            next_auto_id: 0,
            segment_len,
            workers: DEFAULT_WORKERS,
            kmeans: KmeansParams::default(),
            device: DeviceHandle::new(device_id),
        })
    }

    pub fn is_trained(&self) -> bool {
        self.trained
    }

    pub fn nprobe(&self) -> usize {
        self.nprobe
    }

    pub fn set_nprobe(&mut self, nprobe: usize) {
        self.nprobe = nprobe.clamp(1, self.nlist);
    }

    pub fn set_segment_len(&mut self, segment_len: usize) {
        self.segment_len = segment_len.max(1);
    }

    pub fn set_workers(&mut self, workers: usize) {
        self.workers = workers.max(1);
    }

    pub fn centroid(&self, list_id: usize) -> &[f32] {
        &self.centroids[list_id * self.d..(list_id + 1) * self.d]
    }

    /// Train the coarse quantizer. A second call returns immediately and
    /// leaves centroids and stored vectors untouched.
    pub fn train_coarse(&mut self, data: &[f32]) -> Result<()> {
        if self.trained {
            return Ok(());
        }
        if data.is_empty() || data.len() % self.d != 0 {
            return Err(Error::InvalidArgument(format!(
                "training data length {} is not a multiple of dim {}",
                data.len(),
                self.d
            )));
        }
        let n = data.len() / self.d;
        if n < self.nlist {
            return Err(Error::InvalidArgument(format!(
                "{n} training vectors for {} lists",
                self.nlist
            )));
        }
        log::info!(
            "training coarse quantizer: {} vectors, {} lists, dim {}",
            n,
            self.nlist,
            self.d
        );
        self.centroids = quantizer::train_kmeans(self.d, self.nlist, data, &self.kmeans);
        self.trained = true;
        Ok(())
    }

    /// Validate an add batch; returns the row count.
    pub fn check_add(&self, elems: usize, n_ids: usize) -> Result<usize> {
        if !self.trained {
            return Err(Error::NotTrained);
        }
        if elems == 0 || elems % self.d != 0 {
            return Err(Error::InvalidArgument(format!(
                "add batch length {elems} is not a positive multiple of dim {}",
                self.d
            )));
        }
        let n = elems / self.d;
        if n != n_ids {
            return Err(Error::InvalidArgument(format!(
                "{n} vectors but {n_ids} ids"
            )));
        }
        Ok(n)
    }

    /// Validate a search call; returns the query count.
    pub fn check_search(
        &self,
        q_elems: usize,
        k: usize,
        dist_len: usize,
        label_len: usize,
    ) -> Result<usize> {
        if !self.trained {
            return Err(Error::NotTrained);
        }
        if k == 0 {
            return Err(Error::InvalidArgument("k must be positive".into()));
        }
        if q_elems == 0 || q_elems % self.d != 0 {
            return Err(Error::InvalidArgument(format!(
                "query batch length {q_elems} is not a positive multiple of dim {}",
                self.d
            )));
        }
        let n = q_elems / self.d;
        if dist_len != n * k || label_len != n * k {
            return Err(Error::InvalidArgument(format!(
                "output buffers must hold {} entries",
                n * k
            )));
        }
        Ok(n)
    }

    pub fn take_auto_ids(&mut self, n: usize) -> Vec<u32> {
        let start = self.next_auto_id;
        self.next_auto_id += n as u32;
        (start..start + n as u32).collect()
    }

    /// L1 phase primitive: dense squared-L2 distances from every query to
    /// every coarse centroid, computed on the device stream.
    pub fn coarse_distances(&self, queries: Vec<f32>) -> Result<Vec<f32>> {
        let d = self.d;
        let nq = queries.len() / d;
        let nlist = self.nlist;
        let centroids = self.centroids.clone();
        let (tx, rx) = bounded(1);
        let flag = self.device.submit(move || {
            let mut out = vec![0.0f32; nq * nlist];
            for (qi, q) in queries.chunks_exact(d).enumerate() {
                for (ci, c) in centroids.chunks_exact(d).enumerate() {
                    out[qi * nlist + ci] = quantizer::l2_sq(q, c);
                }
            }
            let _ = tx.send(out);
        })?;
        self.device.wait(&flag)?;
        rx.recv().map_err(|_| Error::DeviceClosed)
    }

    /// Nearest coarse centroid per input row.
    pub fn assign_lists(&self, queries: Vec<f32>) -> Result<Vec<usize>> {
        let dists = self.coarse_distances(queries)?;
        Ok(dists
            .chunks_exact(self.nlist)
            .map(|row| {
                row.iter()
                    .enumerate()
                    .min_by(|a, b| a.1.total_cmp(b.1))
                    .map(|(i, _)| i)
                    .unwrap_or(0)
            })
            .collect())
    }

    /// The `nprobe` nearest lists per query, nearest first. Ties keep the
    /// first-seen list.
    pub fn probe_lists(&self, queries: Vec<f32>) -> Result<Vec<Vec<usize>>> {
        let dists = self.coarse_distances(queries)?;
        let nprobe = self.nprobe.min(self.nlist);
        Ok(dists
            .chunks_exact(self.nlist)
            .map(|row| {
                let mut top = TopK::new(nprobe);
                for (ci, &dist) in row.iter().enumerate() {
                    top.push(dist, ci as u32);
                }
                top.into_sorted()
                    .into_iter()
                    .map(|(_, ci)| ci as usize)
                    .collect()
            })
            .collect())
    }

    /// Remove everything the selector matches, compacting each list in
    /// parallel. Returns the removed count.
    pub fn remove_where(&mut self, selector: &IdSelector) -> Result<usize> {
        if !self.trained {
            return Err(Error::NotTrained);
        }
        let removed: usize = self
            .lists
            .par_iter_mut()
            .map(|list| list.compact_remove(|id| selector.is_member(id)))
            .sum();
        self.ntotal -= removed;
        if removed > 0 {
            log::debug!("removed {removed} vectors, {} remain", self.ntotal);
        }
        Ok(removed)
    }

    /// Run the L2 phase over the probed lists and return per-query
    /// candidates sorted ascending by match key.
    pub fn scan_lists<F>(&self, probes: &[Vec<usize>], k: usize, scan: F) -> Vec<Vec<(f32, u32)>>
    where
        F: Fn(usize, usize, &InvertedList<T>, Range<usize>, &mut Vec<(f32, u32)>) + Send + Sync,
    {
        scan_probed_lists(&self.lists, probes, k, self.segment_len, self.workers, scan)
    }
}

struct SegmentHits {
    query: usize,
    items: Vec<(f32, u32)>,
}

/// Segmented producer/merge scheduler shared by all variants.
fn scan_probed_lists<T, F>(
    lists: &[InvertedList<T>],
    probes: &[Vec<usize>],
    k: usize,
    segment_len: usize,
    workers: usize,
    scan: F,
) -> Vec<Vec<(f32, u32)>>
where
    T: Copy + Default + Send + Sync,
    F: Fn(usize, usize, &InvertedList<T>, Range<usize>, &mut Vec<(f32, u32)>) + Send + Sync,
{
    let nq = probes.len();
    let workers = workers.max(1);
    let segment_len = segment_len.max(1);
    let mut per_query: Vec<Vec<(f32, u32)>> = vec![Vec::new(); nq];

    let work: Vec<(usize, usize)> = probes
        .iter()
        .enumerate()
        .flat_map(|(q, lists_for_q)| lists_for_q.iter().map(move |&l| (q, l)))
        .collect();
    if work.is_empty() {
        return per_query;
    }

    std::thread::scope(|s| {
        let (txs, rxs): (Vec<Sender<SegmentHits>>, Vec<_>) =
            (0..workers).map(|_| unbounded::<SegmentHits>()).unzip();

        // Merge pool: each worker owns the queries routed to its channel,
        // so folding needs no locks.
        let merge_handles: Vec<_> = rxs
            .into_iter()
            .map(|rx| {
                s.spawn(move || {
                    let mut tops: HashMap<usize, TopK> = HashMap::new();
                    while let Ok(seg) = rx.recv() {
                        tops.entry(seg.query)
                            .or_insert_with(|| TopK::new(k))
                            .extend(seg.items);
                    }
                    tops.into_iter()
                        .map(|(q, top)| (q, top.into_sorted()))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        // Producer pool: segments of one (query, list) pair are emitted in
        // list-scan order; the merge fold does not depend on it.
        let scan = &scan;
        let chunk_size = work.len().div_ceil(workers);
        let mut producers = Vec::new();
        for chunk in work.chunks(chunk_size) {
            let txs = txs.clone();
            producers.push(s.spawn(move || {
                for &(q, l) in chunk {
                    let list = &lists[l];
                    let total = list.len();
                    let mut start = 0;
                    while start < total {
                        let end = (start + segment_len).min(total);
                        let mut items = Vec::with_capacity(end - start);
                        scan(q, l, list, start..end, &mut items);
                        if txs[q % txs.len()]
                            .send(SegmentHits { query: q, items })
                            .is_err()
                        {
                            return;
                        }
                        start = end;
                    }
                }
            }));
        }
        // Closing the channels is the completion signal for the merge pool.
        drop(txs);
        for p in producers {
            let _ = p.join();
        }
        for h in merge_handles {
            if let Ok(parts) = h.join() {
                for (q, sorted) in parts {
                    per_query[q] = sorted;
                }
            }
        }
    });

    per_query
}

/// Write per-query candidates into the caller's sentinel-initialized output
/// buffers, mapping internal keys back to metric-facing values.
pub(crate) fn write_output(
    results: &[Vec<(f32, u32)>],
    k: usize,
    metric: Metric,
    distances: &mut [f32],
    labels: &mut [u32],
) {
    for (q, candidates) in results.iter().enumerate() {
        for (slot, &(key, label)) in candidates.iter().take(k).enumerate() {
            distances[q * k + slot] = match metric {
                Metric::L2 => key,
                // Keys for similarity metrics are negated so that smaller
                // is better; undo that here.
                Metric::Cosine => -key,
            };
            labels[q * k + slot] = label;
        }
    }
}

/// Serialized form of the shared core.
#[derive(Serialize, Deserialize)]
pub(crate) struct CoreSnapshot<T> {
    d: usize,
    nlist: usize,
    metric: Metric,
    code_size: usize,
    nprobe: usize,
    ntotal: usize,
    trained: bool,
    next_auto_id: u32,
    centroids: Vec<f32>,
    lists: Vec<ListSnapshot<T>>,
}

#[derive(Serialize, Deserialize)]
struct ListSnapshot<T> {
    codes: Vec<T>,
    ids: Vec<u32>,
    precompute: Vec<f32>,
}

impl<T> IvfCore<T>
where
    T: Copy + Default + Send + Sync + Serialize + DeserializeOwned,
{
    pub(crate) fn to_snapshot(&self) -> CoreSnapshot<T> {
        CoreSnapshot {
            d: self.d,
            nlist: self.nlist,
            metric: self.metric,
            code_size: self.lists[0].codes.row_size(),
            nprobe: self.nprobe,
            ntotal: self.ntotal,
            trained: self.trained,
            next_auto_id: self.next_auto_id,
            centroids: self.centroids.clone(),
            lists: self
                .lists
                .iter()
                .map(|list| ListSnapshot {
                    codes: list.codes.as_flat().to_vec(),
                    ids: list.ids.clone(),
                    precompute: list.precompute.clone(),
                })
                .collect(),
        }
    }

    pub(crate) fn from_snapshot(
        snap: CoreSnapshot<T>,
        segment_len: usize,
        device_id: u32,
    ) -> Result<Self> {
        let mut core = IvfCore::new(
            snap.d,
            snap.nlist,
            snap.metric,
            snap.code_size,
            segment_len,
            device_id,
        )?;
        core.nprobe = snap.nprobe;
        core.ntotal = snap.ntotal;
        core.trained = snap.trained;
        core.next_auto_id = snap.next_auto_id;
        core.centroids = snap.centroids;
        if snap.lists.len() != core.nlist {
            return Err(Error::Snapshot(format!(
                "snapshot holds {} lists, index expects {}",
                snap.lists.len(),
                core.nlist
            )));
        }
        for (list, snap_list) in core.lists.iter_mut().zip(snap.lists) {
            list.codes.append(&snap_list.codes);
            list.ids = snap_list.ids;
            list.precompute = snap_list.precompute;
            if list.codes.rows() != list.ids.len() {
                return Err(Error::Snapshot(
                    "code rows and ids disagree in snapshot".into(),
                ));
            }
        }
        Ok(core)
    }
}

/// Write a snapshot value to `path` with bincode.
pub(crate) fn save_snapshot<S: Serialize>(path: &Path, snapshot: &S) -> Result<()> {
    let file = std::fs::File::create(path)?;
    let writer = std::io::BufWriter::new(file);
    bincode::serialize_into(writer, snapshot).map_err(|e| Error::Snapshot(e.to_string()))
}

/// Read a snapshot value back from `path`.
pub(crate) fn load_snapshot<S: DeserializeOwned>(path: &Path) -> Result<S> {
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);
    bincode::deserialize_from(reader).map_err(|e| Error::Snapshot(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_with_ids(ids: &[u32]) -> InvertedList<f32> {
        let mut list = InvertedList::new(2);
        for &id in ids {
            list.append_row(&[id as f32, id as f32], id, Some(id as f32));
        }
        list
    }

    #[test]
    fn test_compact_remove_swaps_last_in() {
        let mut list = list_with_ids(&[0, 1, 2, 3]);
        let removed = list.compact_remove(|id| id == 1);
        assert_eq!(removed, 1);
        assert_eq!(list.ids, vec![0, 3, 2]);
        assert_eq!(list.codes.row(1), &[3.0, 3.0]);
        assert_eq!(list.precompute, vec![0.0, 3.0, 2.0]);
    }

    #[test]
    fn test_compact_remove_everything() {
        let mut list = list_with_ids(&[4, 5, 6]);
        assert_eq!(list.compact_remove(|_| true), 3);
        assert!(list.is_empty());
        assert_eq!(list.codes.rows(), 0);
    }

    #[test]
    fn test_compact_remove_nothing() {
        let mut list = list_with_ids(&[4, 5, 6]);
        assert_eq!(list.compact_remove(|id| id > 100), 0);
        assert_eq!(list.ids, vec![4, 5, 6]);
    }

    #[test]
    fn test_scan_scheduler_covers_all_segments() {
        let mut lists = vec![InvertedList::<f32>::new(1)];
        for id in 0..100u32 {
            lists[0].append_row(&[id as f32], id, None);
        }
        let probes = vec![vec![0usize]];
        // Key = value, so the top-5 are ids 0..5 regardless of segmenting.
        let results = scan_probed_lists(&lists, &probes, 5, 7, 3, |_, _, list, range, out| {
            for i in range {
                out.push((list.codes.row(i)[0], list.ids[i]));
            }
        });
        let labels: Vec<u32> = results[0].iter().map(|&(_, id)| id).collect();
        assert_eq!(labels, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_scan_scheduler_empty_probes() {
        let lists = vec![InvertedList::<f32>::new(1)];
        let results = scan_probed_lists(&lists, &[Vec::new()], 5, 8, 2, |_, _, _, _, _| {});
        assert_eq!(results.len(), 1);
        assert!(results[0].is_empty());
    }
}
