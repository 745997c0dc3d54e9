//! Coarse (k-means) and product quantizers.

use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::index::SUPPORTED_SUB_QUANTIZERS;

pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub(crate) fn l2_sq(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let diff = x - y;
            diff * diff
        })
        .sum()
}

/// Index of the nearest centroid to `x` among `centroids` (`k` rows of `d`).
pub(crate) fn nearest_centroid(x: &[f32], centroids: &[f32], d: usize) -> usize {
    let mut best = 0;
    let mut best_dist = f32::MAX;
    for (ci, c) in centroids.chunks_exact(d).enumerate() {
        let dist = l2_sq(x, c);
        if dist < best_dist {
            best_dist = dist;
            best = ci;
        }
    }
    best
}

#[derive(Debug, Clone)]
pub struct KmeansParams {
    pub niter: usize,
    pub seed: u64,
    /// Training is subsampled to `k * max_points_per_centroid` points.
    pub max_points_per_centroid: usize,
}

impl Default for KmeansParams {
    fn default() -> Self {
        KmeansParams {
            niter: 10,
            seed: 0x5eed_1234,
            max_points_per_centroid: 16,
        }
    }
}

/// Lloyd's k-means over `data` (`n` rows of `d`); returns `k * d` centroids.
pub fn train_kmeans(d: usize, k: usize, data: &[f32], params: &KmeansParams) -> Vec<f32> {
    assert!(d > 0 && k > 0 && data.len() % d == 0);
    let n = data.len() / d;
    let mut rng = StdRng::seed_from_u64(params.seed);

    // Cap the training set; quality past a few points per centroid is not
    // worth the assignment cost.
    let cap = k * params.max_points_per_centroid.max(1);
    let points: Vec<&[f32]> = if n > cap {
        sample(&mut rng, n, cap)
            .into_iter()
            .map(|i| &data[i * d..(i + 1) * d])
            .collect()
    } else {
        data.chunks_exact(d).collect()
    };
    let np = points.len();

    let mut centroids = vec![0.0f32; k * d];
    if np >= k {
        for (slot, i) in sample(&mut rng, np, k).into_iter().enumerate() {
            centroids[slot * d..(slot + 1) * d].copy_from_slice(points[i]);
        }
    } else {
        for slot in 0..k {
            centroids[slot * d..(slot + 1) * d].copy_from_slice(points[slot % np]);
        }
    }

    for _ in 0..params.niter {
        let assignments: Vec<usize> = points
            .par_iter()
            .map(|p| nearest_centroid(p, &centroids, d))
            .collect();

        let mut sums = vec![0.0f32; k * d];
        let mut counts = vec![0usize; k];
        for (p, &c) in points.iter().zip(&assignments) {
            counts[c] += 1;
            for (acc, v) in sums[c * d..(c + 1) * d].iter_mut().zip(*p) {
                *acc += v;
            }
        }

        for c in 0..k {
            if counts[c] == 0 {
                // Reseed empty clusters from a random training point.
                let i = rng.gen_range(0..np);
                centroids[c * d..(c + 1) * d].copy_from_slice(points[i]);
            } else {
                let inv = 1.0 / counts[c] as f32;
                for (dst, src) in centroids[c * d..(c + 1) * d]
                    .iter_mut()
                    .zip(&sums[c * d..(c + 1) * d])
                {
                    *dst = src * inv;
                }
            }
        }
    }

    centroids
}

/// Product quantizer: `m` sub-spaces of `d / m` dims, 256-entry codebooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductQuantizer {
    d: usize,
    m: usize,
    dsub: usize,
    ksub: usize,
    /// `m * ksub * dsub` codebook entries.
    codebooks: Vec<f32>,
    trained: bool,
}

impl ProductQuantizer {
    pub fn new(d: usize, m: usize) -> Result<Self> {
        if !SUPPORTED_SUB_QUANTIZERS.contains(&m) {
            return Err(Error::Config(format!(
                "unsupported sub-quantizer count {m}"
            )));
        }
        if d % m != 0 {
            return Err(Error::Config(format!(
                "dimension {d} is not divisible by {m} sub-quantizers"
            )));
        }
        Ok(ProductQuantizer {
            d,
            m,
            dsub: d / m,
            ksub: 256,
            codebooks: Vec::new(),
            trained: false,
        })
    }

    pub fn sub_quantizers(&self) -> usize {
        self.m
    }

    pub fn ksub(&self) -> usize {
        self.ksub
    }

    pub fn is_trained(&self) -> bool {
        self.trained
    }

    /// Train one codebook per sub-space on the matching slice of `data`.
    pub fn train(&mut self, data: &[f32], params: &KmeansParams) {
        if self.trained {
            return;
        }
        let n = data.len() / self.d;
        self.codebooks = vec![0.0f32; self.m * self.ksub * self.dsub];
        for sub in 0..self.m {
            let mut subvectors = Vec::with_capacity(n * self.dsub);
            for row in data.chunks_exact(self.d) {
                subvectors.extend_from_slice(&row[sub * self.dsub..(sub + 1) * self.dsub]);
            }
            let sub_params = KmeansParams {
                seed: params.seed.wrapping_add(sub as u64),
                ..params.clone()
            };
            let book = train_kmeans(self.dsub, self.ksub, &subvectors, &sub_params);
            let start = sub * self.ksub * self.dsub;
            self.codebooks[start..start + book.len()].copy_from_slice(&book);
        }
        self.trained = true;
    }

    fn codebook(&self, sub: usize) -> &[f32] {
        let start = sub * self.ksub * self.dsub;
        &self.codebooks[start..start + self.ksub * self.dsub]
    }

    /// Encode one `d`-dim vector into `m` code bytes.
    pub fn encode_one(&self, x: &[f32], out: &mut [u8]) {
        debug_assert!(self.trained && x.len() == self.d && out.len() == self.m);
        for sub in 0..self.m {
            let part = &x[sub * self.dsub..(sub + 1) * self.dsub];
            out[sub] = nearest_centroid(part, self.codebook(sub), self.dsub) as u8;
        }
    }

    /// Reconstruct the codebook approximation of an encoded vector.
    pub fn decode_one(&self, codes: &[u8], out: &mut [f32]) {
        debug_assert!(codes.len() == self.m && out.len() == self.d);
        for (sub, &code) in codes.iter().enumerate() {
            let entry = &self.codebook(sub)
                [code as usize * self.dsub..(code as usize + 1) * self.dsub];
            out[sub * self.dsub..(sub + 1) * self.dsub].copy_from_slice(entry);
        }
    }

    /// Per-sub-space squared distances from `q` to every codebook entry;
    /// distance of a coded vector is then `m` table lookups.
    pub fn distance_table(&self, q: &[f32]) -> Vec<f32> {
        debug_assert!(q.len() == self.d);
        let mut table = vec![0.0f32; self.m * self.ksub];
        for sub in 0..self.m {
            let part = &q[sub * self.dsub..(sub + 1) * self.dsub];
            let book = self.codebook(sub);
            for code in 0..self.ksub {
                table[sub * self.ksub + code] =
                    l2_sq(part, &book[code * self.dsub..(code + 1) * self.dsub]);
            }
        }
        table
    }

    /// Sum the table entries selected by `codes`.
    pub fn table_distance(&self, table: &[f32], codes: &[u8]) -> f32 {
        codes
            .iter()
            .enumerate()
            .map(|(sub, &code)| table[sub * self.ksub + code as usize])
            .sum()
    }
}
