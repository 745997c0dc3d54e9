//! Track and detection data model.

use std::collections::VecDeque;

use crate::kalman::KalmanTracker;

/// Axis-aligned box, top-left corner plus extent.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// All-zero boxes mark predictions that must not be matched.
    pub fn is_degenerate(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            return 0.0;
        }
        inter / union
    }
}

/// One detector output box. Read-only from the tracker's perspective.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectInfo {
    pub minx: f32,
    pub miny: f32,
    pub width: f32,
    pub height: f32,
    pub class_id: i32,
    pub confidence: f32,
}

impl DetectInfo {
    pub fn bbox(&self) -> BoundingBox {
        BoundingBox {
            x: self.minx,
            y: self.miny,
            width: self.width,
            height: self.height,
        }
    }
}

/// Detection geometry plus the embedding extracted for it, if any.
#[derive(Debug, Clone)]
pub struct Detection {
    pub info: DetectInfo,
    pub feature: Option<Vec<f32>>,
}

impl Detection {
    pub fn new(info: DetectInfo, feature: Option<Vec<f32>>) -> Self {
        Detection { info, feature }
    }
}

/// Stable identity of a live track.
#[derive(Debug, Clone, Copy)]
pub struct TrackInfo {
    pub id: u64,
    pub bbox: BoundingBox,
    /// Frames since the track was created.
    pub age: u32,
}

/// Full per-object tracking state: metadata, motion filter and a bounded
/// history of identity embeddings.
#[derive(Debug, Clone)]
pub struct TraceLet {
    pub info: TrackInfo,
    /// Consecutive frames without an accepted match.
    pub lost_age: u32,
    pub detect_info: DetectInfo,
    kalman: KalmanTracker,
    /// `(embedding, weight)` pairs, most recent last.
    feature_queue: VecDeque<(Vec<f32>, f32)>,
    max_features: usize,
}

impl TraceLet {
    pub fn new(
        id: u64,
        detect: &DetectInfo,
        feature: Option<Vec<f32>>,
        max_features: usize,
    ) -> Self {
        let mut feature_queue = VecDeque::with_capacity(max_features);
        if let Some(feat) = feature {
            feature_queue.push_back((feat, detect.confidence));
        }
        TraceLet {
            info: TrackInfo {
                id,
                bbox: detect.bbox(),
                age: 0,
            },
            lost_age: 0,
            detect_info: *detect,
            kalman: KalmanTracker::new(detect),
            feature_queue,
            max_features,
        }
    }

    /// Advance the motion filter one frame. The internal state moves even
    /// when the returned box is degenerate and gets discarded.
    pub fn predict(&mut self) -> BoundingBox {
        self.info.age += 1;
        let bbox = self.kalman.predict();
        if !bbox.is_degenerate() {
            self.info.bbox = bbox;
        }
        bbox
    }

    /// Fold an accepted detection into the track.
    pub fn update(&mut self, detect: &DetectInfo, feature: Option<Vec<f32>>) {
        self.kalman.update(&detect.bbox());
        self.lost_age = 0;
        self.detect_info = *detect;
        let corrected = self.kalman.current_box();
        self.info.bbox = if corrected.is_degenerate() {
            detect.bbox()
        } else {
            corrected
        };
        if let Some(feat) = feature {
            self.push_feature(feat, detect.confidence);
        }
    }

    /// Append an embedding, evicting the oldest once at capacity.
    pub fn push_feature(&mut self, feature: Vec<f32>, weight: f32) {
        if self.feature_queue.len() == self.max_features {
            self.feature_queue.pop_front();
        }
        self.feature_queue.push_back((feature, weight));
    }

    pub fn feature_count(&self) -> usize {
        self.feature_queue.len()
    }

    /// Weight-normalized mean of the feature queue, L2-normalized so a
    /// single noisy frame cannot dominate the identity embedding.
    pub fn aggregated_feature(&self) -> Option<Vec<f32>> {
        let (first, _) = self.feature_queue.front()?;
        let dim = first.len();
        let mut sum = vec![0.0f32; dim];
        let mut total_weight = 0.0f32;
        for (feat, weight) in &self.feature_queue {
            for (acc, v) in sum.iter_mut().zip(feat) {
                *acc += v * weight;
            }
            total_weight += weight;
        }
        if total_weight > 0.0 {
            for v in &mut sum {
                *v /= total_weight;
            }
        }
        let norm = sum.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut sum {
                *v /= norm;
            }
        }
        Some(sum)
    }
}

/// Cosine similarity of two equal-length embeddings.
pub fn cosine_similarity<T: num_traits::Float + std::iter::Sum>(a: &[T], b: &[T]) -> T {
    let dot: T = a.iter().zip(b).map(|(x, y)| *x * *y).sum();
    let na: T = a.iter().map(|x| *x * *x).sum::<T>().sqrt();
    let nb: T = b.iter().map(|x| *x * *x).sum::<T>().sqrt();
    let denom = na * nb;
    if denom <= T::zero() {
        return T::zero();
    }
    dot / denom
}
