//! Frame-to-frame association of detections to tracks.
//!
//! Every frame runs the same protocol: predict all live tracks, build a
//! track-by-detection cost matrix for the configured metric, solve the
//! assignment, drop weak matches, update the survivors, age out the rest
//! and spawn tracks for leftover detections.

use ndarray::Array2;
use serde::Deserialize;

use crate::hungarian;
use crate::track::{cosine_similarity, BoundingBox, Detection, TraceLet};

/// Pairs carrying this cost can never be matched.
pub const INFEASIBLE_COST: f32 = 1e6;

/// Cost metric for the association matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMetric {
    /// Distance between aggregated track embedding and detection embedding.
    Embedding,
    /// `1 - IoU` of predicted and detected boxes.
    Iou,
    /// Weighted blend of IoU and embedding distance.
    Mixed,
    /// IoU acts as a hard gate, embedding distance ranks the survivors.
    GatedMixed,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub metric: MatchMetric,
    /// Blend factor for [`MatchMetric::Mixed`]: `w*iou + (1-w)*embedding`.
    pub iou_weight: f32,
    /// Matches with a higher cost are discarded after assignment.
    pub match_threshold: f32,
    /// Tracks are dropped once `lost_age` exceeds this.
    pub lost_threshold: u32,
    /// Capacity of the per-track feature queue.
    pub max_features: usize,
    /// Minimum detection confidence to start a new track.
    pub new_track_confidence: f32,
    /// IoU distance above this fails the gate in [`MatchMetric::GatedMixed`].
    pub iou_gate: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            metric: MatchMetric::Mixed,
            iou_weight: 0.6,
            match_threshold: 0.7,
            lost_threshold: 30,
            max_features: 8,
            new_track_confidence: 0.4,
            iou_gate: 0.9,
        }
    }
}

/// What the tracker hands downstream for each matched track this frame.
#[derive(Debug, Clone)]
pub struct TrackedObject {
    pub track_id: u64,
    pub bbox: BoundingBox,
    pub feature: Option<Vec<f32>>,
}

/// Multi-object tracker: owns the live track list and the id generator.
#[derive(Debug)]
pub struct MotConnection {
    config: TrackerConfig,
    tracks: Vec<TraceLet>,
    next_id: u64,
}

impl MotConnection {
    pub fn new(config: TrackerConfig) -> Self {
        MotConnection {
            config,
            tracks: Vec::new(),
            next_id: 0,
        }
    }

    pub fn tracks(&self) -> &[TraceLet] {
        &self.tracks
    }

    /// Run one frame of the association protocol. An empty detection list
    /// is a valid steady state in which every track ages.
    pub fn process_frame(&mut self, detections: &[Detection]) -> Vec<TrackedObject> {
        let predicted: Vec<BoundingBox> =
            self.tracks.iter_mut().map(|t| t.predict()).collect();

        let cost = self.cost_matrix(&predicted, detections);
        let mut assignment = hungarian::assign(cost.view(), INFEASIBLE_COST);

        // Weak matches go back to the unmatched pools.
        let mut matches = Vec::with_capacity(assignment.matches.len());
        for (ti, di) in assignment.matches.drain(..) {
            if cost[[ti, di]] > self.config.match_threshold {
                assignment.unmatched_rows.push(ti);
                assignment.unmatched_cols.push(di);
            } else {
                matches.push((ti, di));
            }
        }

        let mut outputs = Vec::with_capacity(matches.len());
        for &(ti, di) in &matches {
            let det = &detections[di];
            let track = &mut self.tracks[ti];
            track.update(&det.info, det.feature.clone());
            outputs.push(TrackedObject {
                track_id: track.info.id,
                bbox: track.info.bbox,
                feature: track.aggregated_feature(),
            });
        }

        for &ti in &assignment.unmatched_rows {
            self.tracks[ti].lost_age += 1;
        }
        let lost_threshold = self.config.lost_threshold;
        self.tracks.retain(|t| {
            if t.lost_age > lost_threshold {
                log::debug!("track {} aged out after {} lost frames", t.info.id, t.lost_age);
                false
            } else {
                true
            }
        });

        for &di in &assignment.unmatched_cols {
            let det = &detections[di];
            if det.info.confidence >= self.config.new_track_confidence {
                let id = self.next_id;
                self.next_id += 1;
                self.tracks.push(TraceLet::new(
                    id,
                    &det.info,
                    det.feature.clone(),
                    self.config.max_features,
                ));
            }
        }

        outputs
    }

    fn cost_matrix(&self, predicted: &[BoundingBox], detections: &[Detection]) -> Array2<f32> {
        let mut cost = Array2::zeros((predicted.len(), detections.len()));
        for (i, pred) in predicted.iter().enumerate() {
            for (j, det) in detections.iter().enumerate() {
                cost[[i, j]] = if pred.is_degenerate() {
                    INFEASIBLE_COST
                } else {
                    self.pair_cost(&self.tracks[i], pred, det)
                };
            }
        }
        cost
    }

    fn pair_cost(&self, track: &TraceLet, pred: &BoundingBox, det: &Detection) -> f32 {
        let iou_dist = 1.0 - pred.iou(&det.info.bbox());
        match self.config.metric {
            MatchMetric::Iou => iou_dist,
            MatchMetric::Embedding => embedding_distance(track, det).unwrap_or(INFEASIBLE_COST),
            MatchMetric::Mixed => {
                let embed = embedding_distance(track, det).unwrap_or(iou_dist);
                self.config.iou_weight * iou_dist + (1.0 - self.config.iou_weight) * embed
            }
            MatchMetric::GatedMixed => {
                if iou_dist > self.config.iou_gate {
                    INFEASIBLE_COST
                } else {
                    embedding_distance(track, det).unwrap_or(iou_dist)
                }
            }
        }
    }
}

/// Cosine distance between the track's aggregated embedding and the
/// detection's embedding; `None` when either side has no feature.
fn embedding_distance(track: &TraceLet, det: &Detection) -> Option<f32> {
    let track_feat = track.aggregated_feature()?;
    let det_feat = det.feature.as_ref()?;
    if track_feat.len() != det_feat.len() {
        return None;
    }
    Some(1.0 - cosine_similarity(&track_feat, det_feat))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::DetectInfo;

    fn det(x: f32, y: f32, w: f32, h: f32, conf: f32) -> Detection {
        Detection::new(
            DetectInfo {
                minx: x,
                miny: y,
                width: w,
                height: h,
                class_id: 0,
                confidence: conf,
            },
            None,
        )
    }

    fn det_feat(x: f32, y: f32, feature: Vec<f32>) -> Detection {
        Detection::new(
            DetectInfo {
                minx: x,
                miny: y,
                width: 20.0,
                height: 20.0,
                class_id: 0,
                confidence: 0.9,
            },
            Some(feature),
        )
    }

    fn iou_tracker(lost_threshold: u32) -> MotConnection {
        MotConnection::new(TrackerConfig {
            metric: MatchMetric::Iou,
            lost_threshold,
            ..TrackerConfig::default()
        })
    }

    #[test]
    fn test_new_tracks_get_monotonic_ids() {
        let mut tracker = iou_tracker(3);
        tracker.process_frame(&[det(0.0, 0.0, 20.0, 20.0, 0.9)]);
        tracker.process_frame(&[
            det(2.0, 1.0, 20.0, 20.0, 0.9),
            det(300.0, 300.0, 20.0, 20.0, 0.9),
        ]);
        let mut ids: Vec<u64> = tracker.tracks().iter().map(|t| t.info.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn test_low_confidence_detection_does_not_spawn() {
        let mut tracker = iou_tracker(3);
        tracker.process_frame(&[det(0.0, 0.0, 20.0, 20.0, 0.2)]);
        assert!(tracker.tracks().is_empty());
    }

    #[test]
    fn test_track_id_stable_across_frames() {
        let mut tracker = iou_tracker(3);
        tracker.process_frame(&[det(100.0, 100.0, 30.0, 30.0, 0.9)]);
        let id = tracker.tracks()[0].info.id;
        for step in 1..5 {
            let shift = step as f32 * 2.0;
            let outputs =
                tracker.process_frame(&[det(100.0 + shift, 100.0, 30.0, 30.0, 0.9)]);
            assert_eq!(outputs.len(), 1);
            assert_eq!(outputs[0].track_id, id);
        }
        assert_eq!(tracker.tracks().len(), 1);
    }

    #[test]
    fn test_lost_threshold_boundary_is_strict() {
        let mut tracker = iou_tracker(3);
        tracker.process_frame(&[det(50.0, 50.0, 20.0, 20.0, 0.9)]);
        assert_eq!(tracker.tracks().len(), 1);

        // Three empty frames: lost_age reaches the threshold but the
        // comparison is strictly greater, so the track survives.
        for _ in 0..3 {
            tracker.process_frame(&[]);
        }
        assert_eq!(tracker.tracks().len(), 1);
        assert_eq!(tracker.tracks()[0].lost_age, 3);

        // The fourth miss pushes lost_age past the threshold.
        tracker.process_frame(&[]);
        assert!(tracker.tracks().is_empty());
    }

    #[test]
    fn test_rematch_resets_lost_age() {
        let mut tracker = iou_tracker(3);
        tracker.process_frame(&[det(50.0, 50.0, 20.0, 20.0, 0.9)]);
        tracker.process_frame(&[]);
        tracker.process_frame(&[]);
        assert_eq!(tracker.tracks()[0].lost_age, 2);

        tracker.process_frame(&[det(50.0, 50.0, 20.0, 20.0, 0.9)]);
        assert_eq!(tracker.tracks()[0].lost_age, 0);
    }

    #[test]
    fn test_two_objects_keep_identities() {
        let mut tracker = iou_tracker(3);
        tracker.process_frame(&[
            det(0.0, 0.0, 20.0, 20.0, 0.9),
            det(200.0, 200.0, 20.0, 20.0, 0.9),
        ]);
        let outputs = tracker.process_frame(&[
            det(202.0, 201.0, 20.0, 20.0, 0.9),
            det(1.0, 2.0, 20.0, 20.0, 0.9),
        ]);
        assert_eq!(outputs.len(), 2);
        // The object near the origin keeps the id it was born with.
        let near_origin = outputs.iter().find(|o| o.bbox.x < 100.0).unwrap();
        let far = outputs.iter().find(|o| o.bbox.x >= 100.0).unwrap();
        assert_ne!(near_origin.track_id, far.track_id);
        assert_eq!(tracker.tracks().len(), 2);
    }

    #[test]
    fn test_embedding_metric_overrides_geometry() {
        let mut tracker = MotConnection::new(TrackerConfig {
            metric: MatchMetric::Embedding,
            match_threshold: 0.5,
            ..TrackerConfig::default()
        });
        // Two tracks with orthogonal identities.
        tracker.process_frame(&[
            det_feat(0.0, 0.0, vec![1.0, 0.0]),
            det_feat(100.0, 100.0, vec![0.0, 1.0]),
        ]);
        // Detections swap positions; the embedding keeps identities apart.
        let outputs = tracker.process_frame(&[
            det_feat(100.0, 100.0, vec![1.0, 0.0]),
            det_feat(0.0, 0.0, vec![0.0, 1.0]),
        ]);
        assert_eq!(outputs.len(), 2);
        let by_pos = |x: f32| outputs.iter().find(|o| (o.bbox.x - x).abs() < 50.0);
        // The track born at the origin followed its feature to (100, 100).
        assert_eq!(by_pos(100.0).unwrap().track_id, 0);
        assert_eq!(by_pos(0.0).unwrap().track_id, 1);
    }

    #[test]
    fn test_gated_mixed_blocks_distant_pairs() {
        let mut tracker = MotConnection::new(TrackerConfig {
            metric: MatchMetric::GatedMixed,
            iou_gate: 0.9,
            ..TrackerConfig::default()
        });
        tracker.process_frame(&[det_feat(0.0, 0.0, vec![1.0, 0.0])]);
        // Identical feature but no box overlap: the gate forbids the match,
        // so the old track ages and a new one is spawned.
        tracker.process_frame(&[det_feat(500.0, 500.0, vec![1.0, 0.0])]);
        assert_eq!(tracker.tracks().len(), 2);
        assert_eq!(tracker.tracks()[0].lost_age, 1);
    }

    #[test]
    fn test_empty_frames_on_empty_tracker() {
        let mut tracker = iou_tracker(3);
        let outputs = tracker.process_frame(&[]);
        assert!(outputs.is_empty());
        assert!(tracker.tracks().is_empty());
    }
}
