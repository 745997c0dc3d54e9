//! Constant-velocity Kalman filter for a single track.
//!
//! The state is `[cx, cy, area, ratio, vcx, vcy, varea]`: center position,
//! box area and aspect ratio plus velocity terms for everything except the
//! aspect ratio, which is assumed constant.

use nalgebra::{SMatrix, SVector};

use crate::track::{BoundingBox, DetectInfo};

const STATE_DIM: usize = 7;
const MEAS_DIM: usize = 4;

type StateVec = SVector<f32, STATE_DIM>;
type StateCov = SMatrix<f32, STATE_DIM, STATE_DIM>;
type MeasVec = SVector<f32, MEAS_DIM>;
type MeasMat = SMatrix<f32, MEAS_DIM, STATE_DIM>;

const PROCESS_NOISE: f32 = 1e-2;
const MEASUREMENT_NOISE: f32 = 1e-1;

/// Predicted widths below this are treated as degenerate.
const DEGENERATE_EPS: f32 = 1e-4;

#[derive(Debug, Clone)]
pub struct KalmanTracker {
    transition: StateCov,
    measurement: MeasMat,
    process_noise: StateCov,
    measurement_noise: SMatrix<f32, MEAS_DIM, MEAS_DIM>,
    state: StateVec,
    covariance: StateCov,
}

/// Convert a box to measurement space `(cx, cy, area, ratio)`.
fn measure(bbox: &BoundingBox) -> MeasVec {
    MeasVec::new(
        bbox.x + bbox.width / 2.0,
        bbox.y + bbox.height / 2.0,
        bbox.width * bbox.height,
        bbox.width / bbox.height,
    )
}

impl KalmanTracker {
    /// Seed the filter from the first observation of a track.
    pub fn new(detect: &DetectInfo) -> Self {
        let mut transition = StateCov::identity();
        // Velocity feeds position and area; the aspect ratio has no
        // velocity term.
        transition[(0, 4)] = 1.0;
        transition[(1, 5)] = 1.0;
        transition[(2, 6)] = 1.0;

        let mut measurement = MeasMat::zeros();
        for i in 0..MEAS_DIM {
            measurement[(i, i)] = 1.0;
        }

        let z = measure(&detect.bbox());
        let mut state = StateVec::zeros();
        state.fixed_rows_mut::<MEAS_DIM>(0).copy_from(&z);

        KalmanTracker {
            transition,
            measurement,
            process_noise: StateCov::identity() * PROCESS_NOISE,
            measurement_noise: SMatrix::identity() * MEASUREMENT_NOISE,
            state,
            covariance: StateCov::identity(),
        }
    }

    /// Advance the state one frame and return the predicted box.
    ///
    /// A degenerate prediction (non-positive area or vanishing width) is
    /// returned as an all-zero box; the caller must exclude it from
    /// matching.
    pub fn predict(&mut self) -> BoundingBox {
        self.state = self.transition * self.state;
        self.covariance =
            self.transition * self.covariance * self.transition.transpose() + self.process_noise;

        let cx = self.state[0];
        let cy = self.state[1];
        let area = self.state[2];
        let ratio = self.state[3];

        let squared = area * ratio;
        if squared <= 0.0 {
            return BoundingBox::default();
        }
        let width = squared.sqrt();
        if width < DEGENERATE_EPS {
            return BoundingBox::default();
        }
        let height = area / width;

        let mut x = cx - width / 2.0;
        let mut y = cy - height / 2.0;
        // Numerical drift must not produce negative corners while the
        // center itself is still on-screen.
        if cx >= 0.0 {
            x = x.max(0.0);
        }
        if cy >= 0.0 {
            y = y.max(0.0);
        }

        BoundingBox {
            x,
            y,
            width,
            height,
        }
    }

    /// Fold an observed box into the state (correction step).
    pub fn update(&mut self, bbox: &BoundingBox) {
        let z = measure(bbox);
        let innovation = z - self.measurement * self.state;
        let s = self.measurement * self.covariance * self.measurement.transpose()
            + self.measurement_noise;

        // Regularize before inverting; an ill-conditioned innovation
        // covariance falls back to a diagonally loaded inverse.
        let s_inv = s.try_inverse().unwrap_or_else(|| {
            let loaded = s + SMatrix::<f32, MEAS_DIM, MEAS_DIM>::identity() * 1e-6;
            loaded
                .try_inverse()
                .unwrap_or_else(SMatrix::<f32, MEAS_DIM, MEAS_DIM>::identity)
        });

        let gain = self.covariance * self.measurement.transpose() * s_inv;
        self.state += gain * innovation;
        self.covariance = (StateCov::identity() - gain * self.measurement) * self.covariance;
    }

    /// The box implied by the current (posterior) state, degenerate-guarded
    /// like [`predict`](Self::predict) but without advancing the state.
    pub fn current_box(&self) -> BoundingBox {
        let area = self.state[2];
        let ratio = self.state[3];
        let squared = area * ratio;
        if squared <= 0.0 {
            return BoundingBox::default();
        }
        let width = squared.sqrt();
        if width < DEGENERATE_EPS {
            return BoundingBox::default();
        }
        let height = area / width;
        BoundingBox {
            x: self.state[0] - width / 2.0,
            y: self.state[1] - height / 2.0,
            width,
            height,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn det(x: f32, y: f32, w: f32, h: f32) -> DetectInfo {
        DetectInfo {
            minx: x,
            miny: y,
            width: w,
            height: h,
            class_id: 0,
            confidence: 1.0,
        }
    }

    #[test]
    fn test_init_state_matches_measurement() {
        let kf = KalmanTracker::new(&det(100.0, 100.0, 40.0, 80.0));
        assert_relative_eq!(kf.state[0], 120.0);
        assert_relative_eq!(kf.state[1], 140.0);
        assert_relative_eq!(kf.state[2], 3200.0);
        assert_relative_eq!(kf.state[3], 0.5);
        assert_relative_eq!(kf.state[4], 0.0);
        assert_relative_eq!(kf.state[5], 0.0);
        assert_relative_eq!(kf.state[6], 0.0);
    }

    #[test]
    fn test_predict_recovers_box_geometry() {
        let mut kf = KalmanTracker::new(&det(100.0, 100.0, 40.0, 80.0));
        let bbox = kf.predict();
        // No velocity yet: the box comes back where it started.
        assert_relative_eq!(bbox.x, 100.0, epsilon = 1e-3);
        assert_relative_eq!(bbox.y, 100.0, epsilon = 1e-3);
        assert_relative_eq!(bbox.width, 40.0, epsilon = 1e-3);
        assert_relative_eq!(bbox.height, 80.0, epsilon = 1e-3);
    }

    #[test]
    fn test_predict_applies_velocity() {
        let mut kf = KalmanTracker::new(&det(100.0, 100.0, 40.0, 80.0));
        kf.state[4] = 10.0;
        kf.state[5] = -5.0;
        let bbox = kf.predict();
        assert_relative_eq!(bbox.x + bbox.width / 2.0, 130.0, epsilon = 1e-3);
        assert_relative_eq!(bbox.y + bbox.height / 2.0, 135.0, epsilon = 1e-3);
    }

    #[test]
    fn test_predict_degenerate_area_returns_zero_box() {
        let mut kf = KalmanTracker::new(&det(10.0, 10.0, 20.0, 20.0));
        kf.state[2] = -5.0;
        let bbox = kf.predict();
        assert_eq!(bbox.x, 0.0);
        assert_eq!(bbox.y, 0.0);
        assert_eq!(bbox.width, 0.0);
        assert_eq!(bbox.height, 0.0);
    }

    #[test]
    fn test_predict_vanishing_width_returns_zero_box() {
        let mut kf = KalmanTracker::new(&det(0.0, 0.0, 1e-10, 1e-10));
        let bbox = kf.predict();
        assert_eq!(bbox.width, 0.0);
        assert_eq!(bbox.height, 0.0);
        assert!(!bbox.width.is_nan());
    }

    #[test]
    fn test_predict_clamps_negative_corner() {
        // Center stays non-negative, the corner would dip below zero.
        let mut kf = KalmanTracker::new(&det(0.0, 0.0, 10.0, 10.0));
        kf.state[0] = 2.0;
        kf.state[1] = 2.0;
        let bbox = kf.predict();
        assert!(bbox.x >= 0.0);
        assert!(bbox.y >= 0.0);
    }

    #[test]
    fn test_update_pulls_state_toward_measurement() {
        let mut kf = KalmanTracker::new(&det(100.0, 100.0, 50.0, 50.0));
        kf.predict();
        kf.update(&BoundingBox {
            x: 110.0,
            y: 105.0,
            width: 50.0,
            height: 50.0,
        });
        assert!(kf.state[0] > 125.0 && kf.state[0] < 135.0);
        assert!(kf.state[1] > 125.0 && kf.state[1] < 130.0);
    }

    #[test]
    fn test_update_shrinks_covariance() {
        let mut kf = KalmanTracker::new(&det(100.0, 100.0, 50.0, 50.0));
        kf.predict();
        let before = kf.covariance[(0, 0)];
        kf.update(&BoundingBox {
            x: 101.0,
            y: 99.0,
            width: 50.0,
            height: 50.0,
        });
        assert!(kf.covariance[(0, 0)] < before);
    }
}
