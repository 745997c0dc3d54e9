//! Thin module pipeline: typed messages over bounded channels.
//!
//! Each stage runs on its own thread and talks to its neighbors through a
//! bounded channel; closing the input channel shuts the whole chain down.
//! A stage error skips the message and keeps the pipeline alive.

use std::collections::HashMap;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{bounded, Receiver};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::index::ivf_flat::IndexIvfFlat;
use crate::index::{Metric, VectorIndex, LABEL_SENTINEL};
use crate::track::Detection;
use crate::tracker::{MotConnection, TrackedObject, TrackerConfig};

const STAGE_QUEUE_DEPTH: usize = 8;

/// An identity lookup accepted by the search stage.
#[derive(Debug, Clone)]
pub struct IdentityMatch {
    pub track_id: u64,
    pub label: u32,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub enum PipelineMessage {
    Frame {
        frame_id: u64,
        detections: Vec<Detection>,
    },
    Tracks {
        frame_id: u64,
        objects: Vec<TrackedObject>,
    },
    Identities {
        frame_id: u64,
        matches: Vec<IdentityMatch>,
    },
}

/// One processing stage. Messages a stage does not handle pass through
/// unchanged so stages can be composed in any order.
pub trait PipelineModule: Send {
    fn name(&self) -> &str;
    fn process(&mut self, msg: PipelineMessage) -> Result<Option<PipelineMessage>>;
}

/// Associates detections to tracks frame by frame.
pub struct TrackingModule {
    tracker: MotConnection,
}

impl TrackingModule {
    pub fn new(config: TrackerConfig) -> Self {
        TrackingModule {
            tracker: MotConnection::new(config),
        }
    }
}

impl PipelineModule for TrackingModule {
    fn name(&self) -> &str {
        "tracking"
    }

    fn process(&mut self, msg: PipelineMessage) -> Result<Option<PipelineMessage>> {
        match msg {
            PipelineMessage::Frame {
                frame_id,
                detections,
            } => {
                let objects = self.tracker.process_frame(&detections);
                Ok(Some(PipelineMessage::Tracks { frame_id, objects }))
            }
            other => Ok(Some(other)),
        }
    }
}

/// Looks up track embeddings in the identity index. A lookup below the
/// acceptance threshold yields no match, which is not an error.
pub struct SearchModule {
    index: IndexIvfFlat,
    threshold: f32,
}

impl SearchModule {
    pub fn new(index: IndexIvfFlat, threshold: f32) -> Self {
        SearchModule { index, threshold }
    }

    fn accept(&self, score: f32) -> bool {
        match self.index.metric() {
            Metric::L2 => score <= self.threshold,
            Metric::Cosine => score >= self.threshold,
        }
    }
}

impl PipelineModule for SearchModule {
    fn name(&self) -> &str {
        "search"
    }

    fn process(&mut self, msg: PipelineMessage) -> Result<Option<PipelineMessage>> {
        match msg {
            PipelineMessage::Tracks { frame_id, objects } => {
                let mut matches = Vec::new();
                for obj in &objects {
                    let Some(feature) = obj.feature.as_deref() else {
                        continue;
                    };
                    let mut distances = [0.0f32];
                    let mut labels = [0u32];
                    self.index
                        .search(feature, 1, &mut distances, &mut labels)?;
                    if labels[0] != LABEL_SENTINEL && self.accept(distances[0]) {
                        matches.push(IdentityMatch {
                            track_id: obj.track_id,
                            label: labels[0],
                            score: distances[0],
                        });
                    }
                }
                Ok(Some(PipelineMessage::Identities { frame_id, matches }))
            }
            other => Ok(Some(other)),
        }
    }
}

type ModuleFactory = Box<dyn FnMut(&Config) -> Result<Box<dyn PipelineModule>> + Send>;

/// Factory functions keyed by module tag, resolved at composition time.
#[derive(Default)]
pub struct ModuleRegistry {
    factories: HashMap<&'static str, ModuleFactory>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-loaded with the modules that need no external state.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            "tracking",
            Box::new(|cfg: &Config| {
                Ok(Box::new(TrackingModule::new(cfg.tracker.clone())) as Box<dyn PipelineModule>)
            }),
        );
        registry
    }

    pub fn register(&mut self, tag: &'static str, factory: ModuleFactory) {
        self.factories.insert(tag, factory);
    }

    pub fn create(&mut self, tag: &str, config: &Config) -> Result<Box<dyn PipelineModule>> {
        match self.factories.get_mut(tag) {
            Some(factory) => factory(config),
            None => Err(Error::Config(format!("unknown module tag {tag:?}"))),
        }
    }
}

/// A running chain of stages. Feed the input channel, read the output
/// receiver, drop the input sender to shut down.
pub struct Pipeline {
    output: Receiver<PipelineMessage>,
    handles: Vec<JoinHandle<()>>,
}

impl Pipeline {
    pub fn run(stages: Vec<Box<dyn PipelineModule>>, input: Receiver<PipelineMessage>) -> Self {
        let mut rx = input;
        let mut handles = Vec::new();
        for mut stage in stages {
            let (tx_next, rx_next) = bounded(STAGE_QUEUE_DEPTH);
            let rx_cur = rx;
            handles.push(thread::spawn(move || {
                while let Ok(msg) = rx_cur.recv() {
                    match stage.process(msg) {
                        Ok(Some(out)) => {
                            if tx_next.send(out).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            log::warn!("{} stage failed, message skipped: {e}", stage.name());
                        }
                    }
                }
            }));
            rx = rx_next;
        }
        Pipeline {
            output: rx,
            handles,
        }
    }

    pub fn output(&self) -> &Receiver<PipelineMessage> {
        &self.output
    }

    /// Wait for every stage to drain and exit.
    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::DetectInfo;
    use crate::tracker::MatchMetric;
    use crossbeam::channel::unbounded;

    fn detection(x: f32, feature: Vec<f32>) -> Detection {
        Detection::new(
            DetectInfo {
                minx: x,
                miny: 10.0,
                width: 20.0,
                height: 20.0,
                class_id: 0,
                confidence: 0.9,
            },
            Some(feature),
        )
    }

    fn unit(dim: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[axis] = 1.0;
        v
    }

    fn enrolled_index(dim: usize) -> IndexIvfFlat {
        let mut gallery = Vec::new();
        for axis in 0..3 {
            gallery.extend_from_slice(&unit(dim, axis));
        }
        let mut index = IndexIvfFlat::new(dim, 1, Metric::Cosine).unwrap();
        index.train(&gallery).unwrap();
        index.add_with_ids(&gallery, &[100, 200, 300]).unwrap();
        index
    }

    #[test]
    fn test_registry_resolves_tracking() {
        let mut registry = ModuleRegistry::with_defaults();
        let config = Config::default();
        assert!(registry.create("tracking", &config).is_ok());
        assert!(registry.create("bogus", &config).is_err());
    }

    #[test]
    fn test_frame_to_identity_chain() {
        let dim = 16;
        let tracker_config = TrackerConfig {
            metric: MatchMetric::Iou,
            ..TrackerConfig::default()
        };
        let stages: Vec<Box<dyn PipelineModule>> = vec![
            Box::new(TrackingModule::new(tracker_config)),
            Box::new(SearchModule::new(enrolled_index(dim), 0.8)),
        ];

        let (tx, rx) = unbounded();
        let pipeline = Pipeline::run(stages, rx);
        for frame_id in 0..3u64 {
            let shift = frame_id as f32;
            tx.send(PipelineMessage::Frame {
                frame_id,
                detections: vec![
                    detection(10.0 + shift, unit(dim, 0)),
                    detection(200.0 + shift, unit(dim, 2)),
                ],
            })
            .unwrap();
        }
        drop(tx);

        let mut per_frame = Vec::new();
        while let Ok(msg) = pipeline.output().recv() {
            if let PipelineMessage::Identities { matches, .. } = msg {
                per_frame.push(matches);
            }
        }
        pipeline.join();

        // Frame 0 only spawns tracks; the two later frames match them and
        // resolve both identities.
        assert_eq!(per_frame.len(), 3);
        assert!(per_frame[0].is_empty());
        for matches in &per_frame[1..] {
            let mut labels: Vec<u32> = matches.iter().map(|m| m.label).collect();
            labels.sort_unstable();
            assert_eq!(labels, vec![100, 300]);
            for m in matches {
                assert!(m.score > 0.99);
            }
        }
    }

    #[test]
    fn test_stage_error_skips_message() {
        struct Flaky;
        impl PipelineModule for Flaky {
            fn name(&self) -> &str {
                "flaky"
            }
            fn process(&mut self, msg: PipelineMessage) -> Result<Option<PipelineMessage>> {
                match &msg {
                    PipelineMessage::Frame { frame_id, .. } if frame_id % 2 == 1 => {
                        Err(Error::InvalidArgument("odd frame".into()))
                    }
                    _ => Ok(Some(msg)),
                }
            }
        }

        let (tx, rx) = unbounded();
        let pipeline = Pipeline::run(vec![Box::new(Flaky)], rx);
        for frame_id in 0..4u64 {
            tx.send(PipelineMessage::Frame {
                frame_id,
                detections: Vec::new(),
            })
            .unwrap();
        }
        drop(tx);

        let mut passed = Vec::new();
        while let Ok(PipelineMessage::Frame { frame_id, .. }) = pipeline.output().recv() {
            passed.push(frame_id);
        }
        pipeline.join();
        assert_eq!(passed, vec![0, 2]);
    }
}
