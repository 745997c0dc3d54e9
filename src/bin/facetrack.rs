//! Pipeline demo: synthetic detections with noisy identity embeddings run
//! through tracking and identity search.

use anyhow::Result;
use clap::Parser;
use crossbeam::channel::unbounded;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use facetrack::index::ivf_flat::IndexIvfFlat;
use facetrack::index::VectorIndex;
use facetrack::pipeline::{Pipeline, PipelineMessage, SearchModule, TrackingModule};
use facetrack::track::{DetectInfo, Detection};
use facetrack::Config;

#[derive(Parser, Debug)]
#[command(name = "facetrack", about = "Synthetic tracking + identity search demo")]
struct Args {
    /// Path to a JSON config file.
    #[arg(short, long)]
    config: Option<String>,

    /// Device id to run the index on.
    #[arg(short, long, default_value_t = 0)]
    device: u32,

    /// Number of synthetic frames to process.
    #[arg(short, long, default_value_t = 60)]
    frames: u64,

    /// Number of enrolled identities walking through the scene.
    #[arg(short = 'n', long, default_value_t = 4)]
    identities: usize,
}

fn unit_random(rng: &mut StdRng, dim: usize) -> Vec<f32> {
    let mut v: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-6);
    v.iter_mut().for_each(|x| *x /= norm);
    v
}

fn noisy(rng: &mut StdRng, base: &[f32], sigma: f32) -> Vec<f32> {
    let mut v: Vec<f32> = base
        .iter()
        .map(|x| x + rng.gen_range(-sigma..sigma))
        .collect();
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-6);
    v.iter_mut().for_each(|x| *x /= norm);
    v
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    let dim = config.index.dim;

    // Enroll one embedding per identity.
    let mut rng = StdRng::seed_from_u64(7);
    let gallery: Vec<Vec<f32>> = (0..args.identities)
        .map(|_| unit_random(&mut rng, dim))
        .collect();
    let flat: Vec<f32> = gallery.iter().flatten().copied().collect();
    let labels: Vec<u32> = (0..args.identities as u32).map(|i| 1000 + i).collect();

    let nlist = config.index.nlist.min(args.identities.max(1));
    let mut index = IndexIvfFlat::with_device(dim, nlist, config.index.metric, args.device)?;
    index.train(&flat)?;
    index.add_with_ids(&flat, &labels)?;
    index.set_nprobe(config.index.nprobe);
    log::info!(
        "enrolled {} identities (dim {}, {} lists)",
        args.identities,
        dim,
        nlist
    );

    let stages: Vec<Box<dyn facetrack::pipeline::PipelineModule>> = vec![
        Box::new(TrackingModule::new(config.tracker.clone())),
        Box::new(SearchModule::new(index, config.search_threshold)),
    ];
    let (tx, rx) = unbounded();
    let pipeline = Pipeline::run(stages, rx);

    for frame_id in 0..args.frames {
        let t = frame_id as f32;
        let detections: Vec<Detection> = gallery
            .iter()
            .enumerate()
            .map(|(i, base)| {
                let lane = i as f32 * 150.0;
                Detection::new(
                    DetectInfo {
                        minx: 20.0 + 4.0 * t,
                        miny: 40.0 + lane,
                        width: 48.0,
                        height: 64.0,
                        class_id: 0,
                        confidence: 0.95,
                    },
                    Some(noisy(&mut rng, base, 0.05)),
                )
            })
            .collect();
        tx.send(PipelineMessage::Frame {
            frame_id,
            detections,
        })?;
    }
    drop(tx);

    let mut resolved = 0usize;
    let mut frames_seen = 0u64;
    while let Ok(msg) = pipeline.output().recv() {
        if let PipelineMessage::Identities { frame_id, matches } = msg {
            frames_seen += 1;
            resolved += matches.len();
            for m in &matches {
                log::debug!(
                    "frame {frame_id}: track {} is identity {} (score {:.3})",
                    m.track_id,
                    m.label,
                    m.score
                );
            }
        }
    }
    pipeline.join();

    log::info!(
        "processed {frames_seen} frames, resolved {resolved} identity matches"
    );
    Ok(())
}
