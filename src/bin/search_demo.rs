//! Index micro-demo: build an IVF-Flat index from random vectors and time a
//! few searches.

use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use facetrack::index::ivf_flat::IndexIvfFlat;
use facetrack::index::{Metric, VectorIndex};

#[derive(Parser, Debug)]
#[command(name = "search_demo", about = "IVF-Flat search timing demo")]
struct Args {
    #[arg(long, default_value_t = 128)]
    dim: usize,

    #[arg(long, default_value_t = 10_000)]
    count: usize,

    #[arg(long, default_value_t = 64)]
    nlist: usize,

    #[arg(long, default_value_t = 8)]
    nprobe: usize,

    #[arg(long, default_value_t = 5)]
    k: usize,

    #[arg(short, long, default_value_t = 0)]
    device: u32,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut rng = StdRng::seed_from_u64(11);
    let data: Vec<f32> = (0..args.count * args.dim)
        .map(|_| rng.gen_range(0.0f32..1.0))
        .collect();
    let ids: Vec<u32> = (0..args.count as u32).collect();

    let mut index = IndexIvfFlat::with_device(args.dim, args.nlist, Metric::L2, args.device)?;

    let start = Instant::now();
    index.train(&data)?;
    log::info!("trained {} lists in {:?}", args.nlist, start.elapsed());

    let start = Instant::now();
    index.add_with_ids(&data, &ids)?;
    log::info!("added {} vectors in {:?}", index.ntotal(), start.elapsed());

    index.set_nprobe(args.nprobe);
    let mut distances = vec![0.0f32; args.k];
    let mut labels = vec![0u32; args.k];
    for probe in [0usize, args.count / 2, args.count - 1] {
        let q = &data[probe * args.dim..(probe + 1) * args.dim];
        let start = Instant::now();
        index.search(q, args.k, &mut distances, &mut labels)?;
        log::info!(
            "query {probe}: top-{} {:?} in {:?}",
            args.k,
            &labels[..args.k.min(3)],
            start.elapsed()
        );
    }
    Ok(())
}
