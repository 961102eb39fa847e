use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use spindle_kernel::{BufferCache, CacheConfig, Kernel, KernelConfig, Semaphore};
use spindle_vm::{BlockStore, Disk, DiskConfig, FileStore, MemStore, DEFAULT_BLOCK_SIZE};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Stack size of every thread, in KiB
    #[arg(long, global = true, default_value_t = 256)]
    stack_kib: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fork yielding threads and print how they interleave
    Threads {
        /// Number of threads to fork
        #[arg(short, long, default_value_t = 3)]
        count: usize,

        /// Yields per thread
        #[arg(short, long, default_value_t = 3)]
        rounds: usize,
    },

    /// Drive a random read/write workload through the buffer cache
    Cache {
        /// Disk image to use instead of an in-memory disk
        #[arg(long)]
        disk: Option<PathBuf>,

        /// Size of the in-memory disk in blocks
        #[arg(long, default_value_t = 256)]
        blocks: u32,

        #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE, value_parser = block_size_parser())]
        block_size: usize,

        /// Number of worker threads
        #[arg(short, long, default_value_t = 4)]
        workers: usize,

        /// Operations per worker
        #[arg(long, default_value_t = 100)]
        ops: usize,

        #[arg(long, default_value_t = 16)]
        buckets: usize,

        /// Device requests allowed in flight
        #[arg(long, default_value_t = 16)]
        max_pending: usize,

        /// Service time of every device request, in microseconds
        #[arg(long, default_value_t = 0)]
        latency_us: u64,

        #[arg(long, default_value_t = 1)]
        seed: u64,
    },

    /// Format a zeroed disk image
    Mkdisk {
        path: PathBuf,

        #[arg(long, default_value_t = 1024)]
        blocks: u32,

        #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE, value_parser = block_size_parser())]
        block_size: usize,
    },
}

fn block_size_parser() -> clap::builder::RangedU64ValueParser<usize> {
    clap::builder::RangedU64ValueParser::new().range(1..)
}

struct Workload {
    workers: usize,
    ops: usize,
    seed: u64,
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = KernelConfig {
        stack_size: cli.stack_kib * 1024,
        ..KernelConfig::default()
    };

    match cli.command {
        Commands::Threads { count, rounds } => run_threads(config, count, rounds)?,
        Commands::Cache {
            disk,
            blocks,
            block_size,
            workers,
            ops,
            buckets,
            max_pending,
            latency_us,
            seed,
        } => {
            let store: Box<dyn BlockStore> = match &disk {
                Some(path) => Box::new(
                    FileStore::open(path, block_size)
                        .with_context(|| format!("opening {}", path.display()))?,
                ),
                None => Box::new(MemStore::new(blocks, block_size)),
            };
            let disk_config = DiskConfig {
                latency: (latency_us > 0).then(|| Duration::from_micros(latency_us)),
            };
            let disk = Arc::new(Disk::new("disk", store, disk_config)?);
            let cache_config = CacheConfig {
                buckets,
                max_pending_requests: max_pending,
                ..CacheConfig::default()
            };

            run_cache(
                config,
                disk,
                cache_config,
                Workload {
                    workers,
                    ops,
                    seed,
                },
            )?;
        }
        Commands::Mkdisk {
            path,
            blocks,
            block_size,
        } => {
            FileStore::create(&path, blocks, block_size)
                .with_context(|| format!("creating {}", path.display()))?;
            println!(
                "Formatted {} ({} blocks of {} bytes)",
                path.display(),
                blocks,
                block_size
            );
        }
    }

    Ok(())
}

fn run_threads(config: KernelConfig, count: usize, rounds: usize) -> Result<()> {
    let kernel = Kernel::new(config);

    kernel.run(move |k| {
        for _ in 0..count {
            let forked = k.fork(move |k| {
                for round in 0..rounds {
                    println!("{} round {}", k.current(), round);
                    k.yield_now();
                }
            });
            if let Err(e) = forked {
                error!("Fork failed: {}", e);
                break;
            }
        }
    })?;

    Ok(())
}

fn run_cache(
    config: KernelConfig,
    disk: Arc<Disk>,
    cache_config: CacheConfig,
    workload: Workload,
) -> Result<()> {
    if disk.block_count() == 0 {
        bail!("{} has no blocks", disk.name());
    }

    let kernel = Kernel::new(config);
    let cache = Arc::new(BufferCache::new(cache_config));
    let failures = Arc::new(AtomicUsize::new(0));

    {
        let cache = Arc::clone(&cache);
        let disk = Arc::clone(&disk);
        let failures = Arc::clone(&failures);

        kernel.run(move |k| {
            let done = Arc::new(Semaphore::new(0));
            let mut forked = 0;

            for worker in 0..workload.workers {
                let cache = Arc::clone(&cache);
                let disk = Arc::clone(&disk);
                let failures = Arc::clone(&failures);
                let done = Arc::clone(&done);
                let seed = workload.seed.wrapping_add(worker as u64);
                let ops = workload.ops;

                let result = k.fork(move |k| {
                    exercise(k, &cache, &disk, seed, ops, &failures);
                    done.v(k);
                });
                match result {
                    Ok(_) => forked += 1,
                    Err(e) => error!("Fork of worker {} failed: {}", worker, e),
                }
            }

            for _ in 0..forked {
                done.p(k);
            }

            match cache.flush(k, &disk) {
                Ok(written) => info!("Flushed {} block(s)", written),
                Err(e) => {
                    error!("Flush failed: {}", e);
                    failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        })?;
    }

    let stats = cache.stats();
    println!(
        "cache: {} hits, {} misses, {} evictions, {} writes, {} resident",
        stats.hits, stats.misses, stats.evictions, stats.writes, stats.live_blocks
    );
    println!(
        "{}: {} reads, {} writes, {} failures",
        disk.id(),
        disk.stats().reads(),
        disk.stats().writes(),
        disk.stats().failures()
    );

    let failed = failures.load(Ordering::Relaxed);
    if failed > 0 {
        bail!("{} operation(s) failed", failed);
    }
    Ok(())
}

fn exercise(
    k: &Kernel,
    cache: &BufferCache,
    disk: &Arc<Disk>,
    seed: u64,
    ops: usize,
    failures: &AtomicUsize,
) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; disk.block_size()];

    for _ in 0..ops {
        let block = rng.gen_range(0..disk.block_count());
        let result = match rng.gen_range(0..4) {
            0 => {
                rng.fill(&mut data[..]);
                cache.push(k, disk, block, &data)
            }
            1 => {
                rng.fill(&mut data[..]);
                cache.push_deferred(k, disk, block, &data)
            }
            _ => cache.pull(k, disk, block, &mut data),
        };

        if let Err(e) = result {
            warn!("{} on block {}: {}", k.current(), block, e);
            failures.fetch_add(1, Ordering::Relaxed);
        }
        if rng.gen_bool(0.25) {
            k.yield_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_block_size_rejected() {
        assert!(Cli::try_parse_from(["spindle", "cache", "--block-size", "0"]).is_err());
        assert!(Cli::try_parse_from(["spindle", "mkdisk", "a.img", "--block-size", "0"]).is_err());

        let cli = Cli::try_parse_from(["spindle", "mkdisk", "a.img", "--block-size", "128"]).unwrap();
        assert!(matches!(cli.command, Commands::Mkdisk { block_size: 128, .. }));
    }
}
