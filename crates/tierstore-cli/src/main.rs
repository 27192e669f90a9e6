//! tierstore CLI: stress driver and scratch-directory maintenance.

use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tierstore_core::config::FactoryConfig;
use tierstore_io::{FilenameGenerator, SerialExecutor};
use tierstore_temp::{StorageFactory, TempBucket, TempRandomAccessStore};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "tierstore")]
#[command(about = "Tiered RAM/disk scratch storage: stress testing and maintenance", long_about = None)]
struct Cli {
    /// Config file (JSON); environment variables apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Hammer a factory from several threads and verify every byte read back
    Stress {
        /// Worker threads
        #[arg(long, default_value_t = 4)]
        threads: usize,

        /// Objects created per thread
        #[arg(long, default_value_t = 200)]
        objects: usize,

        /// Largest object size in bytes
        #[arg(long, default_value_t = 256 * 1024)]
        max_size: u64,

        /// Encrypt scratch files
        #[arg(long)]
        encrypt: bool,

        /// Seed for the workload (object sizes, contents, operations)
        #[arg(long, default_value_t = 0)]
        seed: u64,

        /// Scratch directory (overrides config)
        #[arg(long)]
        temp_dir: Option<PathBuf>,
    },

    /// Remove scratch files left behind by a crashed process
    Sweep {
        /// Scratch directory (overrides config)
        #[arg(long)]
        temp_dir: Option<PathBuf>,

        /// Scratch file prefix (overrides config)
        #[arg(long)]
        prefix: Option<String>,
    },

    /// Print the effective configuration as JSON
    Config,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match load_config(cli.config.as_ref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Stress {
            threads,
            objects,
            max_size,
            encrypt,
            seed,
            temp_dir,
        } => {
            let mut config = config;
            config.encrypt_on_disk |= encrypt;
            if let Some(dir) = temp_dir {
                config.temp_dir = dir;
            }
            run_stress(config, threads, objects, max_size, seed)
        }
        Commands::Sweep { temp_dir, prefix } => {
            let mut config = config;
            if let Some(dir) = temp_dir {
                config.temp_dir = dir;
            }
            if let Some(prefix) = prefix {
                config.file_prefix = prefix;
            }
            sweep(&config)
        }
        Commands::Config => serde_json::to_string_pretty(&config)
            .map(|json| println!("{}", json))
            .map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn load_config(path: Option<&PathBuf>) -> CliResult<FactoryConfig> {
    let config = match path {
        Some(p) => FactoryConfig::from_json_file(p)?,
        None => FactoryConfig::from_env(),
    };
    config.validate()?;
    Ok(config)
}

fn sweep(config: &FactoryConfig) -> CliResult<()> {
    let names = FilenameGenerator::from_entropy(&config.temp_dir, config.file_prefix.clone())?;
    let removed = names.wipe_leftovers()?;
    println!("removed {} scratch file(s) from {}", removed, config.temp_dir.display());
    Ok(())
}

fn run_stress(
    config: FactoryConfig,
    threads: usize,
    objects: usize,
    max_size: u64,
    seed: u64,
) -> CliResult<()> {
    let executor = Arc::new(SerialExecutor::new("tierstore-stress-bg")?);
    let factory = StorageFactory::builder(config.clone())
        .runner(executor.clone())
        .build()?;
    info!(threads, objects, max_size, seed, "starting stress run");

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let factory = factory.clone();
            let worker_seed = seed.wrapping_add(t as u64);
            thread::Builder::new()
                .name(format!("stress-{}", t))
                .spawn(move || stress_worker(&factory, worker_seed, objects, max_size))
        })
        .collect::<Result<_, _>>()?;

    let mut failures = 0usize;
    for handle in handles {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                eprintln!("worker failed: {}", e);
                failures += 1;
            }
            Err(_) => {
                eprintln!("worker panicked");
                failures += 1;
            }
        }
    }
    executor.flush();

    let stats = factory.stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);

    let names = FilenameGenerator::from_entropy(&config.temp_dir, config.file_prefix.clone())?;
    let leftovers = names.list_leftovers()?;
    if failures > 0 {
        return Err(format!("{} worker(s) failed", failures).into());
    }
    if stats.ram_used != 0 {
        return Err(format!("{} RAM bytes still accounted after freeing everything", stats.ram_used).into());
    }
    if !leftovers.is_empty() {
        return Err(format!("{} scratch file(s) left behind", leftovers.len()).into());
    }
    Ok(())
}

fn fill(rng: &mut StdRng, len: u64) -> Vec<u8> {
    let mut data = vec![0u8; len as usize];
    rng.fill(&mut data[..]);
    data
}

type WorkerResult = Result<(), String>;

fn stress_worker(factory: &StorageFactory, seed: u64, objects: usize, max_size: u64) -> WorkerResult {
    let mut rng = StdRng::seed_from_u64(seed);
    for i in 0..objects {
        let size = rng.gen_range(0..=max_size);
        let outcome = match rng.gen_range(0..3) {
            0 => bucket_round(factory, &mut rng, size),
            1 => store_round(factory, &mut rng, size),
            _ => converted_round(factory, &mut rng, size),
        };
        outcome.map_err(|e| format!("object {} (size {}): {}", i, size, e))?;
    }
    debug!(seed, objects, "stress worker done");
    Ok(())
}

fn write_bucket(factory: &StorageFactory, rng: &mut StdRng, data: &[u8]) -> CliResult<TempBucket> {
    let bucket = if rng.gen_bool(0.5) {
        factory.make_bucket(data.len() as u64)?
    } else {
        factory.make_growable_bucket()?
    };
    let mut w = bucket.open_for_write()?;
    for chunk in data.chunks(rng.gen_range(1..=8192)) {
        w.write_all(chunk)?;
    }
    w.close()?;
    Ok(bucket)
}

fn bucket_round(factory: &StorageFactory, rng: &mut StdRng, size: u64) -> CliResult<()> {
    let data = fill(rng, size);
    let bucket = write_bucket(factory, rng, &data)?;
    if rng.gen_bool(0.3) {
        bucket.migrate_to_disk()?;
    }
    let mut back = Vec::with_capacity(data.len());
    bucket.open_for_read()?.read_to_end(&mut back)?;
    let ok = back == data;
    bucket.free()?;
    if !ok {
        return Err("bucket contents differ".into());
    }
    Ok(())
}

fn check_store(store: &TempRandomAccessStore, model: &[u8]) -> CliResult<()> {
    let mut back = vec![0u8; model.len()];
    store.pread(0, &mut back)?;
    if back != model {
        return Err("store contents differ".into());
    }
    Ok(())
}

fn scribble(store: &TempRandomAccessStore, rng: &mut StdRng, model: &mut [u8]) -> CliResult<()> {
    if model.is_empty() {
        return Ok(());
    }
    for _ in 0..rng.gen_range(1..8) {
        let offset = rng.gen_range(0..model.len());
        let len = rng.gen_range(0..=(model.len() - offset).min(4096));
        let patch = fill(rng, len as u64);
        store.pwrite(offset as u64, &patch)?;
        model[offset..offset + len].copy_from_slice(&patch);
    }
    Ok(())
}

fn store_round(factory: &StorageFactory, rng: &mut StdRng, size: u64) -> CliResult<()> {
    let store = factory.make_random_access_store(size)?;
    let mut model = vec![0u8; size as usize];
    let result = (|| -> CliResult<()> {
        check_store(&store, &model)?;
        scribble(&store, rng, &mut model)?;
        if rng.gen_bool(0.3) {
            store.migrate_to_disk()?;
        }
        scribble(&store, rng, &mut model)?;
        check_store(&store, &model)
    })();
    store.free()?;
    result
}

fn converted_round(factory: &StorageFactory, rng: &mut StdRng, size: u64) -> CliResult<()> {
    let mut model = fill(rng, size);
    let bucket = write_bucket(factory, rng, &model)?;
    let store = bucket.to_random_access_store()?;
    let result = (|| -> CliResult<()> {
        scribble(&store, rng, &mut model)?;
        check_store(&store, &model)?;
        let mut back = Vec::with_capacity(model.len());
        bucket.open_for_read()?.read_to_end(&mut back)?;
        if back != model {
            return Err("bucket view differs after conversion".into());
        }
        Ok(())
    })();
    if rng.gen_bool(0.5) {
        bucket.free()?;
    } else {
        store.free()?;
    }
    result
}
