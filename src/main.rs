use clap::{Parser, ValueEnum};
use log::{debug, info};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use cafs::notifier::init_logging;
use cafs::{ConvertOptions, Converter, Lazifier, Notifier, Sharding, TreeMode};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum ShardingArg {
    /// <pool>/<hash>
    Flat,
    /// <pool>/<hash[0..2]>/<hash>
    Prefix2,
}

impl From<ShardingArg> for Sharding {
    fn from(arg: ShardingArg) -> Self {
        match arg {
            ShardingArg::Flat => Sharding::Flat,
            ShardingArg::Prefix2 => Sharding::PREFIX2,
        }
    }
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(help = "Image tarball produced by `docker save`")]
    tarball: PathBuf,

    #[arg(help = "Lazifier program, run as `<lazifier> [args...] <root> <meta> <pool>`")]
    lazifier: String,

    #[arg(
        trailing_var_arg = true,
        allow_hyphen_values = true,
        help = "Extra arguments passed to the lazifier before root, meta and pool"
    )]
    lazifier_args: Vec<String>,

    #[arg(long, help = "Pool directory (default: <tarball stem>-pool next to the tarball)")]
    pool: Option<PathBuf>,

    #[arg(
        short,
        long,
        help = "Output directory (default: <tarball stem>-lazy next to the tarball)"
    )]
    output: Option<PathBuf>,

    #[arg(long, help = "Emit one tree per layer instead of the merged filesystem")]
    per_layer: bool,

    #[arg(long, help = "Threads hashing file content (default: available cores)")]
    workers: Option<usize>,

    #[arg(long, value_name = "SECS", help = "Kill the lazifier after this many seconds")]
    timeout: Option<u64>,

    #[arg(long, value_enum, default_value = "flat", help = "Pool directory layout")]
    sharding: ShardingArg,

    #[arg(long, help = "Skip checking layers against the config's diff_ids")]
    no_verify: bool,

    #[arg(long, help = "Hardlink materialized files to pool blobs instead of copying")]
    link: bool,

    #[arg(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Verbose mode (-v for info, -vv for debug, -vvv for trace). Also switches to text-based progress"
    )]
    verbose: u8,
}

impl Cli {
    fn options(&self) -> ConvertOptions {
        let defaults = ConvertOptions::default();
        ConvertOptions {
            tree_mode: if self.per_layer {
                TreeMode::PerLayer
            } else {
                TreeMode::Merged
            },
            workers: self.workers.unwrap_or(defaults.workers).max(1),
            sharding: self.sharding.into(),
            verify_diff_ids: !self.no_verify,
            link_from_pool: self.link,
            lazifier: Some(Lazifier::new(&self.lazifier).with_args(self.lazifier_args.clone())),
            lazifier_timeout: self.timeout.map(Duration::from_secs),
            pool_dir: self.pool.clone(),
            output_dir: self.output.clone(),
            ..defaults
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    info!("Starting cafs with image: {}", cli.tarball.display());
    debug!("Lazifier: {} {:?}", cli.lazifier, cli.lazifier_args);

    let mut converter = Converter::new(cli.options(), Notifier::new(cli.verbose));
    match converter.convert(&cli.tarball) {
        Ok(report) => {
            for tree in &report.trees {
                println!(
                    "{}: {} entries, metadata {}",
                    tree.id,
                    tree.entries,
                    tree.metadata.display()
                );
            }
            println!(
                "pool {}: {} blobs written, {} deduplicated",
                report.layout.pool.display(),
                report.store.blobs_written,
                report.store.blobs_deduplicated
            );
            ExitCode::SUCCESS
        }
        Err(failure) => {
            eprintln!("error: {}", failure);
            ExitCode::FAILURE
        }
    }
}
