//! Binary entry point for the `arbor` tree maintenance CLI.
#![forbid(unsafe_code)]

#[path = "arbor/config.rs"]
mod config;

use std::path::PathBuf;
use std::sync::Arc;

use arbor::{
    primitives::pager::{
        AccessMode, CommitMode, IoMode, PageCache, Pager, PagerOptions, TxnMode,
    },
    storage::btree::{
        collect_entries, spec_value, verify_tree, DeleteDriver, DeleteResult, Node, TreeBuilder,
    },
    types::{ArborError, Geometry},
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use thiserror::Error;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use config::{CliConfig, ConfigError};

#[derive(Parser, Debug)]
#[command(
    name = "arbor",
    version,
    about = "Build, inspect, and delete from arbor B-tree files",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "ARBOR_CONFIG",
        value_name = "FILE",
        help = "CLI config file (defaults to <config dir>/arbor/cli.toml)"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        env = "ARBOR_DB",
        value_name = "FILE",
        help = "Tree file (defaults to [database].default from the config)"
    )]
    db: Option<PathBuf>,

    #[command(flatten)]
    open: OpenArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct OpenArgs {
    #[arg(long, global = true, help = "Override pager cache size (pages)")]
    cache_pages: Option<usize>,

    #[arg(long, global = true, value_enum, help = "How cache misses resolve")]
    io_mode: Option<ModeArg>,

    #[arg(long, global = true, value_enum, help = "How commits complete")]
    commit_mode: Option<ModeArg>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum ModeArg {
    Immediate,
    Deferred,
}

impl From<ModeArg> for IoMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Immediate => IoMode::Immediate,
            ModeArg::Deferred => IoMode::Deferred,
        }
    }
}

impl From<ModeArg> for CommitMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Immediate => CommitMode::Immediate,
            ModeArg::Deferred => CommitMode::Deferred,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an empty tree file
    Init(InitCmd),
    /// Replace the tree with a bulk-loaded one
    Load(LoadCmd),
    /// Delete keys
    Delete(DeleteCmd),
    /// Check structural invariants
    Verify,
    /// Print the tree node by node
    Dump {
        #[arg(long, help = "Print entries instead of nodes")]
        entries: bool,
    },
}

#[derive(Args, Debug)]
struct InitCmd {
    #[arg(long, help = "Page size in bytes")]
    page_size: Option<u32>,

    #[arg(long, help = "Minimum entries per non-root node")]
    min_entries: Option<u16>,

    #[arg(long, help = "Maximum entries per node")]
    max_entries: Option<u16>,

    #[arg(long, help = "Largest value stored in a leaf entry")]
    max_value_len: Option<u16>,

    #[arg(long, help = "Overwrite an existing file")]
    force: bool,
}

#[derive(Args, Debug)]
struct LoadCmd {
    #[arg(long, value_delimiter = ',', help = "Explicit keys to load")]
    keys: Vec<u64>,

    #[arg(long, help = "Number of generated keys when --keys is absent")]
    count: Option<u64>,

    #[arg(long, default_value_t = 0, help = "First generated key")]
    start: u64,

    #[arg(long, default_value_t = 1, help = "Distance between generated keys")]
    step: u64,

    #[arg(long, help = "Target entries per node")]
    fill: Option<u16>,

    #[arg(long, help = "Reshape: minimum entries per non-root node")]
    min_entries: Option<u16>,

    #[arg(long, help = "Reshape: maximum entries per node")]
    max_entries: Option<u16>,

    #[arg(long, help = "Reshape: largest value stored in a leaf entry")]
    max_value_len: Option<u16>,
}

impl LoadCmd {
    /// Geometry to publish with the reload, if any bound was overridden.
    fn reshape(&self, current: Geometry) -> Option<Geometry> {
        if self.min_entries.is_none() && self.max_entries.is_none() && self.max_value_len.is_none()
        {
            return None;
        }
        Some(Geometry::new(
            self.min_entries.unwrap_or(current.min_entries),
            self.max_entries.unwrap_or(current.max_entries),
            self.max_value_len.unwrap_or(current.max_value_len),
        ))
    }
}

#[derive(Args, Debug)]
struct DeleteCmd {
    #[arg(value_name = "KEY", required = true, num_args = 1..)]
    keys: Vec<u64>,

    #[arg(long, help = "Yield after this many steps per resume")]
    step_budget: Option<usize>,

    #[arg(long, help = "Print delete counters when finished")]
    stats: bool,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Arbor(#[from] ArborError),
    #[error("no database given; pass --db or set [database].default in the config")]
    NoDatabase,
    #[error("{path} already exists; pass --force to overwrite")]
    Exists { path: PathBuf },
    #[error("nothing to load; pass --keys or --count")]
    NothingToLoad,
    #[error("tree has {issues} structural issue(s)")]
    VerifyFailed { issues: usize },
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        let code = match err {
            CliError::VerifyFailed { .. } => 2,
            _ => 1,
        };
        std::process::exit(code);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("ARBOR_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let config = CliConfig::load(cli.config.clone())?;
    debug!(target: "arbor_cli", config = ?config.path(), "cli.config");
    let opts = build_pager_options(&config, &cli.open);

    match cli.command {
        Command::Init(cmd) => {
            let path = db_path(cli.db.as_ref(), &config)?;
            if path.exists() && !cmd.force {
                return Err(CliError::Exists { path });
            }
            let defaults = opts.geometry;
            let geometry = Geometry::new(
                cmd.min_entries.unwrap_or(defaults.min_entries),
                cmd.max_entries.unwrap_or(defaults.max_entries),
                cmd.max_value_len.unwrap_or(defaults.max_value_len),
            );
            let mut opts = opts.geometry(geometry);
            if let Some(page_size) = cmd.page_size {
                opts = opts.page_size(page_size);
            }
            let pager = Pager::create(&path, opts)?;
            let sb = pager.superblock()?;
            println!(
                "created {} (page_size={} min_entries={} max_entries={} max_value_len={})",
                path.display(),
                sb.page_size,
                sb.geometry.min_entries,
                sb.geometry.max_entries,
                sb.geometry.max_value_len
            );
        }
        Command::Load(cmd) => {
            let path = db_path(cli.db.as_ref(), &config)?;
            let mut keys = if !cmd.keys.is_empty() {
                cmd.keys.clone()
            } else if let Some(count) = cmd.count {
                (0..count)
                    .map(|i| cmd.start.saturating_add(i.saturating_mul(cmd.step)))
                    .collect()
            } else {
                return Err(CliError::NothingToLoad);
            };
            keys.sort_unstable();
            keys.dedup();
            let pager = Pager::open(&path, opts)?;
            let mut builder = TreeBuilder::new();
            if let Some(fill) = cmd.fill {
                builder = builder.fill(fill);
            }
            if let Some(geometry) = cmd.reshape(pager.superblock()?.geometry) {
                debug!(target: "arbor_cli", ?geometry, "cli.load.reshape");
                builder = builder.geometry(geometry);
            }
            let root = builder.bulk_load(&pager, keys.iter().map(|k| (*k, spec_value(*k))))?;
            println!("loaded {} keys (root page {})", keys.len(), root);
        }
        Command::Delete(cmd) => {
            let path = db_path(cli.db.as_ref(), &config)?;
            let pager = Arc::new(Pager::open(&path, opts)?);
            let cache: Arc<dyn PageCache> = pager.clone();
            let mut driver = DeleteDriver::new(cache);
            if let Some(steps) = cmd.step_budget {
                driver = driver.with_step_budget(steps);
            }
            for key in &cmd.keys {
                driver.submit(*key);
            }
            driver.run_until_idle()?;
            let mut failure = None;
            for finished in driver.take_finished() {
                match finished.outcome {
                    Ok(DeleteResult::Found) => println!("{}: found", finished.key),
                    Ok(DeleteResult::NotFound) => println!("{}: not found", finished.key),
                    Err(err) => {
                        println!("{}: failed ({err})", finished.key);
                        failure.get_or_insert(err);
                    }
                }
            }
            if cmd.stats {
                let stats = driver.stats().snapshot();
                println!(
                    "operations={} found={} not_found={} failed={} suspensions={} nodes_visited={}",
                    stats.operations,
                    stats.found,
                    stats.not_found,
                    stats.failed,
                    stats.suspensions,
                    stats.nodes_visited
                );
                println!(
                    "collapses={} leaf_merges={} internal_merges={} leaf_levels={} internal_levels={}",
                    stats.collapses,
                    stats.leaf_merges,
                    stats.internal_merges,
                    stats.leaf_levels,
                    stats.internal_levels
                );
                driver.stats().emit_tracing();
            }
            if let Some(err) = failure {
                return Err(err.into());
            }
        }
        Command::Verify => {
            let path = db_path(cli.db.as_ref(), &config)?;
            let pager = Pager::open(&path, opts)?;
            let report = verify_tree(&pager)?;
            println!("{report}");
            for issue in &report.issues {
                println!("issue: {issue}");
            }
            if !report.is_ok() {
                return Err(CliError::VerifyFailed {
                    issues: report.issues.len(),
                });
            }
        }
        Command::Dump { entries } => {
            let path = db_path(cli.db.as_ref(), &config)?;
            let pager = Pager::open(&path, opts)?;
            if entries {
                for (key, value) in collect_entries(&pager)? {
                    println!("{key}\t{}", String::from_utf8_lossy(&value));
                }
            } else {
                dump_tree(&pager)?;
            }
        }
    }

    Ok(())
}

fn db_path(given: Option<&PathBuf>, config: &CliConfig) -> Result<PathBuf, CliError> {
    given
        .or(config.default_db_path())
        .cloned()
        .ok_or(CliError::NoDatabase)
}

fn build_pager_options(config: &CliConfig, args: &OpenArgs) -> PagerOptions {
    let mut opts = config.pager_options();
    if let Some(cache_pages) = args.cache_pages {
        opts = opts.cache_pages(cache_pages);
    }
    if let Some(mode) = args.io_mode {
        opts = opts.io_mode(mode.into());
    }
    if let Some(mode) = args.commit_mode {
        opts = opts.commit_mode(mode.into());
    }
    opts
}

fn dump_tree(pager: &Pager) -> Result<(), CliError> {
    let sb = pager.superblock()?;
    println!(
        "root={} free_pages={} next_page={}",
        sb.root, sb.free_pages, sb.next_page
    );
    if sb.root.is_null() {
        return Ok(());
    }
    let mut txn = pager.begin_blocking(TxnMode::Read)?;
    let mut stack = vec![(sb.root, 0usize)];
    while let Some((page, depth)) = stack.pop() {
        let buffer = txn.acquire_blocking(page, AccessMode::Read)?;
        let decoded = Node::decode(page, &buffer.data());
        buffer.release();
        let indent = "  ".repeat(depth);
        match decoded? {
            Node::Leaf(leaf) => {
                let keys: Vec<u64> = leaf.entries.iter().map(|(k, _)| *k).collect();
                println!("{indent}leaf {page} keys={keys:?}");
            }
            Node::Internal(internal) => {
                println!("{indent}internal {page} keys={:?}", internal.keys);
                for child in internal.children.iter().rev() {
                    stack.push((*child, depth + 1));
                }
            }
        }
    }
    txn.commit_blocking()?;
    Ok(())
}

