//! cache-chain CLI demo
//!
//! Builds a three-layer chain — `Cache(top) -> Cache(middle) -> BackingStore`
//! — runs a scripted sequence of stores and lookups through it, and prints
//! each layer's debug dump so the write-back and promotion/demotion
//! behavior is observable end to end.

use std::cell::RefCell;
use std::rc::Rc;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cache_chain::chain::{BackingStoreBuilder, CacheLayerBuilder, Lower, StoreScope};
use cache_chain::{Error, Result};

/// Drive a small write-back cache chain and print its state as it evolves.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Capacity of the top cache layer.
    #[arg(long, env = "TOP_CAPACITY", default_value_t = 2)]
    top_capacity: usize,

    /// Capacity of the middle cache layer.
    #[arg(long, env = "MID_CAPACITY", default_value_t = 2)]
    mid_capacity: usize,

    /// Capacity of the backing store.
    #[arg(long, env = "STORE_CAPACITY", default_value_t = 4)]
    store_capacity: usize,

    /// On-disk database name (a ".db" suffix is appended by sled).
    #[arg(long, env = "DB_NAME", default_value = "cache_chain_demo")]
    dbname: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!("cache-chain {}", cache_chain::VERSION);

    let store = BackingStoreBuilder::new()
        .capacity(args.store_capacity)
        .dbname(args.dbname.clone())
        .build::<i64>()?;
    let scope = StoreScope::enter(Some(Rc::clone(&store)))?;

    let middle: Rc<RefCell<cache_chain::CacheLayer<i64>>> = CacheLayerBuilder::new()
        .capacity(args.mid_capacity)
        .lower(Lower::Store(scope.store()))
        .build()?;
    let top = CacheLayerBuilder::new()
        .capacity(args.top_capacity)
        .lower(Lower::Cache(Rc::clone(&middle)))
        .build()?;

    for (key, value) in [("a", 1), ("b", 2), ("c", 3), ("d", 4), ("e", 5), ("f", 6)] {
        top.borrow_mut().store(key, value)?;
        info!(key, value, "stored");
    }

    info!(top = ?top.borrow(), "top layer");
    info!(middle = ?middle.borrow(), "middle layer");
    info!(store = ?scope.store().borrow(), "backing store");

    match top.borrow_mut().lookup("a") {
        Ok(v) => info!(value = v, "looked up 'a'"),
        Err(Error::CacheMiss { key }) => info!(key, "cache miss"),
        Err(e) => return Err(e),
    }

    info!(top = ?top.borrow(), "top layer after lookup");
    Ok(())
}

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}
