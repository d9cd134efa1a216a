//! CLI configuration (§4.13, C13): parsed once at process start and handed
//! by reference to the master and to each worker at spawn time. No
//! configuration reload, per the spec's explicit Non-goals.

use std::net::SocketAddr;

use clap::Parser;

/// Default listen backlog, matching the original source's `MAX_FD_COUNT`.
pub const MAX_FD_COUNT: i32 = 1024;

/// Capacity handed to `mio::Events::with_capacity` for every reactor.
pub const EVENTS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Parser)]
#[command(name = "reactord", about = "Multi-threaded event-driven TCP reactor")]
pub struct Config {
    /// Address to bind the listening socket to.
    #[arg(long, default_value = "0.0.0.0:888")]
    pub bind: SocketAddr,

    /// Listen backlog passed to `listen(2)`.
    #[arg(long, default_value_t = MAX_FD_COUNT)]
    pub backlog: i32,

    /// Number of worker reactors. `0` runs the master single-threaded: it
    /// registers accepted connections on itself and uses the exit-when-idle
    /// loop variant instead of waiting on a shutdown signal (§4.10, §6).
    #[arg(long, default_value_t = default_worker_count())]
    pub workers: usize,

    /// Capacity of the `mio::Events` buffer used by each reactor's `wait`.
    #[arg(long, default_value_t = EVENTS_CAPACITY)]
    pub events_capacity: usize,
}

/// `(num_cpus - 1) * 2`, matching the original source's
/// `(ngx_ncpu - 1) * 2` default worker count, floored at zero.
fn default_worker_count() -> usize {
    num_cpus::get().saturating_sub(1) * 2
}

impl Config {
    pub fn parse_args() -> Config {
        Config::parse()
    }
}
