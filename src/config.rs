use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;

/// 8080 CP/M emulation server
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Address to listen on
    #[arg(long, env = "CPM_BIND", default_value = "127.0.0.1")]
    pub bind: IpAddr,

    /// HTTP port
    #[arg(short, long, env = "CPM_PORT", default_value = "5000")]
    pub port: u16,

    /// Idle time after which a session is dropped
    #[arg(long, env = "CPM_SESSION_TIMEOUT_SECS", default_value = "1800")]
    pub session_timeout_secs: u64,

    /// How often the expiry sweep runs
    #[arg(long, env = "CPM_SWEEP_INTERVAL_SECS", default_value = "300")]
    pub sweep_interval_secs: u64,

    /// Default cycle budget for one run request
    #[arg(long, env = "CPM_MAX_CYCLES", default_value = "100000")]
    pub max_cycles: u64,

    /// Largest cycle budget a request may ask for
    #[arg(long, env = "CPM_MAX_CYCLES_CEILING", default_value = "10000000")]
    pub max_cycles_ceiling: u64,

    /// Drives per session (1-16)
    #[arg(short, long, env = "CPM_DRIVES", default_value = "2",
          value_parser = clap::value_parser!(u8).range(1..=16))]
    pub drives: u8,

    /// Host directory for session drives; in-memory drives when absent
    #[arg(long, env = "CPM_DISK_ROOT")]
    pub disk_root: Option<PathBuf>,
}

impl Config {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn session_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_timeout_secs.min(i64::MAX as u64) as i64)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: IpAddr::from([127, 0, 0, 1]),
            port: 5000,
            session_timeout_secs: 1800,
            sweep_interval_secs: 300,
            max_cycles: 100_000,
            max_cycles_ceiling: 10_000_000,
            drives: 2,
            disk_root: None,
        }
    }
}
