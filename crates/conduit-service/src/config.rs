//! CLI flags and the derived runtime configuration built from them, in the
//! shape of the teacher's `Args`/`ServerState` split.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use conduit_upstream::pool::SaturationPolicy;

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Args {
    /// Address to bind the service to.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub addr: String,

    /// Redis connection URL. When set, dedup/session state uses the
    /// Redis-backed stores instead of the in-memory ones.
    #[arg(long, env = "CONDUIT_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Dedup single-flight window, in milliseconds.
    #[arg(long, default_value_t = 2000)]
    pub dedup_window_ms: u64,

    /// Session TTL, in seconds.
    #[arg(long, default_value_t = 3600)]
    pub session_ttl_secs: u64,

    /// Per-channel WebSocket pool capacity.
    #[arg(long, default_value_t = 4)]
    pub ws_pool_capacity: usize,

    /// `block` or `failover-direct`.
    #[arg(long, default_value = "failover-direct")]
    pub ws_pool_saturation: String,

    /// 429 cool-down duration, in seconds.
    #[arg(long, default_value_t = 60)]
    pub rate_limit_cooldown_secs: i64,

    /// Per-request default timeout, in seconds.
    #[arg(long, default_value_t = 180)]
    pub request_timeout_secs: u64,

    /// Max account-switch retries per request.
    #[arg(long, default_value_t = 2)]
    pub retry_budget: u32,

    /// SSE keep-alive idle interval, in seconds.
    #[arg(long, default_value_t = 15)]
    pub keepalive_interval_secs: u64,

    /// Optional path to a channel/account-pool/alias-table config file.
    #[arg(long)]
    pub providers: Option<PathBuf>,

    /// Optional bearer token required on every request.
    #[arg(long, env = "CONDUIT_GATEWAY_KEY")]
    pub gateway_key: Option<String>,
}

/// Runtime configuration derived from [`Args`], held in `AppState`.
#[derive(Clone)]
pub struct Config {
    pub addr: String,
    pub redis_url: Option<String>,
    pub dedup_window: Duration,
    pub session_ttl: Duration,
    pub ws_pool_capacity: usize,
    pub ws_pool_saturation: SaturationPolicy,
    pub rate_limit_cooldown: chrono::Duration,
    pub request_timeout: Duration,
    pub retry_budget: u32,
    pub keepalive_interval: Duration,
    pub providers: Option<PathBuf>,
    pub gateway_key: Option<String>,
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        let ws_pool_saturation = match args.ws_pool_saturation.as_str() {
            "block" => SaturationPolicy::Block,
            _ => SaturationPolicy::FailoverDirect,
        };
        Self {
            addr: args.addr,
            redis_url: args.redis_url,
            dedup_window: Duration::from_millis(args.dedup_window_ms),
            session_ttl: Duration::from_secs(args.session_ttl_secs),
            ws_pool_capacity: args.ws_pool_capacity,
            ws_pool_saturation,
            rate_limit_cooldown: chrono::Duration::seconds(args.rate_limit_cooldown_secs),
            request_timeout: Duration::from_secs(args.request_timeout_secs),
            retry_budget: args.retry_budget,
            keepalive_interval: Duration::from_secs(args.keepalive_interval_secs),
            providers: args.providers,
            gateway_key: args.gateway_key,
        }
    }
}
