mod config;
mod credentials;
mod error;
mod pipeline;
mod routes;
mod store;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use conduit_core::balancer::LoadBalancer;
use conduit_core::dedup::{DedupStore, MemoryDedupStore, RedisDedupStore};
use conduit_core::session::{MemorySessionStore, RedisSessionStore, SessionStore};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{Args, Config};
use crate::credentials::AccountCredentialManager;
use crate::pipeline::{AppState, UpstreamBinding};
use crate::store::{FileStore, UpstreamTransport};

const DEFAULT_PROVIDERS_PATH: &str = "providers.json";

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("conduit_service=info,tower_http=info"));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let args = Args::parse();
    let config: Config = args.into();
    let providers_path = config.providers.clone().unwrap_or_else(|| DEFAULT_PROVIDERS_PATH.into());

    info!(
        addr = %config.addr,
        providers = %providers_path.display(),
        gateway_key = %config.gateway_key.as_ref().map(|_| "enabled").unwrap_or("disabled"),
        "starting conduit gateway"
    );

    let file_store = Arc::new(FileStore::load(providers_path)?);
    let upstream_specs = file_store.upstreams().to_vec();
    let store: Arc<dyn conduit_core::model::Store> = file_store;

    let rate_limit_cooldown = config.rate_limit_cooldown.to_std().unwrap_or(Duration::from_secs(60));
    let balancer = Arc::new(LoadBalancer::new(Arc::clone(&store), rate_limit_cooldown));

    let (dedup, _dedup_cleaner) = build_dedup_store(&config).await?;
    let (session, _session_cleaner) = build_session_store(&config).await?;
    let credentials = Arc::new(AccountCredentialManager::new(Arc::clone(&store)));

    let http = reqwest::Client::builder().build().expect("reqwest client builder never fails with defaults");
    let mut upstreams: HashMap<String, UpstreamBinding> = HashMap::new();
    for spec in upstream_specs {
        let binding = match spec.transport {
            UpstreamTransport::Sse => UpstreamBinding::Sse {
                http: http.clone(),
                base_url: url::Url::parse(&spec.url)?,
            },
            UpstreamTransport::Ws => UpstreamBinding::Ws {
                pool: Arc::new(conduit_upstream::pool::WebSocketPool::new(config.ws_pool_capacity, config.ws_pool_saturation)),
                url: url::Url::parse(&spec.url)?,
            },
        };
        upstreams.insert(spec.channel, binding);
    }

    let addr = config.addr.clone();
    let state = Arc::new(AppState {
        config,
        balancer,
        dedup,
        session,
        credentials,
        upstreams,
    });

    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Dedup store plus an optional cleaner that evicts its expired entries; the
/// caller must keep the cleaner alive for the process lifetime. Redis-backed
/// stores have no cleaner since expiry is enforced by the key TTL itself.
async fn build_dedup_store(config: &Config) -> Result<(Arc<dyn DedupStore>, Option<conduit_core::cleaner::AsyncCleaner>)> {
    if let Some(url) = &config.redis_url {
        let conn = redis::Client::open(url.as_str())?.get_connection_manager().await?;
        let store = Arc::new(RedisDedupStore::new(conn, config.dedup_window));
        return Ok((store as Arc<dyn DedupStore>, None));
    }
    let store = MemoryDedupStore::new(config.dedup_window);
    let cleaner = store.spawn_cleaner(config.dedup_window.max(Duration::from_secs(1)));
    Ok((store as Arc<dyn DedupStore>, Some(cleaner)))
}

async fn build_session_store(config: &Config) -> Result<(Arc<dyn SessionStore>, Option<conduit_core::cleaner::AsyncCleaner>)> {
    if let Some(url) = &config.redis_url {
        let conn = redis::Client::open(url.as_str())?.get_connection_manager().await?;
        let store = Arc::new(RedisSessionStore::new(conn, config.session_ttl));
        return Ok((store as Arc<dyn SessionStore>, None));
    }
    let store = MemorySessionStore::new(config.session_ttl);
    let cleaner = store.spawn_cleaner(config.session_ttl.max(Duration::from_secs(1)));
    Ok((store as Arc<dyn SessionStore>, Some(cleaner)))
}
