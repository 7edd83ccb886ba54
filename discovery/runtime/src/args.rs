use crate::{
    auth::{Settings, TokenCache},
    container::{Container, DataSourceConfig, Metrics},
    k8s::{watcher, MigCluster},
    store::Db,
    Discovery, Driver,
};
use anyhow::{bail, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "discovery", about = "Mirrors migration cluster resources")]
pub struct Args {
    #[clap(long, default_value = "mig_discovery=info,warn", env = "MIG_DISCOVERY_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// SQLite database file. `:memory:` keeps the mirror in memory.
    #[clap(long, default_value = ":memory:")]
    db_path: String,

    /// A cluster without a heartbeat for this long is not ready.
    #[clap(long, default_value = "60")]
    heartbeat_threshold_secs: u64,

    #[clap(long, default_value = "10")]
    token_ttl_secs: u64,

    #[clap(long, default_value = "1000")]
    token_cache_capacity: usize,

    /// Delay before retrying a cluster that failed to start.
    #[clap(long, default_value = "10")]
    cluster_retry_secs: u64,

    /// Allows requests that carry no bearer token.
    #[clap(long)]
    auth_optional: bool,

    /// Users allowed everything.
    #[clap(long, value_delimiter = ',', default_value = "kube:admin")]
    allowed_users: Vec<String>,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            db_path,
            heartbeat_threshold_secs,
            token_ttl_secs,
            token_cache_capacity,
            cluster_retry_secs,
            auth_optional,
            allowed_users,
        } = self;

        let mut prom = <Registry>::default();
        let metrics = Metrics::register(prom.sub_registry_with_prefix("discovery"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let db = Db::open(&db_path)?;
        info!(path = %db_path, "Database opened");

        let host = runtime.client();
        let config = DataSourceConfig {
            heartbeat_threshold: Duration::from_secs(heartbeat_threshold_secs),
            ..DataSourceConfig::default()
        };
        let container = Arc::new(Container::new(host.clone(), db.clone(), config, metrics));
        let discovery = Discovery::new(
            container.clone(),
            db,
            TokenCache::new(Duration::from_secs(token_ttl_secs), token_cache_capacity),
            Settings {
                auth_optional,
                allowed_users,
            },
        );
        info!(?discovery, "Discovery initialized");

        let clusters = runtime.watch_all::<MigCluster>(watcher::Config::default());
        tokio::spawn(
            Driver::new(container, host)
                .with_retry_delay(Duration::from_secs(cluster_retry_secs))
                .run(clusters)
                .instrument(info_span!("migclusters")),
        );

        // Block the main thread on the shutdown signal.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
