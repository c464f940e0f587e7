mod gnss;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use tether_realtime::{Channel, RealtimeConfig, RealtimeEvent, WsConnector};
use tether_store::probe::{self, ProbeError};
use tether_store::{RetryPolicy, StoreClient, StoreConfig, Uploader};
use tether_svc::{
    RedeliveryPolicy, SamplingPolicy, Supervisor, SupervisorConfig, TimerKeepAlive,
};

use crate::gnss::NmeaSource;

#[derive(Debug, Parser)]
#[command(name = "tether", version, about = "Resilient location sampling and delivery")]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the sampling service (plus the realtime channel when enabled).
    Run,
    /// Preflight checks: config sanity and store reachability.
    Doctor,
    /// Print the most recent stored row for the configured child.
    Latest,
    /// Follow realtime inserts and connection-state changes.
    Watch,
}

#[derive(Debug, serde::Deserialize)]
struct Config {
    store: StoreCfg,
    #[serde(default)]
    sampling: SamplingCfg,
    #[serde(default)]
    realtime: RealtimeCfg,
    #[serde(default)]
    service: ServiceCfg,
    gnss: GnssCfg,
}

#[derive(Debug, serde::Deserialize)]
struct StoreCfg {
    url: String,
    api_key: String,
    child_id: String,
}

#[derive(Debug, serde::Deserialize)]
#[serde(default)]
struct SamplingCfg {
    fastest_s: u64,
    target_s: u64,
    max_delay_s: u64,
    resubscribe_delay_s: u64,
}

impl Default for SamplingCfg {
    fn default() -> Self {
        Self { fastest_s: 30, target_s: 45, max_delay_s: 90, resubscribe_delay_s: 5 }
    }
}

#[derive(Debug, serde::Deserialize)]
#[serde(default)]
struct RealtimeCfg {
    enable: bool,
    /// Defaults to the store URL with the realtime gateway path.
    endpoint: Option<String>,
    topic: Option<String>,
    reconnect_delay_s: u64,
    heartbeat_interval_s: u64,
}

impl Default for RealtimeCfg {
    fn default() -> Self {
        Self {
            enable: false,
            endpoint: None,
            topic: None,
            reconnect_delay_s: 5,
            heartbeat_interval_s: 30,
        }
    }
}

#[derive(Debug, serde::Deserialize)]
#[serde(default)]
struct ServiceCfg {
    restart_delay_s: u64,
    wake_window_min: u64,
    redelivery_capacity: usize,
    redelivery_drain_s: u64,
    redelivery_max_redispatch: u32,
}

impl Default for ServiceCfg {
    fn default() -> Self {
        Self {
            restart_delay_s: 2,
            wake_window_min: 10,
            redelivery_capacity: 8,
            redelivery_drain_s: 30,
            redelivery_max_redispatch: 3,
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct GnssCfg {
    source: String,
    nmea_device: Option<String>,
    baud: Option<u32>,
    nmea_file: Option<String>,
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).context("read config")?;
    Ok(toml::from_str(&s).context("parse config toml")?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Run => run(&cfg).await?,
        Command::Doctor => doctor(&cfg).await?,
        Command::Latest => latest(&cfg).await?,
        Command::Watch => watch(&cfg).await?,
    }
    Ok(())
}

fn store_client(cfg: &Config) -> Result<StoreClient> {
    StoreClient::new(&StoreConfig::new(cfg.store.url.clone(), cfg.store.api_key.clone()))
        .context("build store client")
}

fn realtime_config(cfg: &Config) -> RealtimeConfig {
    let endpoint = cfg.realtime.endpoint.clone().unwrap_or_else(|| {
        let base = cfg
            .store
            .url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{}/realtime/v1/websocket", base.trim_end_matches('/'))
    });
    let mut rt = RealtimeConfig::new(endpoint, cfg.store.api_key.clone());
    if let Some(topic) = &cfg.realtime.topic {
        rt.topic = topic.clone();
    }
    rt.reconnect_delay = Duration::from_secs(cfg.realtime.reconnect_delay_s);
    rt
}

fn supervisor_config(cfg: &Config) -> SupervisorConfig {
    let mut sc = SupervisorConfig::new(cfg.store.child_id.clone());
    sc.policy = SamplingPolicy {
        fastest: Duration::from_secs(cfg.sampling.fastest_s),
        target: Duration::from_secs(cfg.sampling.target_s),
        max_delay: Duration::from_secs(cfg.sampling.max_delay_s),
        resubscribe_delay: Duration::from_secs(cfg.sampling.resubscribe_delay_s),
    };
    sc.restart_delay = Duration::from_secs(cfg.service.restart_delay_s);
    sc.wake_window = Duration::from_secs(cfg.service.wake_window_min * 60);
    sc.redelivery = RedeliveryPolicy {
        capacity: cfg.service.redelivery_capacity,
        drain_interval: Duration::from_secs(cfg.service.redelivery_drain_s),
        max_redispatch: cfg.service.redelivery_max_redispatch,
    };
    sc
}

fn build_source(cfg: &Config) -> Result<NmeaSource> {
    match cfg.gnss.source.as_str() {
        "nmea-serial" => Ok(NmeaSource::Serial {
            device: cfg.gnss.nmea_device.clone().context("gnss.nmea_device missing")?,
            baud: cfg.gnss.baud.unwrap_or(115_200),
        }),
        "nmea-file" => Ok(NmeaSource::File {
            path: cfg.gnss.nmea_file.clone().context("gnss.nmea_file missing")?.into(),
        }),
        other => anyhow::bail!("unknown gnss.source: {}", other),
    }
}

// The channel defines the heartbeat protocol; the schedule lives here.
fn spawn_heartbeat(channel: Channel, every: Duration) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        tick.tick().await;
        loop {
            tick.tick().await;
            channel.send_heartbeat().await;
        }
    });
}

async fn run(cfg: &Config) -> Result<()> {
    info!("run: starting");

    let client = store_client(cfg)?;
    let uploader = Arc::new(Uploader::new(client, RetryPolicy::default()));
    let source = Arc::new(build_source(cfg)?);
    let (keepalive, mut restarts) = TimerKeepAlive::new();
    let sup = Supervisor::new(supervisor_config(cfg), source, uploader, keepalive);

    // Deferred-restart triggers re-invoke start.
    {
        let sup = sup.clone();
        tokio::spawn(async move {
            while restarts.recv().await.is_some() {
                sup.restart().await;
            }
        });
    }

    sup.start().await.context("start sampling service")?;

    let channel = if cfg.realtime.enable {
        let rt_cfg = realtime_config(cfg);
        let connector = Arc::new(WsConnector::new(&rt_cfg).context("realtime endpoint")?);
        let (channel, mut events) = Channel::spawn(rt_cfg, connector);
        channel.connect().await;
        spawn_heartbeat(channel.clone(), Duration::from_secs(cfg.realtime.heartbeat_interval_s));
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    RealtimeEvent::State(state) => info!("realtime: {:?}", state),
                    RealtimeEvent::Insert(row) => {
                        info!("realtime: insert {:.5},{:.5}", row.latitude, row.longitude)
                    }
                }
            }
        });
        Some(channel)
    } else {
        None
    };

    tokio::signal::ctrl_c().await.context("wait for shutdown signal")?;
    info!("run: shutting down");
    sup.stop().await;
    if let Some(channel) = channel {
        channel.disconnect().await;
    }
    Ok(())
}

async fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    anyhow::ensure!(
        cfg.store.url.starts_with("https://") || cfg.store.url.starts_with("http://"),
        "store.url must be an http(s) URL"
    );
    anyhow::ensure!(!cfg.store.api_key.is_empty(), "store.api_key missing");
    anyhow::ensure!(!cfg.store.child_id.is_empty(), "store.child_id missing");
    anyhow::ensure!(
        cfg.sampling.fastest_s <= cfg.sampling.target_s
            && cfg.sampling.target_s <= cfg.sampling.max_delay_s,
        "sampling intervals must satisfy fastest <= target <= max_delay"
    );
    build_source(cfg)?;

    let client = store_client(cfg)?;
    match probe::probe(&client).await {
        Ok(()) => info!("doctor: store reachable"),
        Err(e) => {
            let hint = match &e {
                ProbeError::NameResolution => "check the network and the store URL",
                ProbeError::ConnectionRefused | ProbeError::Timeout => "check the network",
                ProbeError::Http(_) => "check the API key and table permissions",
                ProbeError::Other(_) => "see error detail",
            };
            warn!("doctor: store probe failed: {} ({})", e, hint);
            return Err(anyhow::Error::new(e).context("store probe"));
        }
    }

    info!("doctor: OK");
    Ok(())
}

async fn latest(cfg: &Config) -> Result<()> {
    let client = store_client(cfg)?;
    match client.latest(&cfg.store.child_id).await.context("fetch latest row")? {
        Some(row) => println!("{}", serde_json::to_string_pretty(&row)?),
        None => println!("no rows for {}", cfg.store.child_id),
    }
    Ok(())
}

async fn watch(cfg: &Config) -> Result<()> {
    let rt_cfg = realtime_config(cfg);
    let connector = Arc::new(WsConnector::new(&rt_cfg).context("realtime endpoint")?);
    let (channel, mut events) = Channel::spawn(rt_cfg, connector);
    channel.connect().await;
    spawn_heartbeat(channel.clone(), Duration::from_secs(cfg.realtime.heartbeat_interval_s));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                channel.disconnect().await;
                return Ok(());
            }
            event = events.recv() => match event {
                Some(RealtimeEvent::State(state)) => println!("state: {state:?}"),
                Some(RealtimeEvent::Insert(row)) => println!(
                    "insert: {:.6},{:.6} @ {}",
                    row.latitude,
                    row.longitude,
                    row.timestamp
                ),
                None => return Ok(()),
            },
        }
    }
}
