//! wp-cdc [config.toml]
//!
//! SIGHUP 重新读取配置中的 topology（其余配置需重启生效），SIGINT / SIGTERM 优雅退出。

use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use wp_cdc_consolidator::conf::ConfResult;
use wp_cdc_consolidator::{AnyResult, AppConf, Consolidator, Topology};

const DEFAULT_CONF: &str = "wp-cdc.toml";

fn load(path: Option<&Path>) -> ConfResult<AppConf> {
    match path {
        Some(path) => AppConf::load(path),
        // 无配置文件时全部取默认值，topology 来自 DB{n}_* 环境变量
        None => Ok(AppConf::default()),
    }
}

fn load_topology(path: Option<&Path>) -> ConfResult<Topology> {
    load(path)?.topology()
}

async fn watch_signals(
    path: Option<PathBuf>,
    topology_tx: watch::Sender<Topology>,
    cancel: CancellationToken,
) -> AnyResult<()> {
    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = terminate.recv() => break,
            _ = hangup.recv() => match load_topology(path.as_deref()) {
                Ok(topology) => {
                    log::info!("SIGHUP: topology reloaded");
                    topology_tx.send_replace(topology);
                }
                Err(e) => log::error!("SIGHUP: reload fail, keep current topology: {}", e),
            },
        }
    }
    log::info!("shutdown requested");
    cancel.cancel();
    Ok(())
}

#[tokio::main]
async fn main() -> AnyResult<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| Path::new(DEFAULT_CONF).exists().then(|| PathBuf::from(DEFAULT_CONF)));
    let conf = load(path.as_deref())
        .with_context(|| format!("load config {:?}", path))?;
    let topology = conf.topology().context("build topology")?;
    if topology.is_empty() {
        log::warn!("topology is empty: no [[sources]] configured and no DB1_HOSTNAME set");
    }

    let (topology_tx, topology_rx) = watch::channel(topology);
    let cancel = CancellationToken::new();
    let service = Consolidator::from_conf(conf).await?;
    let signals = tokio::spawn(watch_signals(path, topology_tx, cancel.clone()));

    let report = service.run(topology_rx, cancel).await;
    signals.abort();
    let report = report?;
    if !report.is_complete() {
        anyhow::bail!("partial shutdown, aborted consumers: {:?}", report.aborted);
    }
    Ok(())
}
