use clap::Parser;
use filter::FilterServer;
use miette::{Context, IntoDiagnostic, Result};
use std::{collections::HashSet, sync::Arc};
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod callbacks;
mod clock;
mod config;
mod engine;
mod error;
mod lists;
mod session;
mod spf;
mod whitelist;

use crate::callbacks::Callbacks;
use crate::clock::{Clock, SystemClock};
use crate::config::{Args, Cfg, CfgLog, LogFormat};
use crate::engine::GreylistEngine;
use crate::lists::sweeper::{Sweeper, SWEEP_INTERVAL};
use crate::lists::Lists;
use crate::session::SessionRegistry;

/// Logs go to stderr: stdout carries the filter protocol.
fn init_tracing(cfg: &CfgLog) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&cfg.level)
            .into_diagnostic()
            .wrap_err_with(|| format!("invalid log level '{}'", cfg.level))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    match cfg.format {
        LogFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    }
    .into_diagnostic()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = Cfg::load(&args).wrap_err("error loading configuration")?;
    init_tracing(&cfg.log)?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let timing = cfg.timing();
    let lists = Lists::in_memory();

    if let Some(path) = &cfg.wl_ip {
        whitelist::load_ip_whitelist(path, lists.whitelist_ip.as_ref(), clock.now()).await?;
    }
    let static_domains = match &cfg.wl_domain {
        Some(path) => whitelist::load_domain_whitelist(path).await?,
        None => HashSet::new(),
    };

    let spf = spf::build_resolver(&cfg.hostname, cfg.spf_cache_ttl)
        .wrap_err("error setting up the DNS resolver")?;
    let engine = Arc::new(GreylistEngine::new(lists.clone(), static_domains, spf, timing));

    let shutdown = CancellationToken::new();
    let sweeper = Sweeper::new(lists, timing, clock.clone());
    let sweeper_handle = tokio::spawn(sweeper.run(SWEEP_INTERVAL, shutdown.clone()));

    info!(
        passtime = timing.passtime,
        greyexp = timing.greyexp,
        whiteexp = timing.whiteexp,
        "filter-spfgreylist starting"
    );

    let callbacks = Arc::new(Callbacks::new(engine, SessionRegistry::new(), clock));
    let server = FilterServer::new(callbacks);
    let result = server
        .run(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await;

    shutdown.cancel();
    sweeper_handle.await.into_diagnostic()?;

    match result {
        Ok(()) => {
            info!("input closed, exiting");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "filter protocol violation");
            Err(e).wrap_err("filter stopped")
        }
    }
}
