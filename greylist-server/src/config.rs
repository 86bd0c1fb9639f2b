use camino::Utf8PathBuf;
use clap::Parser;
use config::{Config, File};
use miette::{IntoDiagnostic, Result};
use serde::Deserialize;

use crate::error::GreylistError;

pub const DEFAULT_PASSTIME: i64 = 300;
pub const DEFAULT_GREYEXP: i64 = 4 * 3600;
pub const DEFAULT_WHITEEXP: i64 = 30 * 86400;
pub const DEFAULT_SPF_CACHE_TTL: i64 = 60;

/// Command line flags. Every flag overrides the matching key of the
/// configuration file.
#[derive(Debug, Parser)]
#[command(
    name = "filter-spfgreylist",
    version,
    about = "SPF-aware greylisting filter for OpenSMTPD"
)]
pub struct Args {
    /// Optional TOML configuration file.
    #[arg(long)]
    pub config: Option<String>,

    /// Number of seconds before retries are accounted.
    #[arg(long)]
    pub passtime: Option<i64>,

    /// Number of seconds before greylist attempts expire.
    #[arg(long)]
    pub greyexp: Option<i64>,

    /// Number of seconds before whitelist entries expire.
    #[arg(long)]
    pub whiteexp: Option<i64>,

    /// File containing IP addresses to whitelist, one per line.
    #[arg(long = "wl-ip")]
    pub wl_ip: Option<String>,

    /// File containing sender domains to whitelist, one per line.
    #[arg(long = "wl-domain")]
    pub wl_domain: Option<String>,

    /// Receiving host name used for SPF macro expansion.
    #[arg(long)]
    pub hostname: Option<String>,

    /// Seconds SPF results are cached for, 0 disables the cache.
    #[arg(long = "spf-cache-ttl")]
    pub spf_cache_ttl: Option<i64>,

    #[arg(long = "log-level")]
    pub log_level: Option<String>,

    /// text or json.
    #[arg(long = "log-format")]
    pub log_format: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Cfg {
    pub passtime: i64,
    pub greyexp: i64,
    pub whiteexp: i64,
    pub wl_ip: Option<Utf8PathBuf>,
    pub wl_domain: Option<Utf8PathBuf>,
    pub hostname: String,
    pub spf_cache_ttl: i64,
    pub log: CfgLog,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CfgLog {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Greylisting delays, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub passtime: i64,
    pub greyexp: i64,
    pub whiteexp: i64,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            passtime: DEFAULT_PASSTIME,
            greyexp: DEFAULT_GREYEXP,
            whiteexp: DEFAULT_WHITEEXP,
        }
    }
}

impl Cfg {
    /// Merges built-in defaults, the optional configuration file and the
    /// command line, in that order.
    pub fn load(args: &Args) -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("passtime", DEFAULT_PASSTIME)
            .into_diagnostic()?
            .set_default("greyexp", DEFAULT_GREYEXP)
            .into_diagnostic()?
            .set_default("whiteexp", DEFAULT_WHITEEXP)
            .into_diagnostic()?
            .set_default("hostname", "localhost")
            .into_diagnostic()?
            .set_default("spf_cache_ttl", DEFAULT_SPF_CACHE_TTL)
            .into_diagnostic()?
            .set_default("log.level", "info")
            .into_diagnostic()?
            .set_default("log.format", "text")
            .into_diagnostic()?;

        if let Some(path) = &args.config {
            builder = builder.add_source(File::with_name(path));
        }

        let settings = builder
            .set_override_option("passtime", args.passtime)
            .into_diagnostic()?
            .set_override_option("greyexp", args.greyexp)
            .into_diagnostic()?
            .set_override_option("whiteexp", args.whiteexp)
            .into_diagnostic()?
            .set_override_option("wl_ip", args.wl_ip.clone())
            .into_diagnostic()?
            .set_override_option("wl_domain", args.wl_domain.clone())
            .into_diagnostic()?
            .set_override_option("hostname", args.hostname.clone())
            .into_diagnostic()?
            .set_override_option("spf_cache_ttl", args.spf_cache_ttl)
            .into_diagnostic()?
            .set_override_option("log.level", args.log_level.clone())
            .into_diagnostic()?
            .set_override_option("log.format", args.log_format.clone())
            .into_diagnostic()?
            .build()
            .into_diagnostic()?;

        let cfg: Cfg = settings.try_deserialize().into_diagnostic()?;
        cfg.validate()?;

        Ok(cfg)
    }

    pub fn timing(&self) -> Timing {
        Timing {
            passtime: self.passtime,
            greyexp: self.greyexp,
            whiteexp: self.whiteexp,
        }
    }

    fn validate(&self) -> Result<(), GreylistError> {
        if self.passtime < 0 {
            return Err(GreylistError::Config("passtime must not be negative".to_string()));
        }
        if self.greyexp <= self.passtime {
            return Err(GreylistError::Config(format!(
                "greyexp ({}) must be greater than passtime ({})",
                self.greyexp, self.passtime
            )));
        }
        if self.whiteexp <= 0 {
            return Err(GreylistError::Config("whiteexp must be positive".to_string()));
        }
        if self.spf_cache_ttl < 0 {
            return Err(GreylistError::Config(
                "spf_cache_ttl must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}
