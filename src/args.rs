use std::path::PathBuf;

use clap::Parser;

use rulegate_core::CliOverrides;

/// Command line arguments for RuleGate
#[derive(Debug, Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = env!("CARGO_PKG_AUTHORS"))]
pub struct Args {
    /// Path to a YAML configuration file; repeatable, loaded in order
    #[arg(long, required = true, help = "Config file path (repeatable; order is load order)")]
    pub config: Vec<PathBuf>,

    /// Listen address override (ex: localhost:8081)
    #[arg(long, help = "Address to listen on (single-proxy configs only)")]
    pub listen: Option<String>,

    /// Upstream target override (ex: http://localhost:8080)
    #[arg(long, help = "Target URL to proxy to (single-proxy configs only)")]
    pub target: Option<String>,

    /// Upstream timeout override in seconds
    #[arg(long, help = "Timeout in seconds for requests to the target")]
    pub timeout: Option<u64>,

    /// TLS certificate override (ex: cert.pem)
    #[arg(long = "ssl-cert", help = "SSL certificate file")]
    pub ssl_cert: Option<PathBuf>,

    /// TLS key override (ex: key.pem)
    #[arg(long = "ssl-key", help = "SSL key file")]
    pub ssl_key: Option<PathBuf>,

    /// Enable debug logging for every listener
    #[arg(long, help = "Print debug logs")]
    pub debug: bool,
}

impl Args {
    /// Converts the listener-scoped flags into loader overrides.
    pub fn overrides(&self) -> CliOverrides {
        CliOverrides {
            listen: self.listen.clone(),
            target: self.target.clone(),
            timeout: self.timeout,
            ssl_cert: self.ssl_cert.clone(),
            ssl_key: self.ssl_key.clone(),
            debug: self.debug,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_flag_is_repeatable() {
        let args = Args::parse_from(["rulegate", "--config", "a.yml", "--config", "b.yml"]);
        assert_eq!(
            args.config,
            vec![PathBuf::from("a.yml"), PathBuf::from("b.yml")]
        );
    }

    #[test]
    fn test_overrides_mapping() {
        let args = Args::parse_from([
            "rulegate",
            "--config",
            "a.yml",
            "--listen",
            "0.0.0.0:9000",
            "--target",
            "http://backend:5000",
            "--timeout",
            "30",
            "--debug",
        ]);
        let overrides = args.overrides();
        assert_eq!(overrides.listen.as_deref(), Some("0.0.0.0:9000"));
        assert_eq!(overrides.target.as_deref(), Some("http://backend:5000"));
        assert_eq!(overrides.timeout, Some(30));
        assert!(overrides.debug);
        assert!(overrides.has_proxy_values());
    }

    #[test]
    fn test_debug_alone_is_not_a_proxy_override() {
        let args = Args::parse_from(["rulegate", "--config", "a.yml", "--debug"]);
        assert!(!args.overrides().has_proxy_values());
    }
}
