//! Startup configuration.
//!
//! Flags are parsed with clap; each also reads from an environment variable
//! so the controller can be configured from a Deployment manifest. Missing
//! required names print usage and exit non-zero before any cluster
//! connection is attempted.

use crate::error::ControllerError;
use crate::retry::RetryPolicy;
use clap::builder::NonEmptyStringValueParser;
use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default wait between a secret change and the restart.
pub const DEFAULT_DELAY: &str = "2m";

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(
    name = "secret-rollout-controller",
    version,
    about = "Restart a Deployment when a Secret changes"
)]
pub struct Args {
    /// Name of the secret to watch
    #[arg(long, env = "SECRET_NAME", value_parser = NonEmptyStringValueParser::new())]
    pub secret_name: String,

    /// Name of the deployment to restart
    #[arg(long, env = "DEPLOYMENT_NAME", value_parser = NonEmptyStringValueParser::new())]
    pub deployment_name: String,

    /// Namespace of the secret and deployment
    #[arg(
        long,
        env = "WATCH_NAMESPACE",
        default_value = "default",
        value_parser = NonEmptyStringValueParser::new()
    )]
    pub namespace: String,

    /// Use the pod's service account instead of a kubeconfig
    #[arg(long, env = "INSIDE_CLUSTER")]
    pub inside_cluster: bool,

    /// Kubeconfig file to use outside the cluster (defaults to kube's own resolution)
    #[arg(long, conflicts_with = "inside_cluster")]
    pub kubeconfig: Option<PathBuf>,

    /// Delay before restarting the deployment, e.g. 90s, 2m, 1h
    #[arg(
        long,
        env = "RESTART_DELAY",
        default_value = DEFAULT_DELAY,
        value_parser = parse_duration
    )]
    pub delay: Duration,

    /// Bind address for the /metrics endpoint
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    pub metrics_addr: SocketAddr,

    /// Version conflicts tolerated per restart before giving up
    #[arg(long, env = "MAX_CONFLICT_RETRIES", default_value_t = 10)]
    pub max_conflict_retries: u32,

    /// How long to wait for the initial secret cache sync
    #[arg(long, env = "SYNC_TIMEOUT", default_value = "60s", value_parser = parse_duration)]
    pub sync_timeout: Duration,
}

/// Parse a duration such as `2m`, `90s`, `250ms`, `1h` or raw seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let invalid = || format!("invalid duration '{}', expected e.g. 90s, 2m, 1h", s);
    let number = |n: &str| n.trim().parse::<u64>().map_err(|_| invalid());
    let scaled = |n: &str, factor: u64| number(n)?.checked_mul(factor).ok_or_else(invalid);

    if let Some(ms) = s.strip_suffix("ms") {
        Ok(Duration::from_millis(number(ms)?))
    } else if let Some(hours) = s.strip_suffix('h') {
        Ok(Duration::from_secs(scaled(hours, 3600)?))
    } else if let Some(minutes) = s.strip_suffix('m') {
        Ok(Duration::from_secs(scaled(minutes, 60)?))
    } else if let Some(secs) = s.strip_suffix('s') {
        Ok(Duration::from_secs(number(secs)?))
    } else {
        Ok(Duration::from_secs(number(s)?))
    }
}

/// The secret being observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget {
    pub namespace: String,
    pub secret_name: String,
}

impl fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.secret_name)
    }
}

/// The deployment to restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationTarget {
    pub namespace: String,
    pub deployment_name: String,
}

impl fmt::Display for MutationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.deployment_name)
    }
}

/// How cluster credentials are resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialMode {
    /// Service account token and CA mounted into the pod
    InCluster,
    /// Kubeconfig file; `None` lets kube resolve `KUBECONFIG` / `~/.kube/config`
    Kubeconfig(Option<PathBuf>),
}

impl CredentialMode {
    /// Build a Kubernetes client from the selected credentials.
    pub async fn client(&self) -> Result<Client, ControllerError> {
        let options = KubeConfigOptions::default();
        let config = match self {
            CredentialMode::InCluster => kube::Config::incluster()
                .map_err(|e| ControllerError::Credentials(format!("in-cluster config: {}", e)))?,
            CredentialMode::Kubeconfig(None) => kube::Config::from_kubeconfig(&options)
                .await
                .map_err(|e| ControllerError::Credentials(format!("kubeconfig: {}", e)))?,
            CredentialMode::Kubeconfig(Some(path)) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    ControllerError::Credentials(format!("reading {}: {}", path.display(), e))
                })?;
                kube::Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| {
                        let reason = format!("kubeconfig {}: {}", path.display(), e);
                        ControllerError::Credentials(reason)
                    })?
            }
        };
        Ok(Client::try_from(config)?)
    }
}

/// Fully resolved controller configuration, fixed for the process lifetime.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub watch: WatchTarget,
    pub mutation: MutationTarget,
    pub credentials: CredentialMode,
    pub delay: Duration,
    pub metrics_addr: SocketAddr,
    pub retry: RetryPolicy,
    pub sync_timeout: Duration,
}

impl From<Args> for ControllerConfig {
    fn from(args: Args) -> Self {
        let credentials = if args.inside_cluster {
            CredentialMode::InCluster
        } else {
            CredentialMode::Kubeconfig(args.kubeconfig)
        };
        Self {
            watch: WatchTarget {
                namespace: args.namespace.clone(),
                secret_name: args.secret_name,
            },
            mutation: MutationTarget {
                namespace: args.namespace,
                deployment_name: args.deployment_name,
            },
            credentials,
            delay: args.delay,
            metrics_addr: args.metrics_addr,
            // The first write is not a retry
            retry: RetryPolicy::with_max_attempts(args.max_conflict_retries.saturating_add(1)),
            sync_timeout: args.sync_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn test_parse_full_configuration() {
        let args = Args::try_parse_from([
            "secret-rollout-controller",
            "--secret-name", "app-tls",
            "--deployment-name", "app",
            "--namespace", "prod",
            "--delay", "0",
        ])
        .unwrap();
        let config = ControllerConfig::from(args);

        assert_eq!(config.watch.to_string(), "prod/app-tls");
        assert_eq!(config.mutation.to_string(), "prod/app");
        assert_eq!(config.delay, Duration::ZERO);
        assert_eq!(config.credentials, CredentialMode::Kubeconfig(None));
    }

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from([
            "secret-rollout-controller",
            "--secret-name", "app-tls",
            "--deployment-name", "app",
        ])
        .unwrap();
        let config = ControllerConfig::from(args);

        assert_eq!(config.watch.namespace, "default");
        assert_eq!(config.delay, Duration::from_secs(120));
        assert_eq!(config.retry.max_attempts, 11);
        assert_eq!(config.metrics_addr.port(), 8080);
    }

    #[test]
    fn test_missing_deployment_name_is_usage_error() {
        let err = Args::try_parse_from([
            "secret-rollout-controller",
            "--secret-name", "app-tls",
            "--namespace", "prod",
        ])
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
        assert_ne!(err.exit_code(), 0);
        assert!(err.to_string().contains("--deployment-name"));
    }

    #[test]
    fn test_empty_secret_name_is_rejected() {
        let err = Args::try_parse_from([
            "secret-rollout-controller",
            "--secret-name", "",
            "--deployment-name", "app",
        ])
        .unwrap_err();

        assert_ne!(err.exit_code(), 0);
    }

    #[test]
    fn test_inside_cluster_selects_in_cluster_credentials() {
        let args = Args::try_parse_from([
            "secret-rollout-controller",
            "--secret-name", "app-tls",
            "--deployment-name", "app",
            "--inside-cluster",
        ])
        .unwrap();

        assert_eq!(ControllerConfig::from(args).credentials, CredentialMode::InCluster);
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("2m"), Ok(Duration::from_secs(120)));
        assert_eq!(parse_duration("90s"), Ok(Duration::from_secs(90)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("15"), Ok(Duration::from_secs(15)));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("-5s").is_err());
    }

    #[test]
    fn test_parse_duration_rejects_overflow() {
        assert!(parse_duration("5124095576030432h").is_err());
        assert!(parse_duration("307445734561825861m").is_err());
        assert_eq!(
            parse_duration("5124095576030431h"),
            Ok(Duration::from_secs(5124095576030431 * 3600))
        );
    }

    #[test]
    fn test_zero_conflict_retries_still_writes_once() {
        let args = Args::try_parse_from([
            "secret-rollout-controller",
            "--secret-name", "app-tls",
            "--deployment-name", "app",
            "--max-conflict-retries", "0",
        ])
        .unwrap();

        assert_eq!(ControllerConfig::from(args).retry.max_attempts, 1);
    }
}
