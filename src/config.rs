//! Process configuration
//!
//! Every knob is a CLI flag with an environment-variable fallback. The
//! parsed [`Config`] is immutable for the process lifetime; components copy
//! the fields they need at construction time.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Configuration for the Gantry controller process
#[derive(Clone, Debug, Parser)]
#[command(name = "gantry", version, about = "Reconciles registry-declared services into cluster workloads")]
pub struct Config {
    /// Base URL of the service registry / control plane
    #[arg(long, env = "GANTRY_REGISTRY_URL")]
    pub registry_url: String,

    /// Listen address for the admin HTTP surface
    #[arg(long, env = "GANTRY_LISTEN_ADDR", default_value = "0.0.0.0:7780")]
    pub listen_addr: SocketAddr,

    /// Cluster namespace that holds every generated workload
    #[arg(long, env = "GANTRY_CONTROL_NAMESPACE", default_value = "gantry-services")]
    pub control_namespace: String,

    /// Image run by generated load-balancer deployments
    #[arg(long, env = "GANTRY_LB_IMAGE")]
    pub load_balancer_image: String,

    /// Port workload containers serve traffic on
    #[arg(long, env = "GANTRY_HTTP_PORT", default_value_t = 8080)]
    pub http_port: u16,

    /// Control port exposed by load-balancer replicas
    #[arg(long, env = "GANTRY_LB_CONTROL_PORT", default_value_t = 8081)]
    pub lb_control_port: u16,

    /// Seconds before a reconciled namespace counts as stale
    #[arg(long, env = "GANTRY_RECONCILE_PERIOD_SECS", default_value_t = 3600)]
    pub reconcile_period_secs: u64,

    /// Seconds between periodic staleness sweeps
    #[arg(long, env = "GANTRY_CHECK_INTERVAL_SECS", default_value_t = 300)]
    pub check_interval_secs: u64,

    /// Seconds to back off after a failed sweep or while the registry is unavailable
    #[arg(long, env = "GANTRY_ERROR_BACKOFF_SECS", default_value_t = 60)]
    pub error_backoff_secs: u64,

    /// Timeout in seconds for registry and load-balancer requests
    #[arg(long, env = "GANTRY_REQUEST_TIMEOUT_SECS", default_value_t = 10)]
    pub request_timeout_secs: u64,

    /// Path to a kubeconfig file (inferred from the environment when omitted)
    #[arg(long, env = "GANTRY_KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,
}

impl Config {
    /// How old a namespace's last reconcile may get before the periodic
    /// sweep picks it up again
    pub fn reconcile_period(&self) -> Duration {
        Duration::from_secs(self.reconcile_period_secs)
    }

    /// Pause between periodic staleness sweeps
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    /// Pause after a failed sweep or while the registry is not ready
    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }

    /// Per-request timeout for registry and load-balancer calls
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Config with short intervals for tests
    #[cfg(test)]
    pub fn for_testing() -> Self {
        Self {
            registry_url: "http://registry.test:7770".to_string(),
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            control_namespace: "gantry-services".to_string(),
            load_balancer_image: "gantry/loadbalancer:test".to_string(),
            http_port: 8080,
            lb_control_port: 8081,
            reconcile_period_secs: 3600,
            check_interval_secs: 300,
            error_backoff_secs: 60,
            request_timeout_secs: 1,
            kubeconfig: None,
        }
    }
}
