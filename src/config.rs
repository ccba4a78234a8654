use crate::retry::RetryPolicy;
use clap::Parser;
use eyre::{eyre, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "billing-keeper",
    version,
    about = "Keeps cloud projects bound to healthy billing accounts across service-account identities."
)]
pub struct Cli {
    /// MySQL user.
    #[arg(long, env = "MYSQL_USER")]
    pub mysql_user: String,

    /// MySQL password.
    #[arg(long, env = "MYSQL_PASSWORD", hide_env_values = true)]
    pub mysql_password: String,

    /// MySQL host (host or host:port).
    #[arg(long, env = "MYSQL_HOST")]
    pub mysql_host: String,

    /// MySQL database name.
    #[arg(long, env = "MYSQL_DB")]
    pub mysql_db: String,

    /// Comma-separated identity names; each expects a credential file at
    /// <credentials-dir>/<name>.json.
    #[arg(long, env = "GCP_ACCOUNT_NAMES", default_value = "")]
    pub account_names: String,

    /// Directory holding per-identity service-account key files.
    #[arg(long, env = "CREDENTIALS_DIR", default_value = "credentials")]
    pub credentials_dir: PathBuf,

    /// Cap on projects per billing account.
    #[arg(long, env = "MAX_PROJECTS_PER_BILLING", default_value_t = 3)]
    pub max_projects_per_billing: usize,

    /// Seconds between reconcile cycles.
    #[arg(long, env = "UPDATE_INTERVAL", default_value_t = 300)]
    pub update_interval_seconds: u64,

    /// Retry executor cap (retries after the initial attempt).
    #[arg(long, env = "MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    /// Base backoff delay in seconds.
    #[arg(long, env = "BASE_RETRY_DELAY", default_value_t = 1)]
    pub base_retry_delay_seconds: u64,

    /// Maximum backoff delay in seconds.
    #[arg(long, env = "MAX_RETRY_DELAY", default_value_t = 60)]
    pub max_retry_delay_seconds: u64,

    /// Draw retry delays uniformly in [0, delay] to spread identities out.
    #[arg(long, env = "ENABLE_JITTER", default_value_t = true, action = clap::ArgAction::Set)]
    pub enable_jitter: bool,

    /// Master switch for re-binding unbound projects.
    #[arg(long, env = "ENABLE_AUTO_SWITCH", default_value_t = true, action = clap::ArgAction::Set)]
    pub enable_auto_switch: bool,

    /// Worker-pool cap for parallel identity reconciles.
    #[arg(long, env = "MAX_WORKERS", default_value_t = 8)]
    pub max_workers: usize,

    /// Wall-clock deadline for one cycle, in seconds.
    #[arg(long, env = "TASK_TIMEOUT", default_value_t = 600)]
    pub task_timeout_seconds: u64,

    /// Provider calls per second allowed per identity.
    #[arg(long, env = "MAX_QPS_PER_ACCOUNT", default_value_t = 10)]
    pub max_qps_per_account: u32,

    /// How long a provider call may wait for a rate-gate token, in seconds.
    #[arg(long, env = "GATE_ACQUIRE_TIMEOUT", default_value_t = 30)]
    pub gate_acquire_timeout_seconds: u64,

    /// Optional webhook receiving consecutive-failure alerts.
    #[arg(long, env = "ALERT_WEBHOOK_URL")]
    pub alert_webhook_url: Option<String>,

    /// Admin API listen address.
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8848")]
    pub listen_addr: SocketAddr,

    /// Single-instance lock file path.
    #[arg(long, env = "LOCK_FILE", default_value = "billing-keeper.lock")]
    pub lock_file: PathBuf,

    /// Run one reconcile cycle and exit.
    #[arg(long)]
    pub once: bool,
}

/// Validated runtime configuration, threaded explicitly through the
/// scheduler, reconciler, and admin surface.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub account_names: Vec<String>,
    pub credentials_dir: PathBuf,
    pub max_projects_per_billing: usize,
    pub update_interval: Duration,
    pub max_retries: u32,
    pub base_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub enable_jitter: bool,
    pub enable_auto_switch: bool,
    pub max_workers: usize,
    pub task_timeout: Duration,
    pub max_qps_per_account: u32,
    pub gate_acquire_timeout: Duration,
    pub alert_webhook_url: Option<String>,
    pub listen_addr: SocketAddr,
    pub lock_file: PathBuf,
    pub once: bool,
}

impl AppConfig {
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let account_names: Vec<String> = cli
            .account_names
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if account_names.is_empty() {
            tracing::warn!(
                "GCP_ACCOUNT_NAMES is empty; the keeper will serve the admin API but reconcile nothing"
            );
        }

        if cli.max_projects_per_billing == 0 {
            return Err(eyre!("MAX_PROJECTS_PER_BILLING must be > 0"));
        }
        if cli.max_workers == 0 {
            return Err(eyre!("MAX_WORKERS must be > 0"));
        }
        if cli.max_qps_per_account == 0 {
            return Err(eyre!("MAX_QPS_PER_ACCOUNT must be > 0"));
        }

        let max_retry_delay = cli.max_retry_delay_seconds.max(1);
        let mut base_retry_delay = cli.base_retry_delay_seconds.max(1);
        if base_retry_delay > max_retry_delay {
            tracing::warn!(
                base = base_retry_delay,
                max = max_retry_delay,
                "retry base delay > max; clamping base to max"
            );
            base_retry_delay = max_retry_delay;
        }

        let database_url = format!(
            "mysql://{}:{}@{}/{}",
            cli.mysql_user, cli.mysql_password, cli.mysql_host, cli.mysql_db
        );

        Ok(Self {
            database_url,
            account_names,
            credentials_dir: cli.credentials_dir,
            max_projects_per_billing: cli.max_projects_per_billing,
            update_interval: Duration::from_secs(cli.update_interval_seconds.max(1)),
            max_retries: cli.max_retries,
            base_retry_delay: Duration::from_secs(base_retry_delay),
            max_retry_delay: Duration::from_secs(max_retry_delay),
            enable_jitter: cli.enable_jitter,
            enable_auto_switch: cli.enable_auto_switch,
            max_workers: cli.max_workers,
            task_timeout: Duration::from_secs(cli.task_timeout_seconds.max(1)),
            max_qps_per_account: cli.max_qps_per_account,
            gate_acquire_timeout: Duration::from_secs(cli.gate_acquire_timeout_seconds.max(1)),
            alert_webhook_url: cli.alert_webhook_url,
            listen_addr: cli.listen_addr,
            lock_file: cli.lock_file,
            once: cli.once,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: self.base_retry_delay,
            max_delay: self.max_retry_delay,
            jitter: self.enable_jitter,
        }
    }

    /// Pool sizing: one connection per worker plus headroom for the admin
    /// surface and operator actions.
    pub fn db_pool_size(&self) -> u32 {
        (self.max_workers as u32).saturating_add(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut full = vec![
            "billing-keeper",
            "--mysql-user",
            "keeper",
            "--mysql-password",
            "secret",
            "--mysql-host",
            "db",
            "--mysql-db",
            "billing",
        ];
        full.extend_from_slice(args);
        Cli::parse_from(full)
    }

    #[test]
    fn account_names_are_split_and_trimmed() {
        let cfg =
            AppConfig::from_cli(cli(&["--account-names", "sa-1, sa-2,,sa-3 "])).unwrap();
        assert_eq!(cfg.account_names, vec!["sa-1", "sa-2", "sa-3"]);
    }

    #[test]
    fn database_url_is_assembled() {
        let cfg = AppConfig::from_cli(cli(&[])).unwrap();
        assert_eq!(cfg.database_url, "mysql://keeper:secret@db/billing");
    }

    #[test]
    fn base_delay_is_clamped_to_max() {
        let cfg = AppConfig::from_cli(cli(&[
            "--base-retry-delay-seconds",
            "120",
            "--max-retry-delay-seconds",
            "60",
        ]))
        .unwrap();
        assert_eq!(cfg.base_retry_delay, Duration::from_secs(60));
    }

    #[test]
    fn zero_cap_is_rejected() {
        assert!(AppConfig::from_cli(cli(&["--max-projects-per-billing", "0"])).is_err());
    }

    #[test]
    fn defaults_match_the_documented_table() {
        let cfg = AppConfig::from_cli(cli(&[])).unwrap();
        assert_eq!(cfg.max_projects_per_billing, 3);
        assert_eq!(cfg.update_interval, Duration::from_secs(300));
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.max_retry_delay, Duration::from_secs(60));
        assert!(cfg.enable_jitter);
        assert!(cfg.enable_auto_switch);
        assert_eq!(cfg.max_workers, 8);
        assert_eq!(cfg.task_timeout, Duration::from_secs(600));
        assert_eq!(cfg.max_qps_per_account, 10);
    }
}
