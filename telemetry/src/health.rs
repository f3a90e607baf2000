//! # Health checks
//!
//! A [`HealthRegistry`] owns a set of [`HealthCheck`]s and aggregates their
//! outcomes into a [`HealthReport`]:
//!
//! - any check failing makes the service `unhealthy`;
//! - otherwise any check warning makes it `degraded`;
//! - otherwise, including when no checks are registered, it is `healthy`.
//!
//! Checks run concurrently and each is bounded by a timeout. A check that
//! errors, panics or times out is reported as failed without affecting the
//! others.
use async_trait::async_trait;
use futures_util::future::join_all;
use futures_util::FutureExt;
use serde::Serialize;
use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Disks, System};

/// Time each check may take before it is reported as failed.
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a single check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    /// Working as expected.
    Pass,
    /// Working, but close to a limit.
    Warn,
    /// Not working.
    Fail,
}

/// Aggregate status of a service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every check passed.
    Healthy,
    /// At least one check warned and none failed.
    Degraded,
    /// At least one check failed.
    Unhealthy,
}

impl HealthStatus {
    /// Aggregate check statuses. An empty set is healthy.
    pub fn from_checks<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = CheckStatus>,
    {
        statuses
            .into_iter()
            .fold(HealthStatus::Healthy, |aggregate, status| {
                match (aggregate, status) {
                    (_, CheckStatus::Fail) | (HealthStatus::Unhealthy, _) => HealthStatus::Unhealthy,
                    (_, CheckStatus::Warn) | (HealthStatus::Degraded, _) => HealthStatus::Degraded,
                    (HealthStatus::Healthy, CheckStatus::Pass) => HealthStatus::Healthy,
                }
            })
    }

    /// Whether the service should receive traffic.
    pub fn is_ready(&self) -> bool {
        !matches!(self, HealthStatus::Unhealthy)
    }
}

/// What a check observed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckOutcome {
    status: CheckStatus,
    message: Option<String>,
}

impl CheckOutcome {
    /// A passing outcome.
    pub fn pass() -> Self {
        CheckOutcome {
            status: CheckStatus::Pass,
            message: None,
        }
    }

    /// A warning with an explanation.
    pub fn warn(message: impl Into<String>) -> Self {
        CheckOutcome {
            status: CheckStatus::Warn,
            message: Some(message.into()),
        }
    }

    /// A failure with an explanation.
    pub fn fail(message: impl Into<String>) -> Self {
        CheckOutcome {
            status: CheckStatus::Fail,
            message: Some(message.into()),
        }
    }

    /// Attach or replace the message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// The status.
    pub fn status(&self) -> CheckStatus {
        self.status
    }

    /// The message, if any.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

/// Why a check could not produce an outcome.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HealthCheckError {
    /// The check ran and reported an error.
    #[error("{0}")]
    Failed(String),
    /// The check did not finish in time.
    #[error("check timed out after {0:?}")]
    Timeout(Duration),
    /// The check panicked.
    #[error("check panicked")]
    Panicked,
}

/// A named check of one dependency or resource.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Name shown in the report.
    fn name(&self) -> &str;

    /// Check the dependency.
    async fn check(&self) -> Result<CheckOutcome, HealthCheckError>;
}

/// Result of one check in a report.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CheckResult {
    /// Check name.
    pub name: String,
    /// Check status.
    pub status: CheckStatus,
    /// Optional explanation.
    pub message: Option<String>,
    /// Time the check took, in milliseconds.
    pub duration_ms: f64,
}

/// Aggregated result of every registered check.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthReport {
    /// Aggregate status.
    pub status: HealthStatus,
    /// Per check results, in registration order.
    pub checks: Vec<CheckResult>,
    /// Service name.
    pub service: String,
    /// Service version.
    pub version: String,
    /// Seconds since the registry was created.
    pub uptime_seconds: f64,
    /// When the report was produced, RFC 3339.
    pub timestamp: String,
}

impl HealthReport {
    /// Whether the service should receive traffic.
    pub fn is_ready(&self) -> bool {
        self.status.is_ready()
    }
}

/// A set of health checks for one service.
pub struct HealthRegistry {
    service: String,
    version: String,
    started: Instant,
    timeout: Duration,
    checks: Vec<Arc<dyn HealthCheck>>,
}

impl fmt::Debug for HealthRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthRegistry")
            .field("service", &self.service)
            .field("version", &self.version)
            .field("timeout", &self.timeout)
            .field(
                "checks",
                &self.checks.iter().map(|c| c.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl HealthRegistry {
    /// Create an empty registry for `service` at `version`.
    pub fn new(service: impl Into<String>, version: impl Into<String>) -> Self {
        HealthRegistry {
            service: service.into(),
            version: version.into(),
            started: Instant::now(),
            timeout: DEFAULT_CHECK_TIMEOUT,
            checks: Vec::new(),
        }
    }

    /// Set the per check timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Add a check.
    pub fn with_check<C: HealthCheck + 'static>(mut self, check: C) -> Self {
        self.register(check);
        self
    }

    /// Add a check to an existing registry.
    pub fn register<C: HealthCheck + 'static>(&mut self, check: C) {
        self.checks.push(Arc::new(check));
    }

    /// Number of registered checks.
    pub fn len(&self) -> usize {
        self.checks.len()
    }

    /// Whether no checks are registered.
    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Run every check concurrently and aggregate the results.
    pub async fn check_all(&self) -> HealthReport {
        let checks = join_all(
            self.checks
                .iter()
                .map(|check| run_check(check.as_ref(), self.timeout)),
        )
        .await;

        HealthReport {
            status: HealthStatus::from_checks(checks.iter().map(|c| c.status)),
            checks,
            service: self.service.clone(),
            version: self.version.clone(),
            uptime_seconds: self.started.elapsed().as_secs_f64(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

async fn run_check(check: &dyn HealthCheck, timeout: Duration) -> CheckResult {
    let started = Instant::now();
    let guarded = AssertUnwindSafe(check.check()).catch_unwind();
    let outcome = match tokio::time::timeout(timeout, guarded).await {
        Ok(Ok(Ok(outcome))) => outcome,
        Ok(Ok(Err(err))) => CheckOutcome::fail(err.to_string()),
        Ok(Err(_)) => CheckOutcome::fail(HealthCheckError::Panicked.to_string()),
        Err(_) => CheckOutcome::fail(HealthCheckError::Timeout(timeout).to_string()),
    };
    let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

    match outcome.status {
        CheckStatus::Fail => tracing::warn!(
            check = check.name(),
            detail = outcome.message().unwrap_or_default(),
            "health check failed"
        ),
        CheckStatus::Warn => tracing::info!(
            check = check.name(),
            detail = outcome.message().unwrap_or_default(),
            "health check degraded"
        ),
        CheckStatus::Pass => tracing::debug!(check = check.name(), "health check passed"),
    }

    CheckResult {
        name: check.name().to_owned(),
        status: outcome.status,
        message: outcome.message,
        duration_ms,
    }
}

/// A check backed by an async closure, for reachability of databases, caches
/// and other services.
pub struct FnCheck<F> {
    name: Cow<'static, str>,
    run: F,
}

impl<F> FnCheck<F> {
    /// Create a check called `name` running `run`.
    pub fn new(name: impl Into<Cow<'static, str>>, run: F) -> Self {
        FnCheck {
            name: name.into(),
            run,
        }
    }
}

impl<F> fmt::Debug for FnCheck<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnCheck").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F, Fut> HealthCheck for FnCheck<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<CheckOutcome, HealthCheckError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> Result<CheckOutcome, HealthCheckError> {
        (self.run)().await
    }
}

fn classify(ratio: f64, warn_at: f64, fail_at: f64) -> CheckStatus {
    if ratio >= fail_at {
        CheckStatus::Fail
    } else if ratio >= warn_at {
        CheckStatus::Warn
    } else {
        CheckStatus::Pass
    }
}

/// Compares used system memory against warn and fail ratios.
#[derive(Clone, Debug)]
pub struct MemoryCheck {
    warn_at: f64,
    fail_at: f64,
}

impl Default for MemoryCheck {
    fn default() -> Self {
        MemoryCheck {
            warn_at: 0.85,
            fail_at: 0.95,
        }
    }
}

impl MemoryCheck {
    /// Warn at `warn_at` and fail at `fail_at` used memory ratio.
    pub fn new(warn_at: f64, fail_at: f64) -> Self {
        MemoryCheck { warn_at, fail_at }
    }
}

#[async_trait]
impl HealthCheck for MemoryCheck {
    fn name(&self) -> &str {
        "memory"
    }

    async fn check(&self) -> Result<CheckOutcome, HealthCheckError> {
        let (warn_at, fail_at) = (self.warn_at, self.fail_at);
        off_executor(move || {
            let mut system = System::new();
            system.refresh_memory();
            let total = system.total_memory();
            if total == 0 {
                return Err(HealthCheckError::Failed("total memory unknown".to_owned()));
            }
            let ratio = system.used_memory() as f64 / total as f64;
            Ok(CheckOutcome {
                status: classify(ratio, warn_at, fail_at),
                message: Some(format!("{:.1}% memory used", ratio * 100.0)),
            })
        })
        .await
    }
}

/// Compares used space on the disk holding a path against warn and fail
/// ratios.
#[derive(Clone, Debug)]
pub struct DiskCheck {
    path: PathBuf,
    warn_at: f64,
    fail_at: f64,
}

impl DiskCheck {
    /// Check the disk mounted at or above `path`, with default thresholds.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DiskCheck {
            path: path.into(),
            warn_at: 0.85,
            fail_at: 0.95,
        }
    }

    /// Warn at `warn_at` and fail at `fail_at` used space ratio.
    pub fn with_thresholds(mut self, warn_at: f64, fail_at: f64) -> Self {
        self.warn_at = warn_at;
        self.fail_at = fail_at;
        self
    }

    /// The checked path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl HealthCheck for DiskCheck {
    fn name(&self) -> &str {
        "disk"
    }

    async fn check(&self) -> Result<CheckOutcome, HealthCheckError> {
        let check = self.clone();
        off_executor(move || check.read_disk()).await
    }
}

impl DiskCheck {
    fn read_disk(&self) -> Result<CheckOutcome, HealthCheckError> {
        let disks = Disks::new_with_refreshed_list();
        let disk = disks
            .list()
            .iter()
            .filter(|disk| self.path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .ok_or_else(|| {
                HealthCheckError::Failed(format!("no disk mounted for {}", self.path.display()))
            })?;

        let total = disk.total_space();
        if total == 0 {
            return Err(HealthCheckError::Failed(format!(
                "{} reports no capacity",
                disk.mount_point().display()
            )));
        }
        let used = total.saturating_sub(disk.available_space());
        let ratio = used as f64 / total as f64;
        Ok(CheckOutcome {
            status: classify(ratio, self.warn_at, self.fail_at),
            message: Some(format!(
                "{:.1}% used on {}",
                ratio * 100.0,
                disk.mount_point().display()
            )),
        })
    }
}

/// Runs a blocking system read on tokio's blocking pool.
async fn off_executor<F>(read: F) -> Result<CheckOutcome, HealthCheckError>
where
    F: FnOnce() -> Result<CheckOutcome, HealthCheckError> + Send + 'static,
{
    tokio::task::spawn_blocking(read).await.map_err(|err| {
        if err.is_panic() {
            HealthCheckError::Panicked
        } else {
            HealthCheckError::Failed(err.to_string())
        }
    })?
}
