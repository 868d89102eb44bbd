use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration, read once at boot and never mutated.
///
/// Every tunable has a default so the daemon comes up with no environment
/// at all (providers excepted: missing provider credentials are logged and
/// the corresponding workers will fail jobs fatally on first use).
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite file backing entities and queues.
    pub db_path: PathBuf,
    /// Root directory for the filesystem object store.
    pub storage_root: PathBuf,
    /// Public base URL under which stored objects are reachable.
    pub storage_public_base: String,
    /// Base URL of the CORS-terminating proxy for client-facing URLs.
    pub proxy_base: String,

    /// Concurrent image jobs per process.
    pub image_concurrency: usize,
    /// Concurrent model jobs per process.
    pub model_concurrency: usize,
    /// Wall-clock budget for one image job attempt.
    pub image_job_timeout: Duration,
    /// Wall-clock budget for one model job attempt.
    pub model_job_timeout: Duration,
    /// Retry attempts per job before dead-lettering.
    pub job_attempts: u32,
    /// Base delay for exponential retry backoff.
    pub backoff_base: Duration,

    /// Per-call timeout for an image provider call.
    pub image_call_timeout: Duration,
    /// Per-call timeout for a 3D provider submit call.
    pub model_submit_timeout: Duration,
    /// Per-call timeout for a 3D provider poll call.
    pub model_poll_timeout: Duration,
    /// Delay between 3D provider polls.
    pub model_poll_interval: Duration,
    /// Per-call timeout for storage upload/download.
    pub storage_timeout: Duration,

    /// Interval between orphaned-file sweeps.
    pub sweep_interval: Duration,
    /// Orphan rows fetched per sweep.
    pub sweep_batch_size: u32,
    /// Deletion attempts per orphan row before it needs an operator.
    pub sweep_max_retries: u32,

    /// Interval between subscriber heartbeats.
    pub heartbeat_interval: Duration,

    pub image_provider: Option<ProviderEndpoint>,
    pub model_provider: Option<ProviderEndpoint>,
    pub llm_provider: Option<ProviderEndpoint>,
    pub slicer: Option<ProviderEndpoint>,
}

/// Endpoint + credential pair for one external provider.
#[derive(Debug, Clone)]
pub struct ProviderEndpoint {
    pub base_url: String,
    pub api_key: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            db_path: env_path("KILN_DB_PATH", "kiln.db"),
            storage_root: env_path("KILN_STORAGE_ROOT", ".kiln/storage"),
            storage_public_base: env_str("KILN_STORAGE_PUBLIC_BASE", "http://localhost:9000"),
            proxy_base: env_str("KILN_PROXY_BASE", "http://localhost:3000"),

            image_concurrency: env_parse("KILN_IMAGE_CONCURRENCY", 2),
            model_concurrency: env_parse("KILN_MODEL_CONCURRENCY", 1),
            image_job_timeout: env_secs("KILN_IMAGE_JOB_TIMEOUT_SECS", 600),
            model_job_timeout: env_secs("KILN_MODEL_JOB_TIMEOUT_SECS", 1800),
            job_attempts: env_parse("KILN_JOB_ATTEMPTS", 3),
            backoff_base: env_secs("KILN_BACKOFF_BASE_SECS", 2),

            image_call_timeout: env_secs("KILN_IMAGE_CALL_TIMEOUT_SECS", 45),
            model_submit_timeout: env_secs("KILN_MODEL_SUBMIT_TIMEOUT_SECS", 60),
            model_poll_timeout: env_secs("KILN_MODEL_POLL_TIMEOUT_SECS", 15),
            model_poll_interval: env_secs("KILN_MODEL_POLL_INTERVAL_SECS", 3),
            storage_timeout: env_secs("KILN_STORAGE_TIMEOUT_SECS", 30),

            sweep_interval: env_secs("KILN_SWEEP_INTERVAL_SECS", 3600),
            sweep_batch_size: env_parse("KILN_SWEEP_BATCH_SIZE", 100),
            sweep_max_retries: env_parse("KILN_SWEEP_MAX_RETRIES", 10),

            heartbeat_interval: env_secs("KILN_HEARTBEAT_INTERVAL_SECS", 30),

            image_provider: provider_from_env("KILN_IMAGE_API_URL", "KILN_IMAGE_API_KEY"),
            model_provider: provider_from_env("KILN_MODEL_API_URL", "KILN_MODEL_API_KEY"),
            llm_provider: provider_from_env("KILN_LLM_API_URL", "KILN_LLM_API_KEY"),
            slicer: provider_from_env("KILN_SLICER_API_URL", "KILN_SLICER_API_KEY"),
        }
    }
}

fn provider_from_env(url_var: &str, key_var: &str) -> Option<ProviderEndpoint> {
    match (env::var(url_var), env::var(key_var)) {
        (Ok(base_url), Ok(api_key)) => Some(ProviderEndpoint { base_url, api_key }),
        _ => {
            tracing::warn!("{url_var}/{key_var} not set: provider unavailable");
            None
        }
    }
}

fn env_str(var: &str, default: &str) -> String {
    env::var(var).unwrap_or_else(|_| default.to_string())
}

fn env_path(var: &str, default: &str) -> PathBuf {
    PathBuf::from(env_str(var, default))
}

fn env_secs(var: &str, default: u64) -> Duration {
    Duration::from_secs(env_parse(var, default))
}

fn env_parse<T: std::str::FromStr + Copy>(var: &str, default: T) -> T {
    match env::var(var) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("{var}={raw} is not valid: using default");
            default
        }),
        Err(_) => default,
    }
}
