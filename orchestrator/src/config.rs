use backup_protocol::ApiVersion;
use std::path::PathBuf;

/// Which admission discipline the executor runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// One FIFO queue, at most one action system-wide.
    StrictSerial,
    /// Main + import/export lanes with conflict-checked parallel admission.
    LimitedParallel,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub log_level: String,
    pub execution_mode: ExecutionMode,
    /// Newest control-stream API version this orchestrator accepts.
    pub max_api_version: ApiVersion,
    /// Seconds a housekeeping delete waits for the per-backup lock.
    pub housekeeping_lock_timeout_secs: u64,
    /// Seconds between job monitor heartbeats.
    pub job_monitor_period_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let data_dir = PathBuf::from(
            std::env::var("DATA_DIR").unwrap_or_else(|_| "/var/lib/backup-orchestrator".into()),
        );

        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(7001),
            db_path: data_dir.join("orchestrator.db"),
            data_dir,
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            execution_mode: match std::env::var("ENABLE_LIMITED_PARALLEL_ACTIONS").as_deref() {
                Ok("true") | Ok("1") => ExecutionMode::LimitedParallel,
                _ => ExecutionMode::StrictSerial,
            },
            max_api_version: ApiVersion::latest(),
            housekeeping_lock_timeout_secs: std::env::var("HOUSEKEEPING_LOCK_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(120),
            job_monitor_period_secs: std::env::var("JOB_MONITOR_PERIOD_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
        }
    }
}
