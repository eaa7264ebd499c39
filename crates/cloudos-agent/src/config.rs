use std::{net::SocketAddr, path::PathBuf, time::Duration};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";
const DEFAULT_DATA_ROOT: &str = "./data";
const ACTIONS_FILE_NAME: &str = "commands.json";
const DEFAULT_ACTION_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_CPU_SAMPLE_MS: u64 = 1000;
const DEFAULT_VNC_ADDR: &str = "localhost:5901";
const DEFAULT_VNC_CONNECT_TIMEOUT_MS: u64 = 5000;
const DEFAULT_VNC_IDLE_TIMEOUT_SECS: u64 = 15 * 60;

pub(crate) fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    env_string(name).and_then(|v| v.parse::<u64>().ok())
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub bind_addr: SocketAddr,
    pub data_root: PathBuf,
    pub actions_file: PathBuf,
    pub action_timeout: Duration,
    pub cpu_sample_window: Duration,
    pub vnc_addr: String,
    pub vnc_connect_timeout: Duration,
    /// `None` disables the idle cutoff.
    pub vnc_idle_timeout: Option<Duration>,
    pub api_token: Option<String>,
    pub log_dir: Option<PathBuf>,
}

impl AgentConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let raw_bind = env_string("CLOUDOS_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr: SocketAddr = raw_bind
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid CLOUDOS_BIND_ADDR {raw_bind:?}: {e}"))?;

        let data_root = env_string("CLOUDOS_DATA_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_ROOT));
        let actions_file = env_string("CLOUDOS_ACTIONS_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_root.join(ACTIONS_FILE_NAME));

        Ok(Self {
            bind_addr,
            data_root,
            actions_file,
            action_timeout: action_timeout(),
            cpu_sample_window: cpu_sample_window(),
            vnc_addr: env_string("CLOUDOS_VNC_ADDR").unwrap_or_else(|| DEFAULT_VNC_ADDR.to_string()),
            vnc_connect_timeout: vnc_connect_timeout(),
            vnc_idle_timeout: vnc_idle_timeout(),
            api_token: env_string("CLOUDOS_API_TOKEN"),
            log_dir: env_string("CLOUDOS_LOG_DIR").map(PathBuf::from),
        })
    }
}

pub(crate) fn action_timeout() -> Duration {
    Duration::from_millis(
        env_u64("CLOUDOS_ACTION_TIMEOUT_MS")
            .map(|v| v.clamp(100, 10 * 60 * 1000))
            .unwrap_or(DEFAULT_ACTION_TIMEOUT_MS),
    )
}

pub(crate) fn cpu_sample_window() -> Duration {
    Duration::from_millis(
        env_u64("CLOUDOS_CPU_SAMPLE_MS")
            .map(|v| v.clamp(200, 10_000))
            .unwrap_or(DEFAULT_CPU_SAMPLE_MS),
    )
}

pub(crate) fn vnc_connect_timeout() -> Duration {
    Duration::from_millis(
        env_u64("CLOUDOS_VNC_CONNECT_TIMEOUT_MS")
            .map(|v| v.clamp(100, 60_000))
            .unwrap_or(DEFAULT_VNC_CONNECT_TIMEOUT_MS),
    )
}

pub(crate) fn vnc_idle_timeout() -> Option<Duration> {
    let secs = env_u64("CLOUDOS_VNC_IDLE_TIMEOUT_SECS")
        .map(|v| v.min(24 * 60 * 60))
        .unwrap_or(DEFAULT_VNC_IDLE_TIMEOUT_SECS);
    (secs > 0).then(|| Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var names used here are not read by any other test.
    #[test]
    fn env_helpers_trim_and_reject_garbage() {
        unsafe {
            std::env::set_var("CLOUDOS_TEST_ENV_U64", " 42 ");
            std::env::set_var("CLOUDOS_TEST_ENV_BAD", "forty-two");
            std::env::set_var("CLOUDOS_TEST_ENV_BLANK", "   ");
        }
        assert_eq!(env_u64("CLOUDOS_TEST_ENV_U64"), Some(42));
        assert_eq!(env_u64("CLOUDOS_TEST_ENV_BAD"), None);
        assert_eq!(env_string("CLOUDOS_TEST_ENV_BLANK"), None);
        assert_eq!(env_string("CLOUDOS_TEST_ENV_MISSING"), None);
    }

    #[test]
    fn defaults_are_reference_policy() {
        assert_eq!(DEFAULT_ACTION_TIMEOUT_MS, 10_000);
        assert_eq!(DEFAULT_VNC_ADDR, "localhost:5901");
        assert!(DEFAULT_BIND_ADDR.parse::<SocketAddr>().is_ok());
    }
}
