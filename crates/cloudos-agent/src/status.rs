use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use cloudos_action::StatusSnapshot;
use sysinfo::System;

use crate::error::StatusError;

pub const DEFAULT_SAMPLE_WINDOW: Duration = Duration::from_secs(1);

/// Samples host metrics on demand. Holds no state between calls.
#[derive(Debug, Clone)]
pub struct StatusReporter {
    sample_window: Duration,
    disk_root: PathBuf,
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_WINDOW)
    }
}

impl StatusReporter {
    /// The window is raised to the sampler's minimum refresh interval if shorter.
    pub fn new(sample_window: Duration) -> Self {
        Self {
            sample_window: sample_window.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL),
            disk_root: PathBuf::from("/"),
        }
    }

    pub fn with_disk_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.disk_root = root.into();
        self
    }

    pub fn sample_window(&self) -> Duration {
        self.sample_window
    }

    /// Blocks for the sampling window on the blocking pool, not on the runtime.
    pub async fn get_status(&self) -> Result<StatusSnapshot, StatusError> {
        let window = self.sample_window;
        let root = self.disk_root.clone();
        let sampled = tokio::task::spawn_blocking(move || sample(window, &root)).await;

        match sampled {
            Ok(Ok(snapshot)) => Ok(snapshot),
            Ok(Err(e)) => {
                tracing::error!(error = %format!("{e:#}"), "failed to sample system status");
                Err(StatusError)
            }
            Err(e) => {
                tracing::error!(error = %e, "status sampler task failed");
                Err(StatusError)
            }
        }
    }
}

fn os_identifier() -> String {
    let name = System::name().unwrap_or_else(|| std::env::consts::OS.to_string());
    match System::kernel_version() {
        Some(kernel) if !kernel.is_empty() => format!("{name} {kernel}"),
        _ => name,
    }
}

fn sample(window: Duration, disk_root: &Path) -> anyhow::Result<StatusSnapshot> {
    let disk_percent = disk_usage_percent(disk_root)
        .with_context(|| format!("disk usage for {}", disk_root.display()))?;

    let mut sys = System::new();
    sys.refresh_cpu();
    std::thread::sleep(window);
    sys.refresh_cpu();
    let cpu_percent = sys.global_cpu_info().cpu_usage();

    sys.refresh_memory();
    let memory_total_bytes = sys.total_memory();
    if memory_total_bytes == 0 {
        anyhow::bail!("total memory reported as zero");
    }

    Ok(StatusSnapshot {
        os: os_identifier(),
        cpu_percent,
        memory_used_bytes: sys.used_memory(),
        memory_total_bytes,
        disk_percent,
    })
}

#[cfg(unix)]
fn disk_usage_percent(p: &Path) -> anyhow::Result<f64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c = CString::new(p.as_os_str().as_bytes()).context("path contains NUL")?;
    let mut s: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c.as_ptr(), &mut s) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error()).context("statvfs");
    }

    #[allow(clippy::unnecessary_cast)]
    let (blocks, free, frsize) = (s.f_blocks as u64, s.f_bfree as u64, s.f_frsize as u64);
    let total = blocks.saturating_mul(frsize);
    if total == 0 {
        anyhow::bail!("filesystem reports zero size");
    }
    let used = blocks.saturating_sub(free).saturating_mul(frsize);
    Ok(used as f64 / total as f64 * 100.0)
}

#[cfg(not(unix))]
fn disk_usage_percent(p: &Path) -> anyhow::Result<f64> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let disk = disks
        .iter()
        .filter(|d| p.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .context("no disk mounted at path")?;
    let total = disk.total_space();
    if total == 0 {
        anyhow::bail!("filesystem reports zero size");
    }
    let used = total.saturating_sub(disk.available_space());
    Ok(used as f64 / total as f64 * 100.0)
}
