use std::path::PathBuf;

use chrono::Utc;
use futures::future::BoxFuture;
use tracing::debug;

use vigil_core::error::{Result, VigilError};
use vigil_core::traits::MetricsProvider;
use vigil_core::types::*;

/// Reads host health from the Linux procfs.
pub struct ProcMetricsProvider {
    proc_root: PathBuf,
}

impl Default for ProcMetricsProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcMetricsProvider {
    pub fn new() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
        }
    }

    /// Read from an alternate procfs root.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: root.into(),
        }
    }

    async fn read(&self, rel: &str) -> Result<String> {
        let path = self.proc_root.join(rel);
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| VigilError::Metrics(format!("{}: {}", path.display(), e)))
    }

    async fn snapshot(&self) -> Result<HealthSnapshot> {
        let meminfo = self.read("meminfo").await?;
        let (total_kb, available_kb) = parse_meminfo(&meminfo)
            .ok_or_else(|| VigilError::Metrics("meminfo missing MemTotal".into()))?;

        let load_average = match self.read("loadavg").await {
            Ok(s) => parse_loadavg(&s).unwrap_or_default(),
            Err(_) => [0.0; 3],
        };
        let uptime = self
            .read("uptime")
            .await
            .ok()
            .and_then(|s| parse_uptime(&s))
            .unwrap_or(0);
        let hostname = self
            .read("sys/kernel/hostname")
            .await
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "unknown".into());
        let release = self
            .read("sys/kernel/osrelease")
            .await
            .map(|s| s.trim().to_string())
            .unwrap_or_default();

        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let total = total_kb * 1024;
        let free = available_kb * 1024;
        let memory_usage = memory_usage_percent(total_kb, available_kb);
        let cpu_usage = (load_average[0] / cpus as f64 * 100.0).min(100.0);

        debug!(memory_usage, cpu_usage, "Health snapshot taken");

        Ok(HealthSnapshot {
            status: "operational".into(),
            timestamp: Utc::now(),
            system: SystemInfo {
                platform: std::env::consts::OS.to_string(),
                release,
                arch: std::env::consts::ARCH.to_string(),
                hostname,
            },
            resources: Resources {
                cpu: CpuUsage {
                    usage_percentage: format_percentage(cpu_usage),
                },
                memory: MemoryUsage {
                    total: total.to_string(),
                    free: free.to_string(),
                    usage_percentage: format_percentage(memory_usage),
                },
                load_average,
                uptime,
                cpus,
            },
        })
    }
}

impl MetricsProvider for ProcMetricsProvider {
    fn fetch(&self) -> BoxFuture<'_, Result<HealthSnapshot>> {
        Box::pin(self.snapshot())
    }
}

/// `(MemTotal, MemAvailable)` in kB. Falls back to `MemFree` on old kernels.
pub fn parse_meminfo(content: &str) -> Option<(u64, u64)> {
    let field = |name: &str| {
        content.lines().find_map(|line| {
            let rest = line.strip_prefix(name)?.strip_prefix(':')?;
            rest.split_whitespace().next()?.parse::<u64>().ok()
        })
    };
    let total = field("MemTotal")?;
    let available = field("MemAvailable").or_else(|| field("MemFree"))?;
    Some((total, available))
}

pub fn parse_loadavg(content: &str) -> Option<[f64; 3]> {
    let mut parts = content.split_whitespace().map(|p| p.parse::<f64>().ok());
    Some([parts.next()??, parts.next()??, parts.next()??])
}

pub fn parse_uptime(content: &str) -> Option<u64> {
    content
        .split_whitespace()
        .next()?
        .parse::<f64>()
        .ok()
        .map(|secs| secs as u64)
}

pub fn memory_usage_percent(total: u64, free: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (total.saturating_sub(free)) as f64 / total as f64 * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMINFO: &str = "MemTotal:       16000000 kB\nMemFree:         1000000 kB\nMemAvailable:    4000000 kB\n";

    #[test]
    fn test_parse_meminfo_prefers_available() {
        assert_eq!(parse_meminfo(MEMINFO), Some((16_000_000, 4_000_000)));
        assert_eq!(
            parse_meminfo("MemTotal: 100 kB\nMemFree: 10 kB\n"),
            Some((100, 10))
        );
        assert_eq!(parse_meminfo("Buffers: 1 kB\n"), None);
    }

    #[test]
    fn test_parse_loadavg_and_uptime() {
        assert_eq!(
            parse_loadavg("0.52 0.58 0.59 1/467 12345\n"),
            Some([0.52, 0.58, 0.59])
        );
        assert_eq!(parse_loadavg("garbage"), None);
        assert_eq!(parse_uptime("3600.75 12000.00\n"), Some(3600));
    }

    #[test]
    fn test_memory_usage_percent() {
        assert_eq!(memory_usage_percent(200, 50), 75.0);
        assert_eq!(memory_usage_percent(0, 0), 0.0);
    }

    #[tokio::test]
    async fn test_snapshot_from_fake_procfs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("meminfo"), MEMINFO).unwrap();
        std::fs::write(dir.path().join("loadavg"), "0.00 0.10 0.20 1/1 1\n").unwrap();
        std::fs::write(dir.path().join("uptime"), "42.0 0.0\n").unwrap();

        let provider = ProcMetricsProvider::with_root(dir.path());
        let snap = provider.fetch().await.unwrap();
        assert_eq!(snap.status, "operational");
        assert_eq!(snap.resources.memory.usage_percentage, "75.00%");
        assert_eq!(snap.resources.memory.total, "16384000000");
        assert_eq!(snap.resources.uptime, 42);
        assert_eq!(snap.resources.cpu.usage_percentage, "0.00%");
        assert_eq!(snap.system.hostname, "unknown");
    }

    #[tokio::test]
    async fn test_missing_meminfo_is_metrics_error() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ProcMetricsProvider::with_root(dir.path());
        assert!(matches!(
            provider.fetch().await,
            Err(VigilError::Metrics(_))
        ));
    }
}
