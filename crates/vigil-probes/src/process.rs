use futures::future::BoxFuture;
use tracing::warn;

use vigil_core::traits::ProcessSampler;
use vigil_core::types::ProcessInfo;

/// Samples the busiest processes with `ps`.
pub struct PsProcessSampler {
    limit: usize,
}

impl PsProcessSampler {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }
}

impl ProcessSampler for PsProcessSampler {
    fn fetch(&self) -> BoxFuture<'_, Vec<ProcessInfo>> {
        Box::pin(async move {
            let output = tokio::process::Command::new("ps")
                .args(["-eo", "pid,%cpu,%mem,comm", "--sort=-%cpu"])
                .output()
                .await;
            match output {
                Ok(out) if out.status.success() => {
                    parse_ps(&String::from_utf8_lossy(&out.stdout), self.limit)
                }
                Ok(out) => {
                    warn!(status = %out.status, "ps exited with failure");
                    Vec::new()
                }
                Err(e) => {
                    warn!(error = %e, "Failed to run ps");
                    Vec::new()
                }
            }
        })
    }
}

/// Parse `ps -eo pid,%cpu,%mem,comm` output, skipping the header and bad lines.
pub fn parse_ps(text: &str, limit: usize) -> Vec<ProcessInfo> {
    text.lines()
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let pid = parts.next()?.parse().ok()?;
            let cpu_percent = parts.next()?.parse().ok()?;
            let memory_percent = parts.next()?.parse().ok()?;
            // comm may contain spaces
            let name = parts.collect::<Vec<_>>().join(" ");
            if name.is_empty() {
                return None;
            }
            Some(ProcessInfo {
                pid,
                name,
                cpu_percent,
                memory_percent,
            })
        })
        .take(limit)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ps_output() {
        let text = "  PID %CPU %MEM COMMAND\n 4242 99.0 41.5 Google Chrome\n   77  3.2  4.0 postgres\n  bad line\n    1  0.0  0.1 init\n";
        let procs = parse_ps(text, 5);
        assert_eq!(procs.len(), 3);
        assert_eq!(procs[0].name, "Google Chrome");
        assert_eq!(procs[0].pid, 4242);
        assert_eq!(procs[0].cpu_percent, 99.0);
        assert_eq!(procs[1].memory_percent, 4.0);
    }

    #[test]
    fn test_parse_ps_respects_limit() {
        let text = "PID %CPU %MEM COMMAND\n1 1.0 1.0 a\n2 1.0 1.0 b\n3 1.0 1.0 c\n";
        assert_eq!(parse_ps(text, 2).len(), 2);
        assert!(parse_ps("", 5).is_empty());
    }
}
