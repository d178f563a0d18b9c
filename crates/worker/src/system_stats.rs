use std::fs;

use traffic_core::models::WorkerStats;

/// 收集随 taskFinished 上报的进程信息
pub fn collect_worker_stats() -> WorkerStats {
    let (vm_peak_kib, vm_rss_kib) = fs::read_to_string("/proc/self/status")
        .map(|status| parse_memory_status(&status))
        .unwrap_or((None, None));

    WorkerStats {
        host_name: hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string()),
        version: env!("CARGO_PKG_VERSION").to_string(),
        vm_peak_kib,
        vm_rss_kib,
    }
}

/// 从 `/proc/<pid>/status` 中取 VmPeak 和 VmRSS（kB）
pub fn parse_memory_status(status: &str) -> (Option<u64>, Option<u64>) {
    let field = |name: &str| {
        status
            .lines()
            .find_map(|line| line.strip_prefix(name))
            .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse().ok())
    };
    (field("VmPeak:"), field("VmRSS:"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_status() {
        let status = "Name:\tworker\nVmPeak:\t  123456 kB\nVmSize:\t  120000 kB\nVmRSS:\t    4096 kB\n";
        assert_eq!(parse_memory_status(status), (Some(123456), Some(4096)));
        assert_eq!(parse_memory_status("Name:\tworker\n"), (None, None));
    }

    #[test]
    fn test_collect_has_version() {
        let stats = collect_worker_stats();
        assert!(!stats.version.is_empty());
        assert!(!stats.host_name.is_empty());
    }
}
