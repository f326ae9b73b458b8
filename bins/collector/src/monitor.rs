/// Resident set size of this process in MB, where the platform exposes it.
pub fn resident_memory_mb() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        parse_vm_rss_mb(&status)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_vm_rss_mb(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_vm_rss_in_megabytes() {
        let status = "Name:\tcollector\nVmPeak:\t  900000 kB\nVmRSS:\t  204800 kB\nThreads:\t4\n";
        assert_eq!(parse_vm_rss_mb(status), Some(200));
        assert_eq!(parse_vm_rss_mb("Name:\tx\n"), None);
    }
}
