//! Unix-specific capability probing
//!
//! Physical memory is read from `/proc/meminfo` where procfs exists.

use tracing::debug;

/// Total physical memory in bytes, if the platform exposes it
pub async fn total_memory_bytes() -> Option<u64> {
    match tokio::fs::read_to_string("/proc/meminfo").await {
        Ok(content) => parse_mem_total(&content),
        Err(e) => {
            debug!("Failed to read /proc/meminfo: {}", e);
            None
        }
    }
}

/// Extract `MemTotal` (reported in kB) from meminfo content
pub fn parse_mem_total(content: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let rest = line.strip_prefix("MemTotal:")?;
        let mut parts = rest.split_whitespace();
        let value: u64 = parts.next()?.parse().ok()?;
        match parts.next() {
            Some("kB") | None => Some(value * 1024),
            Some(_) => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mem_total() {
        let content = "MemTotal:       16318480 kB\nMemFree:         1022336 kB\n";
        assert_eq!(parse_mem_total(content), Some(16318480 * 1024));
    }

    #[test]
    fn test_parse_mem_total_missing() {
        assert_eq!(parse_mem_total("MemFree: 12 kB\n"), None);
        assert_eq!(parse_mem_total("MemTotal: lots kB\n"), None);
    }

    #[tokio::test]
    async fn test_total_memory_does_not_fail() {
        // Absent procfs yields None rather than an error
        let _ = total_memory_bytes().await;
    }
}
