//! Host resource summary recorded with each run.
use serde::Serialize;
use sysinfo::System;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HostSummary {
    pub cpu_name: String,
    pub cores_logical: usize,
    pub cores_physical: usize,
    pub ram_total_bytes: u64,
}

pub fn summary() -> HostSummary {
    let mut sys = System::new_all();
    sys.refresh_memory();
    let cpu_name = sys
        .cpus()
        .first()
        .map(|c| c.brand().trim().to_owned())
        .filter(|b| !b.is_empty())
        .unwrap_or_else(|| std::env::consts::ARCH.to_owned());
    HostSummary {
        cpu_name,
        cores_logical: num_cpus::get(),
        cores_physical: num_cpus::get_physical(),
        ram_total_bytes: sys.total_memory(),
    }
}

/// Human-readable byte count with binary units, e.g. `1.50 KB`.
pub fn format_bytes(n: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
    let mut value = n as f64;
    let mut i = 0;
    while value >= 1024.0 && i < UNITS.len() - 1 {
        value /= 1024.0;
        i += 1;
    }
    format!("{value:.2} {}", UNITS[i])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_scale_through_units() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(8 * 1024 * 1024 * 1024), "8.00 GB");
    }

    #[test]
    fn summary_reports_at_least_one_core() {
        let s = summary();
        assert!(s.cores_logical >= 1);
        assert!(s.cores_physical >= 1);
        assert!(!s.cpu_name.is_empty());
    }
}
