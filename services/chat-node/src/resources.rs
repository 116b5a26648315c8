//! Host measurements for capacity sizing and load telemetry.

/// Snapshot of host load.
#[derive(Debug, Clone)]
pub struct HostLoad {
    /// 1, 5 and 15 minute load averages.
    pub load_avg: [f64; 3],
    pub total_memory_bytes: u64,
    pub free_memory_bytes: u64,
    /// Seconds since the host booted.
    pub uptime_secs: f64,
}

impl HostLoad {
    pub fn measure() -> Self {
        let (total_memory_bytes, free_memory_bytes) = get_memory_info();
        Self {
            load_avg: get_load_avg(),
            total_memory_bytes,
            free_memory_bytes,
            uptime_secs: get_uptime_secs(),
        }
    }

    /// Used memory as a whole percentage, rounded down.
    pub fn used_memory_percentage(&self) -> u64 {
        if self.total_memory_bytes == 0 {
            return 0;
        }
        let used = self.total_memory_bytes.saturating_sub(self.free_memory_bytes);
        used * 100 / self.total_memory_bytes
    }
}

/// Number of online CPUs.
pub fn cpu_count() -> usize {
    #[cfg(unix)]
    {
        let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if count > 0 {
            return count as usize;
        }
    }

    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

/// Host name, or an empty string when it cannot be read.
pub fn hostname() -> String {
    #[cfg(unix)]
    {
        if let Ok(name) = nix::unistd::gethostname() {
            return name.to_string_lossy().into_owned();
        }
    }

    String::new()
}

fn get_load_avg() -> [f64; 3] {
    let mut loads = [0f64; 3];

    #[cfg(unix)]
    {
        let n = unsafe { libc::getloadavg(loads.as_mut_ptr(), 3) };
        if n < 0 {
            loads = [0.0; 3];
        }
    }

    loads
}

#[cfg(target_os = "linux")]
fn get_uptime_secs() -> f64 {
    std::fs::read_to_string("/proc/uptime")
        .ok()
        .and_then(|content| parse_uptime(&content))
        .unwrap_or(0.0)
}

#[cfg(not(target_os = "linux"))]
fn get_uptime_secs() -> f64 {
    0.0
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_uptime(content: &str) -> Option<f64> {
    content.split_whitespace().next()?.parse().ok()
}

#[cfg(target_os = "linux")]
fn get_memory_info() -> (u64, u64) {
    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        return parse_meminfo(&meminfo);
    }
    sysconf_memory()
}

#[cfg(not(target_os = "linux"))]
fn get_memory_info() -> (u64, u64) {
    sysconf_memory()
}

fn sysconf_memory() -> (u64, u64) {
    #[cfg(unix)]
    {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let total_pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
        if page_size > 0 && total_pages > 0 {
            let total = (page_size as u64) * (total_pages as u64);
            return (total, total / 2);
        }
    }

    (0, 0)
}

/// Parse `/proc/meminfo` into (total, free) bytes.
///
/// Free prefers `MemAvailable` and falls back to free + buffers + cache.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_meminfo(content: &str) -> (u64, u64) {
    const KB_TO_BYTES: u64 = 1024;

    let mut total = 0;
    let mut available = 0;
    let mut free = 0;
    let mut buffers = 0;
    let mut cached = 0;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let value = value.parse::<u64>().unwrap_or(0) * KB_TO_BYTES;
        match key {
            "MemTotal:" => total = value,
            "MemAvailable:" => available = value,
            "MemFree:" => free = value,
            "Buffers:" => buffers = value,
            "Cached:" => cached = value,
            _ => {}
        }
    }

    if available == 0 {
        available = free + buffers + cached;
    }

    (total, available)
}
