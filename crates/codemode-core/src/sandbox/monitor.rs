//! Resident-memory sampling for a running subprocess.

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Polls one process and keeps the peak observed resident size.
pub struct MemorySampler {
    system: System,
    pid: Pid,
    peak_bytes: u64,
}

impl MemorySampler {
    pub fn new(pid: u32) -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(pid),
            peak_bytes: 0,
        }
    }

    /// Current resident bytes, or `None` once the process is gone.
    pub fn sample(&mut self) -> Option<u64> {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            ProcessRefreshKind::new().with_memory(),
        );
        let bytes = self.system.process(self.pid)?.memory();
        self.peak_bytes = self.peak_bytes.max(bytes);
        Some(bytes)
    }

    pub fn peak_bytes(&self) -> u64 {
        self.peak_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_samples_own_process() {
        let mut sampler = MemorySampler::new(std::process::id());
        let bytes = sampler.sample().unwrap();
        assert!(bytes > 0);
        assert_eq!(sampler.peak_bytes(), bytes);
    }

    #[test]
    fn test_missing_process_yields_none() {
        let mut sampler = MemorySampler::new(u32::MAX - 1);
        assert!(sampler.sample().is_none());
        assert_eq!(sampler.peak_bytes(), 0);
    }
}
