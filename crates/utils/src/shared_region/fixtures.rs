use std::io;
use std::path::Path;

use super::layout::*;

/// Builder for synthetic region images.
#[derive(Debug, Clone)]
pub struct RegionImage {
    bytes: Vec<u8>,
}

impl Default for RegionImage {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionImage {
    /// An initialized region with no devices and no processes.
    pub fn new() -> Self {
        let mut image = Self {
            bytes: vec![0; REGION_SIZE],
        };
        image.put(INITIALIZED_FLAG_OFFSET, &1i32.to_ne_bytes());
        image
    }

    fn put(&mut self, offset: usize, value: &[u8]) {
        self.bytes[offset..offset + value.len()].copy_from_slice(value);
    }

    fn get_u64(&self, offset: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.bytes[offset..offset + 8]);
        u64::from_ne_bytes(raw)
    }

    fn get_i32(&self, offset: usize) -> i32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.bytes[offset..offset + 4]);
        i32::from_ne_bytes(raw)
    }

    /// Fills device slot `slot` and grows the device count to cover it.
    pub fn device(mut self, slot: usize, uuid: &str, memory_limit: u64, core_limit: u64) -> Self {
        assert!(slot < MAX_DEVICES, "device slot {slot} out of range");
        assert!(uuid.len() < UUID_LEN, "uuid too long");
        let at = UUIDS_OFFSET + slot * UUID_LEN;
        self.put(at, &[0; UUID_LEN]);
        self.put(at, uuid.as_bytes());
        self.put(MEMORY_LIMIT_OFFSET + slot * 8, &memory_limit.to_ne_bytes());
        self.put(CORE_LIMIT_OFFSET + slot * 8, &core_limit.to_ne_bytes());
        let count = self.get_u64(DEVICE_NUM_OFFSET).max(slot as u64 + 1);
        self.put(DEVICE_NUM_OFFSET, &count.to_ne_bytes());
        self
    }

    /// Fills process slot `slot` with per-device memory totals.
    pub fn process(mut self, slot: usize, pid: i32, host_pid: i32, used: &[(usize, u64)]) -> Self {
        assert!(slot < MAX_PROCESSES, "process slot {slot} out of range");
        let base = PROCS_OFFSET + slot * PROC_SLOT_SIZE;
        self.put(base + PROC_PID_OFFSET, &pid.to_ne_bytes());
        self.put(base + PROC_HOST_PID_OFFSET, &host_pid.to_ne_bytes());
        for &(dev, total) in used {
            let at = base + PROC_USED_OFFSET + dev * DEVICE_MEMORY_SIZE;
            self.put(at + 16, &total.to_ne_bytes());
            self.put(at + 32, &total.to_ne_bytes());
        }
        let count = self.get_i32(PROC_NUM_OFFSET).max(slot as i32 + 1);
        self.put(PROC_NUM_OFFSET, &count.to_ne_bytes());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.put(PRIORITY_OFFSET, &priority.to_ne_bytes());
        self
    }

    pub fn recent_kernel(mut self, value: i32) -> Self {
        self.put(RECENT_KERNEL_OFFSET, &value.to_ne_bytes());
        self
    }

    pub fn utilization_switch(mut self, value: i32) -> Self {
        self.put(UTILIZATION_SWITCH_OFFSET, &value.to_ne_bytes());
        self
    }

    /// Overwrites the device count without touching the slots.
    pub fn raw_device_count(mut self, count: u64) -> Self {
        self.put(DEVICE_NUM_OFFSET, &count.to_ne_bytes());
        self
    }

    /// Overwrites the process count without touching the table.
    pub fn raw_process_count(mut self, count: i32) -> Self {
        self.put(PROC_NUM_OFFSET, &count.to_ne_bytes());
        self
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> io::Result<()> {
        std::fs::write(path, &self.bytes)
    }
}
