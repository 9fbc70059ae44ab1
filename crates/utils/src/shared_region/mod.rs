//! Per-container shared region
//!
//! The interception library injected into every GPU container keeps its live
//! usage in a memory-mapped file with a fixed layout (see [`layout`]). The
//! node agent maps the same file and reads it through [`SharedRegion`], which
//! turns every field access into a bounds-checked copy out of the byte buffer.
//!
//! No locking happens here. The writer-side semaphore in the header belongs to
//! the library; the agent only ever touches the recent-kernel counter and the
//! utilization switch, and tolerates a zeroed or stale region on any read.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use memmap2::MmapMut;
use memmap2::MmapOptions;
use thiserror::Error;

mod feedback_adapter;
#[cfg(any(test, feature = "fixtures"))]
mod fixtures;
pub mod layout;

#[cfg(any(test, feature = "fixtures"))]
pub use fixtures::RegionImage;

use layout::*;

#[derive(Error, Debug)]
pub enum RegionError {
    #[error("shared region `{}` does not exist", .path.display())]
    NotFound { path: PathBuf },

    #[error("failed to map shared region `{}`: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("shared region is {len} bytes, expected at least {expected}")]
    Truncated { len: u64, expected: usize },

    #[error("shared region layout violated: {0}")]
    LayoutViolation(String),

    #[error("{field} index {index} exceeds capacity {capacity}")]
    IndexOutOfBounds {
        field: &'static str,
        index: usize,
        capacity: usize,
    },
}

/// Memory accounting of one process on one device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceMemory {
    pub context_size: u64,
    pub module_size: u64,
    pub buffer_size: u64,
    pub offset: u64,
    pub total: u64,
}

/// One entry of the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSlot {
    pub pid: i32,
    pub host_pid: i32,
    pub memory: [DeviceMemory; MAX_DEVICES],
    pub monitor_used: [u64; MAX_DEVICES],
    pub status: i32,
}

/// Accessor over a shared region buffer.
///
/// Production code maps the file with [`SharedRegion::open`]; any byte
/// buffer of at least [`layout::REGION_SIZE`] bytes works as well.
#[derive(Debug)]
pub struct SharedRegion<B = MmapMut> {
    name: String,
    buf: B,
}

impl SharedRegion<MmapMut> {
    /// Maps the region file at `path` read-write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RegionError> {
        let path = path.as_ref();
        let io_err = |source: io::Error| RegionError::Io {
            path: path.to_path_buf(),
            source,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| match source.kind() {
                io::ErrorKind::NotFound => RegionError::NotFound {
                    path: path.to_path_buf(),
                },
                _ => io_err(source),
            })?;

        let len = file.metadata().map_err(io_err)?.len();
        if len < REGION_SIZE as u64 {
            return Err(RegionError::Truncated {
                len,
                expected: REGION_SIZE,
            });
        }

        // SAFETY: the mapping is shared with the interception library, which
        // may write at any time. No reference into the mapping is handed out;
        // every access copies a fixed-size field within REGION_SIZE.
        let map = unsafe { MmapOptions::new().len(REGION_SIZE).map_mut(&file) }.map_err(io_err)?;

        Self::with_name(path.display().to_string(), map)
    }
}

impl<B: AsRef<[u8]>> SharedRegion<B> {
    /// Wraps an in-memory buffer.
    pub fn from_buffer(buf: B) -> Result<Self, RegionError> {
        Self::with_name("<memory>".to_string(), buf)
    }

    fn with_name(name: String, buf: B) -> Result<Self, RegionError> {
        let len = buf.as_ref().len();
        if len < REGION_SIZE {
            return Err(RegionError::Truncated {
                len: len as u64,
                expected: REGION_SIZE,
            });
        }
        let region = Self { name, buf };
        region.validate()?;
        Ok(region)
    }

    /// Checks the header counters against the fixed capacities.
    pub fn validate(&self) -> Result<(), RegionError> {
        self.device_count()?;
        self.process_count()?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn bytes<const N: usize>(&self, offset: usize) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf.as_ref()[offset..offset + N]);
        out
    }

    fn read_i32(&self, offset: usize) -> i32 {
        i32::from_ne_bytes(self.bytes(offset))
    }

    fn read_u32(&self, offset: usize) -> u32 {
        u32::from_ne_bytes(self.bytes(offset))
    }

    fn read_u64(&self, offset: usize) -> u64 {
        u64::from_ne_bytes(self.bytes(offset))
    }

    pub fn is_initialized(&self) -> bool {
        self.read_i32(INITIALIZED_FLAG_OFFSET) != 0
    }

    pub fn sm_initialized(&self) -> bool {
        self.read_i32(SM_INIT_FLAG_OFFSET) != 0
    }

    pub fn owner_pid(&self) -> u32 {
        self.read_u32(OWNER_PID_OFFSET)
    }

    /// Number of devices granted to the container.
    pub fn device_count(&self) -> Result<usize, RegionError> {
        let num = self.read_u64(DEVICE_NUM_OFFSET);
        usize::try_from(num)
            .ok()
            .filter(|&n| n <= MAX_DEVICES)
            .ok_or_else(|| {
                RegionError::LayoutViolation(format!(
                    "device count {num} exceeds {MAX_DEVICES} slots"
                ))
            })
    }

    fn check_device(index: usize) -> Result<(), RegionError> {
        if index >= MAX_DEVICES {
            return Err(RegionError::IndexOutOfBounds {
                field: "device",
                index,
                capacity: MAX_DEVICES,
            });
        }
        Ok(())
    }

    /// UUID stored in device slot `index`, `None` for a zero-filled slot.
    pub fn device_uuid(&self, index: usize) -> Result<Option<String>, RegionError> {
        Self::check_device(index)?;
        let raw: [u8; UUID_LEN] = self.bytes(UUIDS_OFFSET + index * UUID_LEN);
        if raw[0] == 0 {
            return Ok(None);
        }
        let end = raw.iter().position(|&b| b == 0).unwrap_or(UUID_LEN);
        Ok(Some(String::from_utf8_lossy(&raw[..end]).into_owned()))
    }

    /// UUIDs of all occupied device slots, in slot order.
    pub fn device_uuids(&self) -> Vec<String> {
        (0..MAX_DEVICES)
            .filter_map(|idx| self.device_uuid(idx).ok().flatten())
            .collect()
    }

    /// Memory quota of device slot `index` in bytes.
    pub fn memory_limit(&self, index: usize) -> Result<u64, RegionError> {
        Self::check_device(index)?;
        Ok(self.read_u64(MEMORY_LIMIT_OFFSET + index * 8))
    }

    /// Core quota of device slot `index` in percent.
    pub fn core_limit(&self, index: usize) -> Result<u64, RegionError> {
        Self::check_device(index)?;
        Ok(self.read_u64(CORE_LIMIT_OFFSET + index * 8))
    }

    /// Number of occupied process slots.
    pub fn process_count(&self) -> Result<usize, RegionError> {
        let num = self.read_i32(PROC_NUM_OFFSET);
        usize::try_from(num)
            .ok()
            .filter(|&n| n <= MAX_PROCESSES)
            .ok_or_else(|| {
                RegionError::LayoutViolation(format!(
                    "process count {num} outside 0..={MAX_PROCESSES}"
                ))
            })
    }

    pub fn process(&self, index: usize) -> Result<ProcessSlot, RegionError> {
        if index >= MAX_PROCESSES {
            return Err(RegionError::IndexOutOfBounds {
                field: "process",
                index,
                capacity: MAX_PROCESSES,
            });
        }
        let base = PROCS_OFFSET + index * PROC_SLOT_SIZE;

        let mut memory = [DeviceMemory::default(); MAX_DEVICES];
        for (dev, slot) in memory.iter_mut().enumerate() {
            let at = base + PROC_USED_OFFSET + dev * DEVICE_MEMORY_SIZE;
            *slot = DeviceMemory {
                context_size: self.read_u64(at),
                module_size: self.read_u64(at + 8),
                buffer_size: self.read_u64(at + 16),
                offset: self.read_u64(at + 24),
                total: self.read_u64(at + 32),
            };
        }

        let mut monitor_used = [0u64; MAX_DEVICES];
        for (dev, used) in monitor_used.iter_mut().enumerate() {
            *used = self.read_u64(base + PROC_MONITOR_USED_OFFSET + dev * 8);
        }

        Ok(ProcessSlot {
            pid: self.read_i32(base + PROC_PID_OFFSET),
            host_pid: self.read_i32(base + PROC_HOST_PID_OFFSET),
            memory,
            monitor_used,
            status: self.read_i32(base + PROC_STATUS_OFFSET),
        })
    }

    /// The occupied prefix of the process table.
    pub fn processes(&self) -> Result<Vec<ProcessSlot>, RegionError> {
        (0..self.process_count()?).map(|idx| self.process(idx)).collect()
    }

    pub fn utilization_switch(&self) -> i32 {
        self.read_i32(UTILIZATION_SWITCH_OFFSET)
    }

    pub fn recent_kernel(&self) -> i32 {
        self.read_i32(RECENT_KERNEL_OFFSET)
    }

    pub fn priority(&self) -> i32 {
        self.read_i32(PRIORITY_OFFSET)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> SharedRegion<B> {
    fn write_i32(&mut self, offset: usize, value: i32) {
        self.buf.as_mut()[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
    }

    pub fn set_recent_kernel(&mut self, value: i32) {
        self.write_i32(RECENT_KERNEL_OFFSET, value);
    }

    pub fn set_utilization_switch(&mut self, value: i32) {
        self.write_i32(UTILIZATION_SWITCH_OFFSET, value);
    }
}
