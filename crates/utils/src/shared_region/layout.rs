//! Byte offsets of the per-container shared region.
//!
//! The interception library writes this segment as a C struct with natural
//! alignment and native endianness. Every offset below is part of that binary
//! contract; changing one requires rebuilding the library.

/// Device slots per region.
pub const MAX_DEVICES: usize = 16;
/// Process slots per region.
pub const MAX_PROCESSES: usize = 1024;
/// Bytes reserved for each device UUID (NUL padded).
pub const UUID_LEN: usize = 96;
/// Bytes of the writer-side semaphore.
pub const SEM_LEN: usize = 32;

pub const INITIALIZED_FLAG_OFFSET: usize = 0;
pub const SM_INIT_FLAG_OFFSET: usize = 4;
pub const OWNER_PID_OFFSET: usize = 8;
pub const SEM_OFFSET: usize = 12;
pub const DEVICE_NUM_OFFSET: usize = 48;
pub const UUIDS_OFFSET: usize = 56;
pub const MEMORY_LIMIT_OFFSET: usize = UUIDS_OFFSET + MAX_DEVICES * UUID_LEN;
pub const CORE_LIMIT_OFFSET: usize = MEMORY_LIMIT_OFFSET + MAX_DEVICES * 8;
pub const PROCS_OFFSET: usize = CORE_LIMIT_OFFSET + MAX_DEVICES * 8;

/// `{context, module, buffer, offset, total}` as five u64 values.
pub const DEVICE_MEMORY_SIZE: usize = 5 * 8;

pub const PROC_PID_OFFSET: usize = 0;
pub const PROC_HOST_PID_OFFSET: usize = 4;
pub const PROC_USED_OFFSET: usize = 8;
pub const PROC_MONITOR_USED_OFFSET: usize = PROC_USED_OFFSET + MAX_DEVICES * DEVICE_MEMORY_SIZE;
pub const PROC_STATUS_OFFSET: usize = PROC_MONITOR_USED_OFFSET + MAX_DEVICES * 8;
/// Slot size including the trailing padding to 8-byte alignment.
pub const PROC_SLOT_SIZE: usize = 784;

pub const PROC_NUM_OFFSET: usize = PROCS_OFFSET + MAX_PROCESSES * PROC_SLOT_SIZE;
pub const UTILIZATION_SWITCH_OFFSET: usize = PROC_NUM_OFFSET + 4;
pub const RECENT_KERNEL_OFFSET: usize = PROC_NUM_OFFSET + 8;
pub const PRIORITY_OFFSET: usize = PROC_NUM_OFFSET + 12;

/// Total size of the mapped segment.
pub const REGION_SIZE: usize = PROC_NUM_OFFSET + 16;

const _: () = assert!(SEM_OFFSET + SEM_LEN <= DEVICE_NUM_OFFSET);
const _: () = assert!(MEMORY_LIMIT_OFFSET == 1592);
const _: () = assert!(PROCS_OFFSET == 1848);
const _: () = assert!(PROC_STATUS_OFFSET + 4 <= PROC_SLOT_SIZE);
const _: () = assert!(PROC_SLOT_SIZE % 8 == 0);
const _: () = assert!(REGION_SIZE == 804_680);
