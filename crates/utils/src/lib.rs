pub mod logging;
pub mod shared_region;
pub mod version;
