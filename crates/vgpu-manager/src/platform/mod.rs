pub mod k8s;
pub mod mig_parted;
pub mod nvml;
