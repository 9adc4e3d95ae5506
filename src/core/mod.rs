//! Shared data-model primitives used across the four core subsystems.

pub mod cancellation;
pub mod device;

pub use cancellation::CancellationToken;
pub use device::{Device, DeviceDiscovery, NvidiaSmiDiscovery, StaticDeviceDiscovery};
