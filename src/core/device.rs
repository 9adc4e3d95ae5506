//! Device: an addressable GPU, identified by a stable string id (`gpu_0`, …).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub total_vram_bytes: u64,
    pub available_vram_bytes: u64,
    pub available: bool,
}

impl Device {
    pub fn new(id: impl Into<String>, name: impl Into<String>, total_vram_bytes: u64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            total_vram_bytes,
            available_vram_bytes: total_vram_bytes,
            available: true,
        }
    }
}

/// Discovers the set of addressable devices at process start.
///
/// Enumeration happens once at startup and may be refreshed on demand;
/// per spec §4.1, a failure here is the one fatal condition in an
/// otherwise best-effort pool.
#[async_trait::async_trait]
pub trait DeviceDiscovery: Send + Sync {
    async fn discover(&self) -> crate::Result<Vec<Device>>;
}

/// Shells out to `nvidia-smi`, following the same best-effort,
/// graceful-degradation shape as GPU vendor probing elsewhere in this
/// codebase: a missing tool or a non-zero exit yields an empty list, never
/// an error — only a discovery mechanism that is itself misconfigured
/// (e.g. a required device manifest that can't be read) is fatal.
pub struct NvidiaSmiDiscovery;

#[async_trait::async_trait]
impl DeviceDiscovery for NvidiaSmiDiscovery {
    async fn discover(&self) -> crate::Result<Vec<Device>> {
        let output = tokio::process::Command::new("nvidia-smi")
            .args([
                "--query-gpu=index,name,memory.total,memory.free",
                "--format=csv,noheader,nounits",
            ])
            .output()
            .await;

        let output = match output {
            Ok(out) if out.status.success() => out,
            Ok(_) => {
                tracing::debug!("nvidia-smi exited non-zero; assuming no GPUs present");
                return Ok(Vec::new());
            }
            Err(e) => {
                tracing::debug!("nvidia-smi not found: {e}");
                return Ok(Vec::new());
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut devices = Vec::new();
        for line in stdout.lines() {
            let fields: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
            if fields.len() < 4 {
                continue;
            }
            let index: u32 = fields[0].parse().unwrap_or(0);
            let name = fields[1].to_string();
            let total_mb: u64 = fields[2].parse().unwrap_or(0);
            let free_mb: u64 = fields[3].parse().unwrap_or(0);

            devices.push(Device {
                id: format!("gpu_{index}"),
                name,
                total_vram_bytes: total_mb * 1024 * 1024,
                available_vram_bytes: free_mb * 1024 * 1024,
                available: true,
            });
        }
        Ok(devices)
    }
}

/// A fixed, caller-supplied device list — used in tests and for
/// environments where GPUs are declared rather than probed.
pub struct StaticDeviceDiscovery {
    devices: Vec<Device>,
}

impl StaticDeviceDiscovery {
    pub fn new(devices: Vec<Device>) -> Self {
        Self { devices }
    }
}

#[async_trait::async_trait]
impl DeviceDiscovery for StaticDeviceDiscovery {
    async fn discover(&self) -> crate::Result<Vec<Device>> {
        Ok(self.devices.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_discovery_returns_configured_devices() {
        let discovery = StaticDeviceDiscovery::new(vec![
            Device::new("gpu_0", "Test GPU 0", 12 * 1024 * 1024 * 1024),
            Device::new("gpu_1", "Test GPU 1", 8 * 1024 * 1024 * 1024),
        ]);
        let devices = discovery.discover().await.unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].id, "gpu_0");
    }
}
