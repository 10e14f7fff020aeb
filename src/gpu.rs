use crate::container::{ContainerRuntime, DeviceRequest};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::cmp::Ordering;
use std::sync::{Arc, RwLock};

/// One physical device as reported by the vendor tooling.
#[derive(Debug, Clone, PartialEq)]
pub struct GpuDevice {
    pub index: u32,
    pub name: String,
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
    pub utilization_percent: f64,
    pub temperature_c: f64,
    pub power_watts: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GpuInventory {
    pub available: bool,
    pub devices: Vec<GpuDevice>,
    pub driver_version: Option<String>,
    pub cuda_version: Option<String>,
}

/// Minimums a job may require from the host before being scheduled on GPUs.
#[derive(Debug, Clone, Default)]
pub struct GpuRequirement {
    pub min_cuda_version: Option<String>,
    pub min_driver_version: Option<String>,
    pub min_memory_mb: Option<u64>,
}

/// GpuProbe: the only thing the rest of the core knows about GPUs. Detection
/// of the vendor tooling stays behind this interface.
#[async_trait]
pub trait GpuProbe: Send + Sync {
    fn is_available(&self) -> bool;

    fn inventory(&self) -> GpuInventory;

    /// Device request for `count` GPUs, clamped to the detected device count.
    /// None when no GPU runtime is available or `count` is zero.
    fn device_request(&self, count: u32) -> Option<DeviceRequest>;

    /// Checks host CUDA/driver/memory against the job's minimums; the error
    /// names the first unmet requirement.
    fn check_requirement(&self, requirement: &GpuRequirement) -> Result<(), String>;

    /// Drops the cached inventory and probes the host again.
    async fn refresh(&self);
}

/// Probe backed by the nvidia container runtime and `nvidia-smi`.
pub struct NvidiaGpuProbe {
    runtime: Arc<dyn ContainerRuntime>,
    inventory: RwLock<GpuInventory>,
}

impl NvidiaGpuProbe {
    pub async fn detect(runtime: Arc<dyn ContainerRuntime>) -> Self {
        let inventory = Self::probe(runtime.as_ref()).await;
        if inventory.available {
            info!(
                "nvidia runtime detected, {} device(s), driver {:?}, cuda {:?}",
                inventory.devices.len(),
                inventory.driver_version,
                inventory.cuda_version
            );
        } else {
            info!("no nvidia container runtime detected, jobs will run on CPU");
        }

        NvidiaGpuProbe {
            runtime,
            inventory: RwLock::new(inventory),
        }
    }

    /// Four probes in order: runtime registry, default runtime name,
    /// `nvidia-ctk` on PATH, `nvidia-smi` on PATH.
    async fn probe(runtime: &dyn ContainerRuntime) -> GpuInventory {
        let runtime_present = match runtime.runtime_info().await {
            Ok(info) => {
                info.runtimes.iter().any(|name| name.contains("nvidia"))
                    || info.default_runtime.contains("nvidia")
            }
            Err(err) => {
                warn!("cannot query container runtime info: {}", err);
                false
            }
        };

        let tooling_present =
            runtime_present || binary_responds("nvidia-ctk").await || binary_responds("nvidia-smi").await;

        if !tooling_present {
            return GpuInventory::default();
        }

        let mut inventory = GpuInventory {
            available: true,
            ..Default::default()
        };

        match query_devices().await {
            Ok(devices) => inventory.devices = devices,
            Err(err) => {
                warn!("nvidia runtime present but device query failed: {}", err);
                inventory.available = false;
                return inventory;
            }
        }

        let (driver, cuda) = query_versions().await;
        inventory.driver_version = driver;
        inventory.cuda_version = cuda;
        inventory
    }
}

#[async_trait]
impl GpuProbe for NvidiaGpuProbe {
    fn is_available(&self) -> bool {
        self.inventory.read().map(|inv| inv.available).unwrap_or(false)
    }

    fn inventory(&self) -> GpuInventory {
        self.inventory.read().map(|inv| inv.clone()).unwrap_or_default()
    }

    fn device_request(&self, count: u32) -> Option<DeviceRequest> {
        let inventory = self.inventory();
        if !inventory.available || count == 0 {
            return None;
        }

        let detected = inventory.devices.len() as u32;
        let granted = if detected > 0 && count > detected {
            warn!("requested {} GPUs but only {} detected, clamping", count, detected);
            detected
        } else {
            count
        };

        Some(DeviceRequest::nvidia_gpus(granted))
    }

    fn check_requirement(&self, requirement: &GpuRequirement) -> Result<(), String> {
        let inventory = self.inventory();
        if !inventory.available {
            return Err("no GPU runtime available on this host".to_string());
        }

        if let Some(min_cuda) = &requirement.min_cuda_version {
            match &inventory.cuda_version {
                Some(cuda) if version_at_least(cuda, min_cuda) => {}
                Some(cuda) => return Err(format!("CUDA {cuda} is older than required {min_cuda}")),
                None => return Err(format!("CUDA version unknown, {min_cuda} required")),
            }
        }
        if let Some(min_driver) = &requirement.min_driver_version {
            match &inventory.driver_version {
                Some(driver) if version_at_least(driver, min_driver) => {}
                Some(driver) => return Err(format!("driver {driver} is older than required {min_driver}")),
                None => return Err(format!("driver version unknown, {min_driver} required")),
            }
        }
        if let Some(min_memory) = requirement.min_memory_mb {
            let largest = inventory.devices.iter().map(|d| d.memory_total_mb).max().unwrap_or(0);
            if largest < min_memory {
                return Err(format!("largest device has {largest} MiB, {min_memory} MiB required"));
            }
        }

        Ok(())
    }

    async fn refresh(&self) {
        let fresh = Self::probe(self.runtime.as_ref()).await;
        if let Ok(mut inventory) = self.inventory.write() {
            *inventory = fresh;
        }
    }
}

/// Fixed-inventory probe for GPU-less hosts and tests.
pub struct StaticGpuProbe {
    inventory: GpuInventory,
}

impl StaticGpuProbe {
    pub fn disabled() -> Self {
        StaticGpuProbe {
            inventory: GpuInventory::default(),
        }
    }

    pub fn with_inventory(inventory: GpuInventory) -> Self {
        StaticGpuProbe { inventory }
    }
}

#[async_trait]
impl GpuProbe for StaticGpuProbe {
    fn is_available(&self) -> bool {
        self.inventory.available
    }

    fn inventory(&self) -> GpuInventory {
        self.inventory.clone()
    }

    fn device_request(&self, count: u32) -> Option<DeviceRequest> {
        if !self.inventory.available || count == 0 {
            return None;
        }
        let detected = self.inventory.devices.len() as u32;
        let granted = if detected > 0 { std::cmp::min(count, detected) } else { count };
        Some(DeviceRequest::nvidia_gpus(granted))
    }

    fn check_requirement(&self, _requirement: &GpuRequirement) -> Result<(), String> {
        if self.inventory.available {
            Ok(())
        } else {
            Err("no GPU runtime available on this host".to_string())
        }
    }

    async fn refresh(&self) {}
}

async fn binary_responds(binary: &str) -> bool {
    tokio::process::Command::new(binary)
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

async fn query_devices() -> Result<Vec<GpuDevice>, String> {
    let output = tokio::process::Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,name,memory.total,memory.used,utilization.gpu,temperature.gpu,power.draw",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .await
        .map_err(|err| err.to_string())?;

    if !output.status.success() {
        return Err(format!("nvidia-smi exited with {:?}", output.status.code()));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().filter_map(parse_device_line).collect())
}

fn parse_device_line(line: &str) -> Option<GpuDevice> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < 7 {
        return None;
    }

    Some(GpuDevice {
        index: fields[0].parse().ok()?,
        name: fields[1].to_string(),
        memory_total_mb: fields[2].parse().ok()?,
        memory_used_mb: fields[3].parse().ok()?,
        utilization_percent: fields[4].parse().unwrap_or(0.0),
        temperature_c: fields[5].parse().unwrap_or(0.0),
        power_watts: fields[6].parse().unwrap_or(0.0),
    })
}

static CUDA_VERSION_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"CUDA Version:\s*([0-9]+(?:\.[0-9]+)*)").expect("invalid cuda version pattern"));

async fn query_versions() -> (Option<String>, Option<String>) {
    let driver = tokio::process::Command::new("nvidia-smi")
        .args(["--query-gpu=driver_version", "--format=csv,noheader"])
        .output()
        .await
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| {
            String::from_utf8_lossy(&output.stdout)
                .lines()
                .next()
                .map(|line| line.trim().to_string())
        });

    let cuda = tokio::process::Command::new("nvidia-smi")
        .output()
        .await
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| {
            CUDA_VERSION_PATTERN
                .captures(&String::from_utf8_lossy(&output.stdout))
                .map(|captures| captures[1].to_string())
        });

    (driver, cuda)
}

/// Compares dotted numeric versions; missing segments count as zero.
fn version_at_least(version: &str, minimum: &str) -> bool {
    let parse = |v: &str| -> Vec<u64> { v.split('.').filter_map(|part| part.parse().ok()).collect() };
    let version = parse(version);
    let minimum = parse(minimum);
    let len = std::cmp::max(version.len(), minimum.len());

    for i in 0..len {
        let a = version.get(i).copied().unwrap_or(0);
        let b = minimum.get(i).copied().unwrap_or(0);
        match a.cmp(&b) {
            Ordering::Greater => return true,
            Ordering::Less => return false,
            Ordering::Equal => {}
        }
    }
    true
}
