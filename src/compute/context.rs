//! Compute context: devices, queues, build options and the kernel cache

use std::fs;
use std::path::{Path, PathBuf};

use super::backend::ComputeBackend;
use super::device::{fastest, DeviceInfo, DeviceKind, DeviceSelector, Vendor};
use super::error::{ApiErrorCode, ComputeError, ComputeResult};
use super::kernel::KernelSource;
use crate::core::ComputeConfig;

/// Owns the device list, one command queue per device and the kernel cache directory.
pub struct ComputeContext<B: ComputeBackend> {
    backend: B,
    devices: Vec<DeviceInfo>,
    fastest_gpu: Option<usize>,
    fastest_cpu: Option<usize>,
    active: usize,
    kernel_path: PathBuf,
    cache_path: PathBuf,
    build_options: String,
}

impl<B: ComputeBackend> ComputeContext<B> {
    /// Enumerate devices, pick the fastest CPU/GPU, open queues and select the
    /// configured active device.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::DeviceEnumeration`] if no devices are found.
    pub fn initialize(mut backend: B, config: &ComputeConfig) -> ComputeResult<Self> {
        let devices =
            backend.enumerate_devices(config.use_platform_devices, config.platform_index)?;
        if devices.is_empty() {
            return Err(ComputeError::DeviceEnumeration(
                "no compute devices found".to_string(),
            ));
        }

        let fastest_gpu = fastest(&devices, DeviceKind::Gpu);
        let fastest_cpu = fastest(&devices, DeviceKind::Cpu);

        for (idx, dev) in devices.iter().enumerate() {
            log::info!(
                "compute device #{idx}: {} ({}, {:?}, {} units @ {} MHz, {} MiB)",
                dev.name,
                dev.vendor,
                dev.kind,
                dev.units,
                dev.clock,
                dev.memory_size / (1024 * 1024)
            );
        }
        match fastest_gpu {
            Some(idx) => log::info!("fastest GPU device: #{idx} {}", devices[idx].name),
            None => log::debug!("no GPU compute device available"),
        }
        match fastest_cpu {
            Some(idx) => log::info!("fastest CPU device: #{idx} {}", devices[idx].name),
            None => log::debug!("no CPU compute device available"),
        }

        let queues: Vec<usize> = (0..devices.len()).collect();
        backend.open_queues(&queues)?;

        let mut context = Self {
            backend,
            devices,
            fastest_gpu,
            fastest_cpu,
            active: 0,
            kernel_path: config.kernel_path.clone(),
            cache_path: config.cache_path.clone(),
            build_options: config.build_options.clone(),
        };

        if config.clear_cache {
            context.clear_cache();
        }

        if !context.select_active_device(config.device) {
            let fallback = context.fastest_gpu.or(context.fastest_cpu).unwrap_or(0);
            log::warn!(
                "requested device {:?} is unavailable, using #{fallback} {}",
                config.device,
                context.devices[fallback].name
            );
            context.active = fallback;
        }

        Ok(context)
    }

    /// Make the device matching `selector` active.
    ///
    /// Existing memory objects and kernels stay on the device that created them.
    /// Returns false if no device matches.
    pub fn select_active_device(&mut self, selector: DeviceSelector) -> bool {
        let found = match selector {
            DeviceSelector::FastestGpu => self.fastest_gpu,
            DeviceSelector::FastestCpu => self.fastest_cpu,
            DeviceSelector::Vendor(vendor) => self.devices.iter().position(|d| d.vendor == vendor),
            DeviceSelector::Ordinal(idx) => (idx < self.devices.len()).then_some(idx),
        };

        match found {
            Some(idx) => {
                self.active = idx;
                log::info!("active compute device: #{idx} {}", self.devices[idx].name);
                true
            }
            None => false,
        }
    }

    /// Submit pending commands of the active device without blocking.
    pub fn flush(&mut self) -> bool {
        let device = self.active;
        self.flush_device(device)
    }

    /// Block until every command on the active device's queue has completed.
    pub fn finish(&mut self) -> bool {
        let device = self.active;
        self.finish_device(device)
    }

    pub(crate) fn flush_device(&mut self, device: usize) -> bool {
        match self.backend.flush(device) {
            Ok(()) => true,
            Err(err) => {
                log::error!("flush of device #{device} failed: {err}");
                false
            }
        }
    }

    pub(crate) fn finish_device(&mut self, device: usize) -> bool {
        match self.backend.finish(device) {
            Ok(()) => true,
            Err(err) => {
                log::error!("finish of device #{device} failed: {err}");
                false
            }
        }
    }

    /// Block until every device queue is idle.
    pub fn finish_all(&mut self) -> bool {
        (0..self.devices.len()).fold(true, |ok, device| self.finish_device(device) && ok)
    }

    #[must_use]
    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    #[must_use]
    pub fn active_device(&self) -> usize {
        self.active
    }

    #[must_use]
    pub fn active_device_info(&self) -> &DeviceInfo {
        &self.devices[self.active]
    }

    pub(crate) fn device_info(&self, device: usize) -> Option<&DeviceInfo> {
        self.devices.get(device)
    }

    #[must_use]
    pub fn fastest_gpu(&self) -> Option<&DeviceInfo> {
        self.fastest_gpu.map(|idx| &self.devices[idx])
    }

    #[must_use]
    pub fn fastest_cpu(&self) -> Option<&DeviceInfo> {
        self.fastest_cpu.map(|idx| &self.devices[idx])
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    #[must_use]
    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    /// Full build options for a kernel on `device`: global options, the vendor
    /// addendum, then the kernel's own options.
    #[must_use]
    pub fn build_options(&self, device: usize, extra: &str) -> String {
        let mut options = Vec::new();
        if !self.build_options.is_empty() {
            options.push(self.build_options.clone());
        }
        if let Some(dev) = self.devices.get(device) {
            options.push(format!("-D {}", dev.vendor.define()));
            if dev.kind == DeviceKind::Cpu {
                options.push("-D DEVICE_CPU".to_string());
            }
            if dev.vendor == Vendor::Nvidia {
                options.push("-D NVIDIA_WARP_SIZE=32".to_string());
            }
        }
        if !extra.is_empty() {
            options.push(extra.to_string());
        }
        options.join(" ")
    }

    /// Read the text of a kernel source.
    pub(crate) fn load_source(&self, source: &KernelSource) -> ComputeResult<String> {
        match source {
            KernelSource::Inline(text) => Ok(text.clone()),
            KernelSource::File(path) => {
                let full = if path.is_absolute() {
                    path.clone()
                } else {
                    self.kernel_path.join(path)
                };
                fs::read_to_string(&full).map_err(|e| {
                    ComputeError::api(
                        ApiErrorCode::InvalidProgram,
                        format!("failed to read kernel source {}: {e}", full.display()),
                    )
                })
            }
        }
    }

    /// Store a failed build log as `<identifier>.log` in the cache directory.
    pub(crate) fn write_build_log(&self, identifier: &str, log: &str) {
        let file_name: String = identifier
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        let path = self.cache_path.join(format!("{file_name}.log"));
        if let Err(e) = fs::create_dir_all(&self.cache_path).and_then(|()| fs::write(&path, log))
        {
            log::debug!("could not write build log {}: {e}", path.display());
        }
    }

    /// Remove every file in the cache directory.
    pub fn clear_cache(&mut self) {
        match fs::remove_dir_all(&self.cache_path) {
            Ok(()) => log::info!("cleared kernel cache {}", self.cache_path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!(
                "failed to clear kernel cache {}: {e}",
                self.cache_path.display()
            ),
        }
        if let Err(e) = fs::create_dir_all(&self.cache_path) {
            log::warn!(
                "failed to create kernel cache {}: {e}",
                self.cache_path.display()
            );
        }
    }
}

/// Translate `-D NAME[=VALUE]` build options into WGSL constant declarations.
///
/// Options without a value define `NAME` as `1`. Anything else is ignored.
#[must_use]
pub fn options_prelude(options: &str) -> String {
    let mut prelude = String::new();
    let mut tokens = options.split_whitespace();
    while let Some(token) = tokens.next() {
        let define = if token == "-D" {
            tokens.next()
        } else {
            token.strip_prefix("-D")
        };
        let Some(define) = define.filter(|d| !d.is_empty()) else {
            log::debug!("ignoring build option \"{token}\"");
            continue;
        };

        let (name, value) = define.split_once('=').unwrap_or((define, "1"));
        let valid = name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            log::debug!("ignoring malformed define \"{define}\"");
            continue;
        }
        prelude.push_str(&format!("const {name} = {value};\n"));
    }
    prelude
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::device::test_device;
    use crate::compute::headless::HeadlessCompute;

    fn config() -> ComputeConfig {
        ComputeConfig {
            cache_path: std::env::temp_dir().join("lumen-context-tests"),
            ..ComputeConfig::default()
        }
    }

    #[test]
    fn test_initialize_picks_fastest_classes() {
        let backend = HeadlessCompute::new(vec![
            test_device("cpu", DeviceKind::Cpu, 8, 3000),
            test_device("NVIDIA small", DeviceKind::Gpu, 10, 1000),
            test_device("AMD big", DeviceKind::Gpu, 40, 1200),
        ]);
        let ctx = ComputeContext::initialize(backend, &config()).unwrap();

        assert_eq!(ctx.fastest_gpu().unwrap().name, "AMD big");
        assert_eq!(ctx.fastest_cpu().unwrap().name, "cpu");
        assert_eq!(ctx.active_device(), 2);
    }

    #[test]
    fn test_missing_gpu_falls_back_to_cpu() {
        let backend = HeadlessCompute::new(vec![test_device("cpu", DeviceKind::Cpu, 4, 2000)]);
        let mut ctx = ComputeContext::initialize(backend, &config()).unwrap();

        assert!(ctx.fastest_gpu().is_none());
        assert_eq!(ctx.active_device(), 0);
        assert!(!ctx.select_active_device(DeviceSelector::Ordinal(3)));
        assert!(ctx.select_active_device(DeviceSelector::FastestCpu));
    }

    #[test]
    fn test_no_devices_fails() {
        let result = ComputeContext::initialize(HeadlessCompute::new(Vec::new()), &config());
        assert!(matches!(result, Err(ComputeError::DeviceEnumeration(_))));
    }

    #[test]
    fn test_vendor_addendum_in_build_options() {
        let backend = HeadlessCompute::new(vec![test_device("NVIDIA", DeviceKind::Gpu, 1, 1)]);
        let mut cfg = config();
        cfg.build_options = "-D GLOBAL".to_string();
        let ctx = ComputeContext::initialize(backend, &cfg).unwrap();

        let options = ctx.build_options(0, "-D LOCAL=4");
        assert_eq!(
            options,
            "-D GLOBAL -D VENDOR_NVIDIA -D NVIDIA_WARP_SIZE=32 -D LOCAL=4"
        );
    }

    #[test]
    fn test_options_prelude() {
        let prelude = options_prelude("-D A -DB=2 -cl-fast-relaxed-math -D 9bad -D C=3.5");
        assert_eq!(prelude, "const A = 1;\nconst B = 2;\nconst C = 3.5;\n");
    }
}
