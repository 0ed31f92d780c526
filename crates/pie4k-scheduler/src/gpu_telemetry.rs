//! GPU telemetry providers (§4.A). Each variant is dynamically loaded so
//! a missing vendor library is a skip, not an error; the factory tries
//! them in the original system's order: NVML, AMD sysfs, Intel Level
//! Zero, Windows DXGI.

use tracing::{debug, warn};

/// `(gpu_util_percent, total_vram_bytes, used_vram_bytes)`.
pub type GpuSample = (f64, u64, u64);

pub trait GpuTelemetryProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn initialize(&mut self) -> bool;
    fn is_available(&self) -> bool;
    fn query(&self) -> Option<GpuSample>;
}

#[repr(C)]
#[derive(Default)]
struct NvmlMemory {
    total: u64,
    free: u64,
    used: u64,
}

#[repr(C)]
#[derive(Default)]
struct NvmlUtilization {
    gpu: u32,
    memory: u32,
}

type NvmlInitFn = unsafe extern "C" fn() -> i32;
type NvmlDeviceGetHandleByIndexFn = unsafe extern "C" fn(u32, *mut *mut std::ffi::c_void) -> i32;
type NvmlDeviceGetUtilizationRatesFn = unsafe extern "C" fn(*mut std::ffi::c_void, *mut NvmlUtilization) -> i32;
type NvmlDeviceGetMemoryInfoFn = unsafe extern "C" fn(*mut std::ffi::c_void, *mut NvmlMemory) -> i32;

/// NVIDIA, via `libnvidia-ml.so` / `nvml.dll` loaded at runtime.
pub struct NvmlProvider {
    lib: Option<libloading::Library>,
}

impl NvmlProvider {
    pub fn new() -> Self {
        NvmlProvider { lib: None }
    }

    #[cfg(unix)]
    const LIB_NAMES: &'static [&'static str] = &["libnvidia-ml.so.1", "libnvidia-ml.so"];
    #[cfg(windows)]
    const LIB_NAMES: &'static [&'static str] = &["nvml.dll"];
}

impl Default for NvmlProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuTelemetryProvider for NvmlProvider {
    fn name(&self) -> &'static str {
        "nvml"
    }

    fn initialize(&mut self) -> bool {
        for candidate in Self::LIB_NAMES {
            match unsafe { libloading::Library::new(candidate) } {
                Ok(lib) => {
                    debug!(library = candidate, "loaded NVML");
                    self.lib = Some(lib);
                    return true;
                }
                Err(e) => debug!(library = candidate, "NVML load failed: {e}"),
            }
        }
        false
    }

    fn is_available(&self) -> bool {
        self.lib.is_some()
    }

    fn query(&self) -> Option<GpuSample> {
        let lib = self.lib.as_ref()?;
        unsafe {
            let init: libloading::Symbol<NvmlInitFn> = lib.get(b"nvmlInit_v2\0").ok()?;
            let get_handle: libloading::Symbol<NvmlDeviceGetHandleByIndexFn> =
                lib.get(b"nvmlDeviceGetHandleByIndex_v2\0").ok()?;
            let get_util: libloading::Symbol<NvmlDeviceGetUtilizationRatesFn> =
                lib.get(b"nvmlDeviceGetUtilizationRates\0").ok()?;
            let get_mem: libloading::Symbol<NvmlDeviceGetMemoryInfoFn> =
                lib.get(b"nvmlDeviceGetMemoryInfo\0").ok()?;

            if init() != 0 {
                return None;
            }
            let mut device: *mut std::ffi::c_void = std::ptr::null_mut();
            if get_handle(0, &mut device) != 0 {
                return None;
            }
            let mut util = NvmlUtilization::default();
            if get_util(device, &mut util) != 0 {
                return None;
            }
            let mut mem = NvmlMemory::default();
            if get_mem(device, &mut mem) != 0 {
                return None;
            }
            Some((util.gpu as f64, mem.total, mem.used))
        }
    }
}

/// AMD, via sysfs `mem_info_vram_total`/`mem_info_vram_used` (§4.A).
pub struct AmdSysfsProvider {
    card_path: Option<std::path::PathBuf>,
}

impl AmdSysfsProvider {
    pub fn new() -> Self {
        AmdSysfsProvider { card_path: None }
    }

    fn find_card() -> Option<std::path::PathBuf> {
        let drm = std::path::Path::new("/sys/class/drm");
        let entries = std::fs::read_dir(drm).ok()?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with("card") || name.contains('-') {
                continue;
            }
            let candidate = entry.path().join("device").join("mem_info_vram_total");
            if candidate.is_file() {
                return Some(entry.path().join("device"));
            }
        }
        None
    }

    fn read_u64(path: &std::path::Path) -> Option<u64> {
        std::fs::read_to_string(path).ok()?.trim().parse().ok()
    }
}

impl Default for AmdSysfsProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuTelemetryProvider for AmdSysfsProvider {
    fn name(&self) -> &'static str {
        "amd_sysfs"
    }

    fn initialize(&mut self) -> bool {
        self.card_path = Self::find_card();
        self.card_path.is_some()
    }

    fn is_available(&self) -> bool {
        self.card_path.is_some()
    }

    fn query(&self) -> Option<GpuSample> {
        let dir = self.card_path.as_ref()?;
        let total = Self::read_u64(&dir.join("mem_info_vram_total"))?;
        let used = Self::read_u64(&dir.join("mem_info_vram_used"))?;
        // Utilization requires privileged perf-counter access; default to
        // zero when unavailable, per §4.A.
        Some((0.0, total, used))
    }
}

#[repr(C)]
struct ZesMemState {
    stype: u32,
    p_next: *mut std::ffi::c_void,
    health: u32,
    free: u64,
    size: u64,
}

impl Default for ZesMemState {
    fn default() -> Self {
        ZesMemState { stype: 0, p_next: std::ptr::null_mut(), health: 0, free: 0, size: 0 }
    }
}

const ZES_MAX_DRIVERS: usize = 4;
const ZES_MAX_DEVICES: usize = 4;
const ZES_MAX_MEM_MODULES: usize = 8;

type ZesInitFn = unsafe extern "C" fn(u32) -> i32;
type ZesDriverGetFn = unsafe extern "C" fn(*mut u32, *mut *mut std::ffi::c_void) -> i32;
type ZesDeviceGetFn = unsafe extern "C" fn(*mut std::ffi::c_void, *mut u32, *mut *mut std::ffi::c_void) -> i32;
type ZesDeviceEnumMemoryModulesFn =
    unsafe extern "C" fn(*mut std::ffi::c_void, *mut u32, *mut *mut std::ffi::c_void) -> i32;
type ZesMemoryGetStateFn = unsafe extern "C" fn(*mut std::ffi::c_void, *mut ZesMemState) -> i32;

/// Intel, via Level Zero (`libze_loader.so` / `ze_loader.dll`).
pub struct IntelLevelZeroProvider {
    lib: Option<libloading::Library>,
}

impl IntelLevelZeroProvider {
    pub fn new() -> Self {
        IntelLevelZeroProvider { lib: None }
    }

    #[cfg(unix)]
    const LIB_NAMES: &'static [&'static str] = &["libze_loader.so.1", "libze_loader.so"];
    #[cfg(windows)]
    const LIB_NAMES: &'static [&'static str] = &["ze_loader.dll"];
}

impl Default for IntelLevelZeroProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuTelemetryProvider for IntelLevelZeroProvider {
    fn name(&self) -> &'static str {
        "intel_level_zero"
    }

    fn initialize(&mut self) -> bool {
        for candidate in Self::LIB_NAMES {
            if let Ok(lib) = unsafe { libloading::Library::new(candidate) } {
                debug!(library = candidate, "loaded Level Zero");
                self.lib = Some(lib);
                return true;
            }
        }
        false
    }

    fn is_available(&self) -> bool {
        self.lib.is_some()
    }

    fn query(&self) -> Option<GpuSample> {
        let lib = self.lib.as_ref()?;
        unsafe {
            let init: libloading::Symbol<ZesInitFn> = lib.get(b"zesInit\0").ok()?;
            let driver_get: libloading::Symbol<ZesDriverGetFn> = lib.get(b"zesDriverGet\0").ok()?;
            let device_get: libloading::Symbol<ZesDeviceGetFn> = lib.get(b"zesDeviceGet\0").ok()?;
            let enum_mem: libloading::Symbol<ZesDeviceEnumMemoryModulesFn> =
                lib.get(b"zesDeviceEnumMemoryModules\0").ok()?;
            let mem_state: libloading::Symbol<ZesMemoryGetStateFn> = lib.get(b"zesMemoryGetState\0").ok()?;

            if init(0) != 0 {
                return None;
            }

            let mut driver_count: u32 = ZES_MAX_DRIVERS as u32;
            let mut drivers = [std::ptr::null_mut::<std::ffi::c_void>(); ZES_MAX_DRIVERS];
            if driver_get(&mut driver_count, drivers.as_mut_ptr()) != 0 || driver_count == 0 {
                return None;
            }

            let mut device_count: u32 = ZES_MAX_DEVICES as u32;
            let mut devices = [std::ptr::null_mut::<std::ffi::c_void>(); ZES_MAX_DEVICES];
            if device_get(drivers[0], &mut device_count, devices.as_mut_ptr()) != 0 || device_count == 0 {
                return None;
            }

            let mut module_count: u32 = ZES_MAX_MEM_MODULES as u32;
            let mut modules = [std::ptr::null_mut::<std::ffi::c_void>(); ZES_MAX_MEM_MODULES];
            if enum_mem(devices[0], &mut module_count, modules.as_mut_ptr()) != 0 {
                return None;
            }

            let mut total = 0u64;
            let mut used = 0u64;
            for &module in modules.iter().take(module_count as usize) {
                let mut state = ZesMemState::default();
                if mem_state(module, &mut state) == 0 {
                    total += state.size;
                    used += state.size.saturating_sub(state.free);
                }
            }
            if total == 0 {
                return None;
            }
            Some((0.0, total, used))
        }
    }
}

/// Windows, via DXGI `IDXGIAdapter3::QueryVideoMemoryInfo`.
#[cfg(windows)]
pub struct WindowsDxgiProvider {
    adapter: Option<windows::Win32::Graphics::Dxgi::IDXGIAdapter3>,
}

#[cfg(windows)]
impl WindowsDxgiProvider {
    pub fn new() -> Self {
        WindowsDxgiProvider { adapter: None }
    }

    fn first_hardware_adapter() -> windows::core::Result<windows::Win32::Graphics::Dxgi::IDXGIAdapter3> {
        use windows::core::Interface;
        use windows::Win32::Graphics::Dxgi::{CreateDXGIFactory1, IDXGIFactory4};
        unsafe {
            let factory: IDXGIFactory4 = CreateDXGIFactory1()?;
            let adapter = factory.EnumAdapters1(0)?;
            adapter.cast()
        }
    }
}

#[cfg(windows)]
impl Default for WindowsDxgiProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(windows)]
impl GpuTelemetryProvider for WindowsDxgiProvider {
    fn name(&self) -> &'static str {
        "windows_dxgi"
    }

    fn initialize(&mut self) -> bool {
        match Self::first_hardware_adapter() {
            Ok(adapter) => {
                self.adapter = Some(adapter);
                true
            }
            Err(e) => {
                debug!("DXGI adapter enumeration failed: {e}");
                false
            }
        }
    }

    fn is_available(&self) -> bool {
        self.adapter.is_some()
    }

    fn query(&self) -> Option<GpuSample> {
        use windows::Win32::Graphics::Dxgi::{DXGI_MEMORY_SEGMENT_GROUP_LOCAL, DXGI_QUERY_VIDEO_MEMORY_INFO};
        let adapter = self.adapter.as_ref()?;
        let mut info = DXGI_QUERY_VIDEO_MEMORY_INFO::default();
        unsafe {
            adapter
                .QueryVideoMemoryInfo(0, DXGI_MEMORY_SEGMENT_GROUP_LOCAL, &mut info)
                .ok()?;
        }
        Some((0.0, info.Budget, info.CurrentUsage))
    }
}

/// Tries each provider in original-source order and returns the first
/// whose library loads *and* whose first query actually succeeds — a
/// vendor library merely being present on disk (no accessible device,
/// a driver mismatch) is not "available" per §4.A, so it must not win
/// the slot over a vendor that can actually answer a query.
pub fn detect_provider() -> Option<Box<dyn GpuTelemetryProvider>> {
    let mut nvml = NvmlProvider::new();
    if nvml.initialize() && nvml.query().is_some() {
        return Some(Box::new(nvml));
    }
    let mut amd = AmdSysfsProvider::new();
    if amd.initialize() && amd.query().is_some() {
        return Some(Box::new(amd));
    }
    let mut intel = IntelLevelZeroProvider::new();
    if intel.initialize() && intel.query().is_some() {
        return Some(Box::new(intel));
    }
    #[cfg(windows)]
    {
        let mut dxgi = WindowsDxgiProvider::new();
        if dxgi.initialize() && dxgi.query().is_some() {
            return Some(Box::new(dxgi));
        }
    }
    warn!("no GPU telemetry provider available; VRAM fields will read zero");
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amd_sysfs_reports_unavailable_without_a_card() {
        // On CI/sandboxes without `/sys/class/drm/cardN/device/mem_info_vram_total`
        // this must cleanly report unavailable rather than panicking.
        let mut provider = AmdSysfsProvider::new();
        let _ = provider.initialize();
        if !provider.is_available() {
            assert!(provider.query().is_none());
        }
    }
}
