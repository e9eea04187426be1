use guestlink_protocol::{
    DiskInfo, ErrorCode, ErrorResponse, HardwareInfoResponse, NicInfo, Payload, SoftwareListRequest,
    SoftwareListResponse, SoftwarePackage,
};
use sysinfo::{Disks, Networks, System};

use super::{HandlerContext, HandlerResult};

pub async fn hardware(_ctx: &HandlerContext) -> HandlerResult {
    let info = tokio::task::spawn_blocking(collect_hardware)
        .await
        .map_err(|e| ErrorResponse::new(ErrorCode::InventoryFailed, e.to_string()))?;
    Ok(Payload::Hardware(info))
}

fn collect_hardware() -> HardwareInfoResponse {
    let mut sys = System::new();
    sys.refresh_cpu();
    sys.refresh_memory();

    let disks = Disks::new_with_refreshed_list()
        .list()
        .iter()
        .map(|d| DiskInfo {
            name: d.name().to_string_lossy().into_owned(),
            mount_point: d.mount_point().to_string_lossy().into_owned(),
            file_system: d.file_system().to_string_lossy().into_owned(),
            total_bytes: d.total_space(),
            available_bytes: d.available_space(),
            removable: d.is_removable(),
        })
        .collect();

    let mut network_interfaces: Vec<NicInfo> = Networks::new_with_refreshed_list()
        .iter()
        .map(|(name, data)| NicInfo {
            name: name.clone(),
            mac_address: data.mac_address().to_string(),
        })
        .collect();
    network_interfaces.sort_by(|a, b| a.name.cmp(&b.name));

    HardwareInfoResponse {
        hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
        os_name: System::name().unwrap_or_else(|| "unknown".to_string()),
        os_version: System::os_version().unwrap_or_else(|| "unknown".to_string()),
        kernel_version: System::kernel_version().unwrap_or_else(|| "unknown".to_string()),
        arch: std::env::consts::ARCH.to_string(),
        cpu_model: sys
            .cpus()
            .first()
            .map(|c| c.brand().trim().to_string())
            .unwrap_or_default(),
        cpu_count: sys.cpus().len(),
        physical_cores: sys.physical_core_count(),
        total_memory_bytes: sys.total_memory(),
        total_swap_bytes: sys.total_swap(),
        disks,
        network_interfaces,
    }
}

pub async fn software(ctx: &HandlerContext, req: SoftwareListRequest) -> HandlerResult {
    let mut packages = ctx.platform.installed_packages().await?;
    if let Some(filter) = req.name_filter {
        let filter = filter.to_lowercase();
        packages.retain(|p| p.name.to_lowercase().contains(&filter));
    }
    packages.sort_by(|a, b| a.name.cmp(&b.name));
    let total = packages.len();
    if let Some(limit) = req.limit {
        packages.truncate(limit as usize);
    }
    Ok(Payload::Software(SoftwareListResponse { packages, total }))
}

/// Parse tab-separated `name\tversion` lines as emitted by the
/// `dpkg-query` and `rpm` format strings the platform uses.
pub fn parse_package_lines(output: &str, source: &str) -> Vec<SoftwarePackage> {
    output
        .lines()
        .filter_map(|line| {
            let (name, version) = line.split_once('\t')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some(SoftwarePackage {
                name: name.to_string(),
                version: version.trim().to_string(),
                source: source.to_string(),
            })
        })
        .collect()
}
