//! Node status probe

use sysinfo::{Disks, System};

use crate::api::NodeStatus;

/// Sample cpu/mem/disk utilization and uptime for status reports.
/// Best-effort: a probe that cannot read a value reports zero for it.
pub fn probe() -> NodeStatus {
    let mut sys = System::new_all();
    sys.refresh_all();

    let cpu = sys.global_cpu_usage() as f64;
    let mem = if sys.total_memory() > 0 {
        sys.used_memory() as f64 / sys.total_memory() as f64 * 100.0
    } else {
        0.0
    };

    let disks = Disks::new_with_refreshed_list();
    let (total, available) = disks
        .iter()
        .fold((0u64, 0u64), |(t, a), d| {
            (t + d.total_space(), a + d.available_space())
        });
    let disk = if total > 0 {
        (total - available) as f64 / total as f64 * 100.0
    } else {
        0.0
    };

    NodeStatus {
        cpu,
        mem,
        disk,
        uptime: System::uptime(),
    }
}
