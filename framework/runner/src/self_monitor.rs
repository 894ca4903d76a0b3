use graph_tunnel_core::prelude::CancelListener;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Share of the host, in percent, above which the harness warns about its own CPU usage.
const HIGH_CPU_PERCENT: f32 = 10.0;

/// Watch the harness's own CPU usage and warn when it is high enough to skew the measurements.
///
/// Never stops the sweep. Usage is sampled every [sysinfo::MINIMUM_CPU_UPDATE_INTERVAL] relative
/// to the number of cores.
pub(crate) fn start_self_monitor(cancel: CancelListener) {
    std::thread::Builder::new()
        .name("monitor".to_string())
        .spawn(move || {
            let this_process_pid = Pid::from_u32(std::process::id());
            let mut sys = System::new();

            sys.refresh_cpu_all();
            let cpu_count = sys.cpus().len().max(1);

            while !cancel.is_cancelled() {
                sys.refresh_processes_specifics(
                    ProcessesToUpdate::Some(&[this_process_pid]),
                    true,
                    ProcessRefreshKind::nothing().with_cpu(),
                );

                match sys.process(this_process_pid) {
                    Some(process) => {
                        let usage = process.cpu_usage() / cpu_count as f32;
                        if usage > HIGH_CPU_PERCENT {
                            log::warn!(
                                "High CPU usage detected. The sweep is using {usage:.2}% of the CPU, with {cpu_count} available cores"
                            );
                        }
                    }
                    None => {
                        log::debug!("Own process not visible to the self monitor, stopping it");
                        break;
                    }
                }

                if cancel.pause(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).is_err() {
                    break;
                }
            }
        })
        .expect("Failed to start monitor thread");
}
