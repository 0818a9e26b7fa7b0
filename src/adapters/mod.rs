use std::sync::Arc;

use crate::core::enumerator::VolumeProvider;
use crate::core::wiper::Formatter;

mod command_table;
mod format;
mod simulated;
mod sysinfo_disks;

pub use command_table::{CommandTableProvider, TableFormat, parse_table};
pub use format::{SystemFormatter, device_for_mount_point};
pub use simulated::{SimulatedFormatter, SimulatedProvider, Simulator};
pub use sysinfo_disks::SysinfoProvider;

/// Volume providers in the order they should be tried, and the formatter.
pub struct Adapters {
    pub providers: Vec<Box<dyn VolumeProvider>>,
    pub formatter: Arc<dyn Formatter>,
}

pub fn get_adapters(simulation: bool) -> Adapters {
    if simulation {
        let (provider, controller) = SimulatedProvider::new();

        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lines().map_while(Result::ok) {
                let parts: Vec<&str> = line.split_whitespace().collect();
                match parts.first().copied() {
                    Some("add") => {
                        let Some(path) = parts.get(1) else {
                            println!("(Simulator) Use: 'add <dir> [size_gb]'");
                            continue;
                        };
                        let size_gb = parts.get(2).and_then(|s| s.parse().ok()).unwrap_or(2.0);
                        controller.add_volume(path, size_gb);
                    }
                    Some("rm") => {
                        if let Some(path) = parts.get(1) {
                            controller.remove_volume(path);
                        }
                    }
                    _ => println!("(Simulator) Use: 'add <dir> [size_gb]' or 'rm <dir>'"),
                }
            }
        });

        return Adapters {
            providers: vec![Box::new(provider)],
            formatter: Arc::new(SimulatedFormatter::default()),
        };
    }

    let mut providers: Vec<Box<dyn VolumeProvider>> = vec![Box::new(SysinfoProvider)];
    if let Some(fallback) = CommandTableProvider::for_platform() {
        providers.push(Box::new(fallback));
    }

    Adapters {
        providers,
        formatter: Arc::new(SystemFormatter),
    }
}
