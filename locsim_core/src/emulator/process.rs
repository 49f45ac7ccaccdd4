use std::collections::HashMap;

use sysinfo::{ProcessRefreshKind, RefreshKind, System};

use locsim_common::config::EmulatorSettings;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub bundle_id: Option<String>,
}

pub trait ProcessSource: Send + Sync {
    fn running(&self) -> Vec<ProcessInfo>;
}

/// Enumerates processes with `sysinfo`. Executables listed in the settings are
/// reported with the configured emulator bundle id.
pub struct SysinfoProcesses {
    bundles: HashMap<String, String>,
}

impl SysinfoProcesses {
    pub fn new(bundles: HashMap<String, String>) -> Self {
        Self { bundles }
    }

    pub fn from_settings(settings: &EmulatorSettings) -> Self {
        Self::new(
            settings
                .process_names
                .iter()
                .map(|name| (name.clone(), settings.bundle_id.clone()))
                .collect(),
        )
    }
}

impl ProcessSource for SysinfoProcesses {
    fn running(&self) -> Vec<ProcessInfo> {
        let system = System::new_with_specifics(
            RefreshKind::new().with_processes(ProcessRefreshKind::new()),
        );
        system
            .processes()
            .iter()
            .map(|(pid, process)| {
                let name = process.name().to_string_lossy();
                ProcessInfo {
                    pid: pid.as_u32(),
                    bundle_id: self.bundles.get(name.as_ref()).cloned(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_current_process() {
        let me = std::process::id();
        let processes = SysinfoProcesses::new(HashMap::new()).running();
        let current = processes.iter().find(|p| p.pid == me).unwrap();
        assert_eq!(current.bundle_id, None);
    }
}
