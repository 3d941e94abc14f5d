//! Component energy from the powercap sysfs interface.
//!
//! Walks `/sys/class/powercap/` for `intel-rapl:<n>` package zones and
//! their subzones. Zone identity comes from the `name` file (`package-0`,
//! `core`, `uncore`, `dram`, `psys`); cumulative energy from `energy_uj`
//! in micro-joules. Readings are converted to milli-joules.
//!
//! The root path is injectable so tests run against a synthetic tree.

use std::fs;
use std::path::{Path, PathBuf};

use crate::energy::{ComponentEnergy, ComponentEnergySource, ComponentReading, PlatformReading};
use crate::error::SourceError;

const DEFAULT_ROOT: &str = "/sys/class/powercap";

#[derive(Debug)]
pub struct PowercapSource {
    root: PathBuf,
}

impl PowercapSource {
    /// Probe the powercap tree; `Unavailable` when no RAPL package zone is
    /// present (VM guests, non-Intel/AMD hosts, powercap disabled).
    pub fn probe() -> Result<Self, SourceError> {
        Self::probe_at(Path::new(DEFAULT_ROOT))
    }

    pub fn probe_at(root: &Path) -> Result<Self, SourceError> {
        let source = Self {
            root: root.to_path_buf(),
        };
        let zones = source.package_zones()?;
        if zones.is_empty() {
            return Err(SourceError::Unavailable(format!(
                "no intel-rapl package zones under {}",
                root.display()
            )));
        }
        Ok(source)
    }

    /// Top-level `intel-rapl:<n>` zones whose name parses as `package-<id>`,
    /// as `(socket_id, zone_path)` pairs.
    fn package_zones(&self) -> Result<Vec<(String, PathBuf)>, SourceError> {
        let mut zones = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SourceError::Unavailable(format!(
                    "{} does not exist",
                    self.root.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let dir_name = match file_name.to_str() {
                Some(n) => n,
                None => continue,
            };
            // Package zones are `intel-rapl:<n>`; subzones carry a second
            // `:<m>` segment and are discovered from their parent.
            if !dir_name.starts_with("intel-rapl:") || dir_name.matches(':').count() != 1 {
                continue;
            }
            let path = entry.path();
            let Some(zone_name) = read_trimmed(&path.join("name")) else {
                continue;
            };
            if let Some(socket) = zone_name.strip_prefix("package-") {
                zones.push((socket.to_string(), path));
            }
        }
        zones.sort();
        Ok(zones)
    }

    /// `psys` zones report whole-platform energy; surfaced separately so the
    /// platform source can pick them up on hosts that expose them.
    pub fn platform_zones(&self) -> PlatformReading {
        let mut reading = PlatformReading::new();
        let Ok(entries) = fs::read_dir(&self.root) else {
            return reading;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = read_trimmed(&path.join("name")) else {
                continue;
            };
            if name.starts_with("psys") {
                if let Some(uj) = read_u64(&path.join("energy_uj")) {
                    reading.insert(name, uj / 1000);
                }
            }
        }
        reading
    }
}

impl ComponentEnergySource for PowercapSource {
    fn name(&self) -> &'static str {
        "powercap"
    }

    fn energy_from_components(&mut self) -> Result<ComponentReading, SourceError> {
        let mut reading = ComponentReading::new();
        for (socket, zone_path) in self.package_zones()? {
            let mut energy = ComponentEnergy::default();
            if let Some(uj) = read_u64(&zone_path.join("energy_uj")) {
                energy.pkg = uj / 1000;
            }
            for subzone in subzones(&zone_path) {
                let Some(name) = read_trimmed(&subzone.join("name")) else {
                    continue;
                };
                let Some(uj) = read_u64(&subzone.join("energy_uj")) else {
                    continue;
                };
                let mj = uj / 1000;
                match name.as_str() {
                    "core" => energy.core = mj,
                    "uncore" => energy.uncore = mj,
                    "dram" => energy.dram = mj,
                    _ => {}
                }
            }
            reading.insert(socket, energy);
        }
        Ok(reading)
    }
}

fn subzones(zone_path: &Path) -> Vec<PathBuf> {
    let Some(zone_name) = zone_path.file_name().and_then(|n| n.to_str()) else {
        return Vec::new();
    };
    let Ok(entries) = fs::read_dir(zone_path) else {
        return Vec::new();
    };
    let mut out: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&format!("{zone_name}:")))
        })
        .collect();
    out.sort();
    out
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn read_u64(path: &Path) -> Option<u64> {
    read_trimmed(path)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_zone(root: &Path, dir: &str, name: &str, energy_uj: u64) {
        let zone = root.join(dir);
        fs::create_dir_all(&zone).unwrap();
        fs::write(zone.join("name"), format!("{name}\n")).unwrap();
        fs::write(zone.join("energy_uj"), format!("{energy_uj}\n")).unwrap();
    }

    #[test]
    fn probe_fails_without_package_zones() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            PowercapSource::probe_at(tmp.path()),
            Err(SourceError::Unavailable(_))
        ));
    }

    #[test]
    fn reads_sockets_and_subzones_in_millijoules() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        write_zone(root, "intel-rapl:0", "package-0", 123_456_789);
        write_zone(root, "intel-rapl:0/intel-rapl:0:0", "core", 50_000_000);
        write_zone(root, "intel-rapl:0/intel-rapl:0:1", "dram", 10_000_999);
        write_zone(root, "intel-rapl:1", "package-1", 5_000_000);

        let mut source = PowercapSource::probe_at(root).unwrap();
        let reading = source.energy_from_components().unwrap();
        assert_eq!(reading.len(), 2);

        let socket0 = &reading["0"];
        assert_eq!(socket0.pkg, 123_456);
        assert_eq!(socket0.core, 50_000);
        assert_eq!(socket0.uncore, 0);
        assert_eq!(socket0.dram, 10_000);

        let socket1 = &reading["1"];
        assert_eq!(socket1.pkg, 5_000);
    }

    #[test]
    fn psys_zone_reported_as_platform() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        write_zone(root, "intel-rapl:0", "package-0", 1_000_000);
        write_zone(root, "intel-rapl:2", "psys", 77_000_000);

        let source = PowercapSource::probe_at(root).unwrap();
        let platform = source.platform_zones();
        assert_eq!(platform.get("psys"), Some(&77_000));
    }
}
