//! Platform energy from hwmon sensors.
//!
//! Walks `/sys/class/hwmon/hwmon*` for chips exposing cumulative
//! `energy<N>_input` attributes (micro-joules). Sensors are keyed
//! `<chip>/energy<N>`; chips without energy attributes (power-only ACPI
//! meters) are skipped.

use std::fs;
use std::path::{Path, PathBuf};

use crate::energy::{PlatformEnergySource, PlatformReading};
use crate::error::SourceError;

const DEFAULT_ROOT: &str = "/sys/class/hwmon";

#[derive(Debug)]
pub struct HwmonPlatformSource {
    root: PathBuf,
}

impl HwmonPlatformSource {
    /// Probe the hwmon tree; `Unavailable` when no chip exposes an energy
    /// counter.
    pub fn probe() -> Result<Self, SourceError> {
        Self::probe_at(Path::new(DEFAULT_ROOT))
    }

    pub fn probe_at(root: &Path) -> Result<Self, SourceError> {
        let source = Self {
            root: root.to_path_buf(),
        };
        if source.read_sensors().is_empty() {
            return Err(SourceError::Unavailable(format!(
                "no hwmon energy sensors under {}",
                root.display()
            )));
        }
        Ok(source)
    }

    fn read_sensors(&self) -> PlatformReading {
        let mut reading = PlatformReading::new();
        let Ok(chips) = fs::read_dir(&self.root) else {
            return reading;
        };
        for chip in chips.flatten() {
            let chip_path = chip.path();
            let chip_name = fs::read_to_string(chip_path.join("name"))
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|_| {
                    chip.file_name().to_string_lossy().into_owned()
                });
            let Ok(attrs) = fs::read_dir(&chip_path) else {
                continue;
            };
            for attr in attrs.flatten() {
                let file_name = attr.file_name();
                let Some(attr_name) = file_name.to_str() else {
                    continue;
                };
                if !attr_name.starts_with("energy") || !attr_name.ends_with("_input") {
                    continue;
                }
                let Ok(raw) = fs::read_to_string(attr.path()) else {
                    continue;
                };
                let Ok(microjoules) = raw.trim().parse::<u64>() else {
                    continue;
                };
                let sensor = format!(
                    "{}/{}",
                    chip_name,
                    attr_name.trim_end_matches("_input")
                );
                reading.insert(sensor, microjoules / 1000);
            }
        }
        reading
    }
}

impl PlatformEnergySource for HwmonPlatformSource {
    fn name(&self) -> &'static str {
        "hwmon"
    }

    fn energy_from_platform(&mut self) -> Result<PlatformReading, SourceError> {
        Ok(self.read_sensors())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_chip(root: &Path, dir: &str, name: &str, energies: &[(u32, u64)]) {
        let chip = root.join(dir);
        fs::create_dir_all(&chip).unwrap();
        fs::write(chip.join("name"), format!("{name}\n")).unwrap();
        for (idx, uj) in energies {
            fs::write(chip.join(format!("energy{idx}_input")), format!("{uj}\n")).unwrap();
        }
    }

    #[test]
    fn probe_fails_without_energy_attributes() {
        let tmp = TempDir::new().unwrap();
        write_chip(tmp.path(), "hwmon0", "acpitz", &[]);
        assert!(matches!(
            HwmonPlatformSource::probe_at(tmp.path()),
            Err(SourceError::Unavailable(_))
        ));
    }

    #[test]
    fn reads_energy_sensors_in_millijoules() {
        let tmp = TempDir::new().unwrap();
        write_chip(
            tmp.path(),
            "hwmon0",
            "power_meter",
            &[(1, 9_000_500), (2, 1_000_000)],
        );
        write_chip(tmp.path(), "hwmon1", "coretemp", &[]);

        let mut source = HwmonPlatformSource::probe_at(tmp.path()).unwrap();
        let reading = source.energy_from_platform().unwrap();
        assert_eq!(reading.len(), 2);
        assert_eq!(reading["power_meter/energy1"], 9_000);
        assert_eq!(reading["power_meter/energy2"], 1_000);
    }
}
