//! CPU identification.
//!
//! The power model's pre-fitted coefficients are keyed by CPU
//! microarchitecture. The mapping from (family, model, stepping) to a
//! microarchitecture name is data-driven via a YAML lookup file; there is
//! no hard-coded fallback. Unrecognized CPUs yield `unknown`, which the
//! model treats as "ratio estimator only".

use std::fs;
use std::path::Path;

use regex::Regex;
use serde::Deserialize;

pub const UNKNOWN_UARCH: &str = "unknown";

/// Default location of the microarchitecture lookup file.
pub const DEFAULT_CPUS_YAML: &str = "/var/lib/wattscope/data/cpus.yaml";

/// One lookup record: `model` and `stepping` are regular expressions,
/// `stepping` optional. First matching record wins.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CpuModelSpec {
    pub uarch: String,
    pub family: String,
    pub model: String,
    #[serde(default)]
    pub stepping: Option<String>,
}

/// Identity parsed from `/proc/cpuinfo`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuId {
    pub family: String,
    pub model: String,
    pub stepping: String,
}

/// Parse the first processor block of `/proc/cpuinfo`.
pub fn parse_cpuinfo(content: &str) -> CpuId {
    let mut id = CpuId::default();
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            // Blank line ends the first processor block.
            if line.trim().is_empty() && !id.family.is_empty() {
                break;
            }
            continue;
        };
        let value = value.trim().to_string();
        match key.trim() {
            "cpu family" if id.family.is_empty() => id.family = value,
            "model" if id.model.is_empty() => id.model = value,
            "stepping" if id.stepping.is_empty() => id.stepping = value,
            _ => {}
        }
    }
    id
}

pub fn read_cpuinfo(proc_root: &Path) -> std::io::Result<CpuId> {
    let content = fs::read_to_string(proc_root.join("cpuinfo"))?;
    Ok(parse_cpuinfo(&content))
}

/// Load the lookup file. A missing file is not fatal: every CPU resolves
/// to `unknown` and the model falls back to the ratio estimator.
pub fn load_model_specs(path: &Path) -> Vec<CpuModelSpec> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            tracing::info!(path = %path.display(), error = %e, "cpu model lookup unavailable");
            return Vec::new();
        }
    };
    match serde_yaml::from_str(&content) {
        Ok(specs) => specs,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "malformed cpu model lookup file");
            Vec::new()
        }
    }
}

/// Resolve the microarchitecture name for a CPU; first match wins.
pub fn resolve_uarch(specs: &[CpuModelSpec], id: &CpuId) -> String {
    for spec in specs {
        if spec.family != id.family {
            continue;
        }
        if !full_match(&spec.model, &id.model) {
            continue;
        }
        if let Some(stepping) = &spec.stepping {
            if !full_match(stepping, &id.stepping) {
                continue;
            }
        }
        return spec.uarch.clone();
    }
    UNKNOWN_UARCH.to_string()
}

fn full_match(pattern: &str, value: &str) -> bool {
    match Regex::new(&format!("^(?:{pattern})$")) {
        Ok(re) => re.is_match(value),
        Err(e) => {
            tracing::debug!(pattern, error = %e, "invalid pattern in cpu model lookup");
            false
        }
    }
}

/// PMU implementation name from `/sys/devices/cpu/caps/pmu_name`, absent
/// on hosts without PMU support.
pub fn pmu_name(sys_root: &Path) -> Option<String> {
    fs::read_to_string(sys_root.join("devices/cpu/caps/pmu_name"))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Count online CPUs from `/sys/devices/system/cpu/online` ("0-63" or
/// "0,2-5" range lists).
pub fn online_cpus(sys_root: &Path) -> Option<usize> {
    let content = fs::read_to_string(sys_root.join("devices/system/cpu/online")).ok()?;
    let mut count = 0usize;
    for part in content.trim().split(',') {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = lo.trim().parse().ok()?;
                let hi: usize = hi.trim().parse().ok()?;
                count += hi.checked_sub(lo)? + 1;
            }
            None => {
                if !part.trim().is_empty() {
                    count += 1;
                }
            }
        }
    }
    Some(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CPUINFO: &str = "\
processor\t: 0
vendor_id\t: GenuineIntel
cpu family\t: 6
model\t\t: 85
model name\t: Intel(R) Xeon(R) Platinum 8175M CPU @ 2.50GHz
stepping\t: 4

processor\t: 1
cpu family\t: 99
model\t\t: 1
stepping\t: 1
";

    #[test]
    fn parses_first_processor_block() {
        let id = parse_cpuinfo(CPUINFO);
        assert_eq!(id.family, "6");
        assert_eq!(id.model, "85");
        assert_eq!(id.stepping, "4");
    }

    #[test]
    fn first_matching_spec_wins() {
        let specs = vec![
            CpuModelSpec {
                uarch: "skylake".into(),
                family: "6".into(),
                model: "85".into(),
                stepping: Some("[0-4]".into()),
            },
            CpuModelSpec {
                uarch: "cascadelake".into(),
                family: "6".into(),
                model: "85".into(),
                stepping: None,
            },
        ];
        let id = CpuId {
            family: "6".into(),
            model: "85".into(),
            stepping: "4".into(),
        };
        assert_eq!(resolve_uarch(&specs, &id), "skylake");

        let id7 = CpuId {
            stepping: "7".into(),
            ..id
        };
        assert_eq!(resolve_uarch(&specs, &id7), "cascadelake");
    }

    #[test]
    fn model_field_is_a_regex() {
        let specs = vec![CpuModelSpec {
            uarch: "zen4".into(),
            family: "25".into(),
            model: "(1[6-9]|2[0-9])".into(),
            stepping: None,
        }];
        let id = CpuId {
            family: "25".into(),
            model: "17".into(),
            stepping: "2".into(),
        };
        assert_eq!(resolve_uarch(&specs, &id), "zen4");
        // Partial matches must not count: model "170" is not in 16..=29.
        let id170 = CpuId {
            model: "170".into(),
            ..id
        };
        assert_eq!(resolve_uarch(&specs, &id170), UNKNOWN_UARCH);
    }

    #[test]
    fn unrecognized_cpu_is_unknown() {
        assert_eq!(resolve_uarch(&[], &CpuId::default()), UNKNOWN_UARCH);
    }

    #[test]
    fn loads_specs_from_yaml() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cpus.yaml");
        fs::write(
            &path,
            "- uarch: skylake\n  family: \"6\"\n  model: \"85\"\n  stepping: \"[0-4]\"\n- uarch: icelake\n  family: \"6\"\n  model: \"106\"\n",
        )
        .unwrap();
        let specs = load_model_specs(&path);
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[1].uarch, "icelake");
        assert!(specs[1].stepping.is_none());
    }

    #[test]
    fn missing_lookup_file_yields_empty_specs() {
        assert!(load_model_specs(Path::new("/nonexistent/cpus.yaml")).is_empty());
    }

    #[test]
    fn parses_online_cpu_ranges() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("devices/system/cpu");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("online"), "0-3,8,10-11\n").unwrap();
        assert_eq!(online_cpus(tmp.path()), Some(7));
    }

    #[test]
    fn reads_pmu_name_when_present() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(pmu_name(tmp.path()), None);
        let dir = tmp.path().join("devices/cpu/caps");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("pmu_name"), "skylake\n").unwrap();
        assert_eq!(pmu_name(tmp.path()).as_deref(), Some("skylake"));
    }
}
