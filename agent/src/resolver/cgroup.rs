//! Cgroup filesystem helpers for entity resolution.
//!
//! Two discovery paths feed the resolver: a walk of the cgroup v2 mount
//! building a `cgroup inode -> path` map (the probe reports kernel cgroup
//! ids, which are the directory inode numbers), and `/proc/<pid>/cgroup`
//! parsing for hosts where the probe cannot supply cgroup ids.

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use rustc_hash::FxHashMap;

/// Length of a full container id as written by containerd/CRI-O/Docker.
const CONTAINER_ID_LEN: usize = 64;

/// Walk the cgroup mount collecting every directory's inode -> path.
///
/// Permission errors on subtrees are skipped; the map is best-effort and
/// re-walked when a lookup misses.
pub fn walk_cgroup_paths(root: &Path) -> FxHashMap<u64, PathBuf> {
    let mut map = FxHashMap::default();
    walk_dir(root, &mut map);
    map
}

fn walk_dir(dir: &Path, map: &mut FxHashMap<u64, PathBuf>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            tracing::debug!(path = %dir.display(), "permission denied walking cgroup tree");
            return;
        }
        Err(_) => return,
    };
    if let Ok(meta) = fs::metadata(dir) {
        map.insert(meta.ino(), dir.to_path_buf());
    }
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk_dir(&path, map);
        }
    }
}

/// Parse the unified-hierarchy path out of `/proc/<pid>/cgroup`.
///
/// cgroup v2 has a single `0::/path` line; on hybrid hosts fall back to the
/// first line's path field.
pub fn read_proc_cgroup(proc_root: &Path, pid: u32) -> io::Result<String> {
    let content = fs::read_to_string(proc_root.join(pid.to_string()).join("cgroup"))?;
    for line in content.lines() {
        let mut parts = line.splitn(3, ':');
        let (hierarchy, _controllers, path) =
            match (parts.next(), parts.next(), parts.next()) {
                (Some(h), Some(c), Some(p)) => (h, c, p),
                _ => continue,
            };
        if hierarchy == "0" {
            return Ok(path.to_string());
        }
    }
    let first = content
        .lines()
        .next()
        .and_then(|line| line.splitn(3, ':').nth(2))
        .unwrap_or_default();
    Ok(first.to_string())
}

/// Read the kernel task comm for a pid.
pub fn read_proc_comm(proc_root: &Path, pid: u32) -> io::Result<String> {
    let comm = fs::read_to_string(proc_root.join(pid.to_string()).join("comm"))?;
    Ok(comm.trim_end().to_string())
}

/// Extract a container id from a cgroup path.
///
/// The id is the last 64 characters of the last path segment after
/// stripping the `.scope` and `/container` suffixes, and must be purely
/// alphanumeric (in practice, hex). Returns `None` for paths that do not
/// belong to a container, which callers attribute to the system sentinel.
pub fn container_id_from_path(path: &str) -> Option<String> {
    let mut trimmed = path.trim_end_matches('/');
    if let Some(stripped) = trimmed.strip_suffix("/container") {
        trimmed = stripped;
    }
    let last = trimmed.rsplit('/').next()?;
    let last = last.strip_suffix(".scope").unwrap_or(last);
    if last.len() < CONTAINER_ID_LEN {
        return None;
    }
    let (_, id) = last.split_at(last.len() - CONTAINER_ID_LEN);
    if id.chars().all(|c| c.is_ascii_alphanumeric()) {
        Some(id.to_string())
    } else {
        None
    }
}

/// Detect a libvirt/systemd-machined virtual machine scope.
///
/// VMs land under `machine.slice` as `machine-qemu\x2d<n>\x2d<name>.scope`
/// (the `\x2d` is literal in the directory name). Returns `(vm_id, name)`.
pub fn vm_from_path(path: &str) -> Option<(String, String)> {
    if !path.contains("machine.slice") {
        return None;
    }
    let last = path.trim_end_matches('/').rsplit('/').next()?;
    let scope = last.strip_suffix(".scope")?;
    if !scope.starts_with("machine-qemu") && !scope.starts_with("machine-") {
        return None;
    }
    let name = scope
        .rsplit("\\x2d")
        .next()
        .filter(|n| !n.is_empty())
        .unwrap_or(scope);
    Some((scope.to_string(), name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ID: &str = "19ec54f00502d7236ff37726115196c61a23301c69badddf7838516a03f69e08";

    #[test]
    fn extracts_id_from_containerd_scope() {
        let path = format!(
            "/kubelet.slice/kubelet-kubepods.slice/kubelet-kubepods-besteffort.slice/kubelet-kubepods-besteffort-pod29b83755.slice/cri-containerd-{ID}.scope"
        );
        assert_eq!(container_id_from_path(&path), Some(ID.to_string()));
    }

    #[test]
    fn extracts_id_from_docker_scope() {
        let path = format!("/system.slice/docker-{ID}.scope");
        assert_eq!(container_id_from_path(&path), Some(ID.to_string()));
    }

    #[test]
    fn extracts_id_from_bare_kubepods_segment() {
        let path = format!("/kubepods/burstable/pod1234/{ID}");
        assert_eq!(container_id_from_path(&path), Some(ID.to_string()));
    }

    #[test]
    fn strips_container_suffix() {
        let path = format!("/kubepods/pod1234/{ID}/container");
        assert_eq!(container_id_from_path(&path), Some(ID.to_string()));
    }

    #[test]
    fn rejects_non_container_paths() {
        assert_eq!(container_id_from_path("/system.slice/sshd.service"), None);
        assert_eq!(container_id_from_path("/user.slice"), None);
        assert_eq!(container_id_from_path("/"), None);
    }

    #[test]
    fn rejects_ids_with_punctuation() {
        let bad = format!("/system.slice/docker-{}.scope", "z_".repeat(32));
        assert_eq!(container_id_from_path(&bad), None);
    }

    #[test]
    fn detects_qemu_machine_scope() {
        let path = "/machine.slice/machine-qemu\\x2d1\\x2dfedora.scope";
        let (id, name) = vm_from_path(path).unwrap();
        assert_eq!(id, "machine-qemu\\x2d1\\x2dfedora");
        assert_eq!(name, "fedora");
    }

    #[test]
    fn ignores_non_machine_paths() {
        assert!(vm_from_path("/system.slice/docker-abc.scope").is_none());
    }

    #[test]
    fn walk_maps_inodes_to_paths() {
        let tmp = TempDir::new().unwrap();
        let nested = tmp.path().join("kubepods.slice/pod1");
        fs::create_dir_all(&nested).unwrap();

        let map = walk_cgroup_paths(tmp.path());
        let ino = fs::metadata(&nested).unwrap().ino();
        assert_eq!(map.get(&ino), Some(&nested));
    }

    #[test]
    fn proc_cgroup_prefers_unified_hierarchy() {
        let tmp = TempDir::new().unwrap();
        let proc_dir = tmp.path().join("1234");
        fs::create_dir_all(&proc_dir).unwrap();
        fs::write(
            proc_dir.join("cgroup"),
            "12:pids:/legacy\n0::/system.slice/docker-abc.scope\n",
        )
        .unwrap();

        let path = read_proc_cgroup(tmp.path(), 1234).unwrap();
        assert_eq!(path, "/system.slice/docker-abc.scope");
    }

    #[test]
    fn proc_cgroup_falls_back_to_first_line() {
        let tmp = TempDir::new().unwrap();
        let proc_dir = tmp.path().join("77");
        fs::create_dir_all(&proc_dir).unwrap();
        fs::write(proc_dir.join("cgroup"), "5:cpu:/v1path\n").unwrap();

        let path = read_proc_cgroup(tmp.path(), 77).unwrap();
        assert_eq!(path, "/v1path");
    }
}
