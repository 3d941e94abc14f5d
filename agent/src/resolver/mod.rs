//! Entity resolution: (cgroup id, pid) -> container, pod or VM.
//!
//! Attribution correctness depends on this mapping, so it is part of the
//! core. Lookups go through write-through caches (`pid -> container id`,
//! `container id -> info`) that survive across ticks; the cgroup-id path
//! additionally memoizes an inode -> path map of the cgroup mount.
//!
//! Resolution never hard-fails: any miss or IO error yields the *system*
//! sentinel, and kernel-owned records yield the *kernel* sentinel. Callers
//! treat sentinels as ordinary attribution targets.

mod cgroup;
pub mod kubernetes;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rustc_hash::FxHashMap;

pub use cgroup::container_id_from_path;

/// Container id of the kernel sentinel.
pub const KERNEL_ID: &str = "kernel";
/// Container id of the system sentinel.
pub const SYSTEM_ID: &str = "system";
/// The synthetic pid all kernel-owned records are merged under.
pub const KERNEL_PID: u32 = 1;

/// Identity of the container a process belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub pod_name: String,
}

impl ContainerInfo {
    pub fn kernel() -> Self {
        Self {
            id: KERNEL_ID.to_string(),
            name: "kernel_processes".to_string(),
            namespace: "kernel".to_string(),
            pod_name: "kernel_processes".to_string(),
        }
    }

    pub fn system() -> Self {
        Self {
            id: SYSTEM_ID.to_string(),
            name: "system_processes".to_string(),
            namespace: "system".to_string(),
            pod_name: "system_processes".to_string(),
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.id == KERNEL_ID || self.id == SYSTEM_ID
    }
}

/// A virtual machine scope discovered under `machine.slice`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmInfo {
    pub id: String,
    pub name: String,
}

/// Where a process record is attributed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Container(ContainerInfo),
    Vm(VmInfo),
}

/// Pod metadata for one container id, fed by the pod watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodMetadata {
    pub pod_name: String,
    pub container_name: String,
    pub namespace: String,
}

#[derive(Default)]
struct Inner {
    pid_to_container: FxHashMap<u32, String>,
    pid_to_vm: FxHashMap<u32, VmInfo>,
    containers: FxHashMap<String, ContainerInfo>,
    cgroup_paths: FxHashMap<u64, PathBuf>,
    metadata: FxHashMap<String, PodMetadata>,
    alive: HashSet<String>,
    /// False until the first `mark_alive`; without a pod watch every
    /// container is considered alive and container GC relies on process
    /// liveness alone.
    alive_valid: bool,
}

pub struct Resolver {
    proc_root: PathBuf,
    cgroup_root: PathBuf,
    inner: Mutex<Inner>,
}

impl Resolver {
    pub fn new(proc_root: impl Into<PathBuf>, cgroup_root: impl Into<PathBuf>) -> Self {
        let mut inner = Inner::default();
        for sentinel in [ContainerInfo::kernel(), ContainerInfo::system()] {
            inner.containers.insert(sentinel.id.clone(), sentinel);
        }
        Self {
            proc_root: proc_root.into(),
            cgroup_root: cgroup_root.into(),
            inner: Mutex::new(inner),
        }
    }

    /// Resolve a probe record to its attribution target.
    ///
    /// `use_cgroup_id` selects the cgroup-mount walk keyed by the kernel
    /// cgroup id; otherwise `/proc/<pid>/cgroup` is parsed. Kernel records
    /// (`cgroup_id == 1` under `use_cgroup_id`) short-circuit to the kernel
    /// sentinel without any lookup.
    pub fn resolve(&self, cgroup_id: u64, pid: u32, use_cgroup_id: bool) -> Resolution {
        if use_cgroup_id && cgroup_id == 1 {
            return Resolution::Container(ContainerInfo::kernel());
        }

        let mut inner = self.inner.lock().expect("resolver lock poisoned");
        if let Some(vm) = inner.pid_to_vm.get(&pid) {
            return Resolution::Vm(vm.clone());
        }
        if let Some(id) = inner.pid_to_container.get(&pid) {
            if let Some(info) = inner.containers.get(id) {
                return Resolution::Container(info.clone());
            }
        }

        let path = if use_cgroup_id {
            self.lookup_cgroup_path(&mut inner, cgroup_id)
                .map(|p| p.to_string_lossy().into_owned())
        } else {
            match cgroup::read_proc_cgroup(&self.proc_root, pid) {
                Ok(path) => Some(path),
                Err(e) => {
                    tracing::debug!(pid, error = %e, "failed to read /proc cgroup, using system sentinel");
                    None
                }
            }
        };

        let Some(path) = path else {
            return Resolution::Container(self.cache_container(&mut inner, pid, ContainerInfo::system()));
        };

        if let Some((vm_id, vm_name)) = cgroup::vm_from_path(&path) {
            let vm = VmInfo {
                id: vm_id,
                name: vm_name,
            };
            inner.pid_to_vm.insert(pid, vm.clone());
            return Resolution::Vm(vm);
        }

        match cgroup::container_id_from_path(&path) {
            Some(id) => {
                let info = inner
                    .containers
                    .get(&id)
                    .cloned()
                    .unwrap_or_else(|| describe_container(&inner.metadata, &id));
                Resolution::Container(self.cache_container(&mut inner, pid, info))
            }
            None => Resolution::Container(self.cache_container(&mut inner, pid, ContainerInfo::system())),
        }
    }

    fn cache_container(&self, inner: &mut Inner, pid: u32, info: ContainerInfo) -> ContainerInfo {
        inner.pid_to_container.insert(pid, info.id.clone());
        inner.containers.insert(info.id.clone(), info.clone());
        info
    }

    fn lookup_cgroup_path(&self, inner: &mut Inner, cgroup_id: u64) -> Option<PathBuf> {
        if let Some(path) = inner.cgroup_paths.get(&cgroup_id) {
            return Some(path.clone());
        }
        // Miss: the cgroup may have been created after the last walk.
        inner.cgroup_paths = cgroup::walk_cgroup_paths(&self.cgroup_root);
        inner.cgroup_paths.get(&cgroup_id).cloned()
    }

    /// Replace the alive-container set and pod metadata from the pod watch.
    pub fn mark_alive(&self, metadata: FxHashMap<String, PodMetadata>) {
        let mut inner = self.inner.lock().expect("resolver lock poisoned");
        inner.alive = metadata.keys().cloned().collect();
        inner.alive_valid = true;
        // Refresh cached container descriptions with the new metadata.
        for (id, meta) in &metadata {
            if let Some(info) = inner.containers.get_mut(id) {
                info.name = meta.container_name.clone();
                info.pod_name = meta.pod_name.clone();
                info.namespace = meta.namespace.clone();
            }
        }
        inner.metadata = metadata;
    }

    /// Whether the pod watch still reports this container. Sentinels are
    /// always alive; before the first `mark_alive` everything is.
    pub fn is_alive(&self, container_id: &str) -> bool {
        if container_id == KERNEL_ID || container_id == SYSTEM_ID {
            return true;
        }
        let inner = self.inner.lock().expect("resolver lock poisoned");
        !inner.alive_valid || inner.alive.contains(container_id)
    }

    /// Drop PID-keyed cache entries for freed pids.
    pub fn clear(&self, freed_pids: &[u32]) {
        let mut inner = self.inner.lock().expect("resolver lock poisoned");
        for pid in freed_pids {
            inner.pid_to_container.remove(pid);
            inner.pid_to_vm.remove(pid);
        }
    }

    /// Lazily resolve a command name from `/proc/<pid>/comm`.
    pub fn command_of(&self, pid: u32) -> Option<String> {
        cgroup::read_proc_comm(&self.proc_root, pid).ok()
    }
}

fn describe_container(
    metadata: &FxHashMap<String, PodMetadata>,
    id: &str,
) -> ContainerInfo {
    match metadata.get(id) {
        Some(meta) => ContainerInfo {
            id: id.to_string(),
            name: meta.container_name.clone(),
            namespace: meta.namespace.clone(),
            pod_name: meta.pod_name.clone(),
        },
        None => ContainerInfo {
            id: id.to_string(),
            // Short id stands in until the pod watch names the container.
            name: id.chars().take(12).collect(),
            namespace: "unknown".to_string(),
            pod_name: "unknown".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::MetadataExt;
    use tempfile::TempDir;

    const ID: &str = "19ec54f00502d7236ff37726115196c61a23301c69badddf7838516a03f69e08";

    fn write_proc_cgroup(proc_root: &Path, pid: u32, path: &str) {
        let dir = proc_root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("cgroup"), format!("0::{path}\n")).unwrap();
    }

    #[test]
    fn kernel_cgroup_id_short_circuits() {
        let tmp = TempDir::new().unwrap();
        let resolver = Resolver::new(tmp.path().join("proc"), tmp.path().join("cgroup"));
        let res = resolver.resolve(1, 42, true);
        assert_eq!(res, Resolution::Container(ContainerInfo::kernel()));
    }

    #[test]
    fn missing_proc_entry_yields_system_sentinel() {
        let tmp = TempDir::new().unwrap();
        let resolver = Resolver::new(tmp.path().join("proc"), tmp.path().join("cgroup"));
        let res = resolver.resolve(0, 4242, false);
        assert_eq!(res, Resolution::Container(ContainerInfo::system()));
    }

    #[test]
    fn resolves_container_from_proc_cgroup_and_caches() {
        let tmp = TempDir::new().unwrap();
        let proc_root = tmp.path().join("proc");
        write_proc_cgroup(&proc_root, 100, &format!("/system.slice/docker-{ID}.scope"));
        let resolver = Resolver::new(&proc_root, tmp.path().join("cgroup"));

        let first = resolver.resolve(0, 100, false);
        let Resolution::Container(info) = &first else {
            panic!("expected container resolution");
        };
        assert_eq!(info.id, ID);

        // Remove the proc entry: a second resolve must be served from cache.
        fs::remove_dir_all(proc_root.join("100")).unwrap();
        let second = resolver.resolve(0, 100, false);
        assert_eq!(first, second);

        // After clearing the pid, resolution falls back to the sentinel.
        resolver.clear(&[100]);
        let third = resolver.resolve(0, 100, false);
        assert_eq!(third, Resolution::Container(ContainerInfo::system()));
    }

    #[test]
    fn resolves_by_cgroup_id_via_mount_walk() {
        let tmp = TempDir::new().unwrap();
        let cgroup_root = tmp.path().join("cgroup");
        let scope = cgroup_root.join(format!("kubepods.slice/cri-containerd-{ID}.scope"));
        fs::create_dir_all(&scope).unwrap();
        let ino = fs::metadata(&scope).unwrap().ino();

        let resolver = Resolver::new(tmp.path().join("proc"), &cgroup_root);
        let res = resolver.resolve(ino, 55, true);
        let Resolution::Container(info) = res else {
            panic!("expected container resolution");
        };
        assert_eq!(info.id, ID);
    }

    #[test]
    fn unknown_cgroup_id_yields_system_sentinel() {
        let tmp = TempDir::new().unwrap();
        let cgroup_root = tmp.path().join("cgroup");
        fs::create_dir_all(&cgroup_root).unwrap();
        let resolver = Resolver::new(tmp.path().join("proc"), &cgroup_root);
        let res = resolver.resolve(999_999, 55, true);
        assert_eq!(res, Resolution::Container(ContainerInfo::system()));
    }

    #[test]
    fn vm_scope_resolves_to_vm() {
        let tmp = TempDir::new().unwrap();
        let proc_root = tmp.path().join("proc");
        write_proc_cgroup(
            &proc_root,
            200,
            "/machine.slice/machine-qemu\\x2d1\\x2dfedora.scope",
        );
        let resolver = Resolver::new(&proc_root, tmp.path().join("cgroup"));
        let Resolution::Vm(vm) = resolver.resolve(0, 200, false) else {
            panic!("expected VM resolution");
        };
        assert_eq!(vm.name, "fedora");
    }

    #[test]
    fn mark_alive_governs_liveness_and_naming() {
        let tmp = TempDir::new().unwrap();
        let proc_root = tmp.path().join("proc");
        write_proc_cgroup(&proc_root, 300, &format!("/system.slice/docker-{ID}.scope"));
        let resolver = Resolver::new(&proc_root, tmp.path().join("cgroup"));

        // Before any pod watch update everything is alive.
        assert!(resolver.is_alive(ID));

        let Resolution::Container(anon) = resolver.resolve(0, 300, false) else {
            panic!("expected container");
        };
        assert_eq!(anon.pod_name, "unknown");

        let mut metadata = FxHashMap::default();
        metadata.insert(
            ID.to_string(),
            PodMetadata {
                pod_name: "web-abc12".to_string(),
                container_name: "web".to_string(),
                namespace: "prod".to_string(),
            },
        );
        resolver.mark_alive(metadata);

        assert!(resolver.is_alive(ID));
        assert!(!resolver.is_alive("deadbeef"));
        assert!(resolver.is_alive(SYSTEM_ID));

        let Resolution::Container(named) = resolver.resolve(0, 300, false) else {
            panic!("expected container");
        };
        assert_eq!(named.name, "web");
        assert_eq!(named.namespace, "prod");
        assert_eq!(named.pod_name, "web-abc12");
    }
}
