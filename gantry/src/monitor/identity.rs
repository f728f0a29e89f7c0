use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use log::{debug, warn};

use super::docker::ContainerRegistry;

/// Attribution result for one pid. `Host` covers every uncontainerized or
/// unresolvable process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerIdentity {
    Named(String),
    Host,
}

impl ContainerIdentity {
    pub fn as_db_str(&self) -> &str {
        match self {
            ContainerIdentity::Named(name) => name,
            ContainerIdentity::Host => "host",
        }
    }

    pub fn from_db(value: String) -> Self {
        if value == "host" {
            ContainerIdentity::Host
        } else {
            ContainerIdentity::Named(value)
        }
    }
}

impl fmt::Display for ContainerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

pub struct IdentityResolver<R> {
    registry: R,
    proc_root: PathBuf,
    // Extracted id prefix -> resolved container name.
    cache: HashMap<String, String>,
}

impl<R: ContainerRegistry> IdentityResolver<R> {
    pub fn new(registry: R) -> Self {
        Self::with_proc_root(registry, "/proc")
    }

    pub fn with_proc_root(registry: R, proc_root: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            proc_root: proc_root.into(),
            cache: HashMap::new(),
        }
    }

    /// Attribute a pid. Never fails: a vanished process, an unreadable
    /// cgroup file and an unreachable registry all degrade to `Host`.
    pub async fn resolve(&mut self, pid: u32) -> ContainerIdentity {
        let cgroup_path = self.proc_root.join(pid.to_string()).join("cgroup");
        let contents = match std::fs::read_to_string(&cgroup_path) {
            Ok(contents) => contents,
            Err(err) => {
                debug!("No cgroup file for pid {pid}: {err}");
                return ContainerIdentity::Host;
            }
        };

        for line in contents.lines() {
            // hierarchy-ID:controller-list:path
            let mut parts = line.splitn(3, ':');
            let (Some(_), Some(_), Some(path)) = (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            let Some(prefix) = extract_container_id(path) else {
                continue;
            };

            if let Some(name) = self.cache.get(prefix) {
                return ContainerIdentity::Named(name.clone());
            }

            let containers = match self.registry.list_running().await {
                Ok(containers) => containers,
                Err(err) => {
                    warn!("Container registry lookup failed for pid {pid}: {err}");
                    return ContainerIdentity::Host;
                }
            };

            if let Some(hit) = containers.iter().find(|c| c.id.starts_with(prefix)) {
                debug!("Resolved pid {} via cgroup prefix {}: {}", pid, prefix, hit.name);
                self.cache.insert(prefix.to_string(), hit.name.clone());
                return ContainerIdentity::Named(hit.name.clone());
            }

            // Stale names must not outlive container churn.
            self.cache.clear();
        }

        ContainerIdentity::Host
    }
}

// Container-runtime cgroup path encodings, most specific first.
fn extract_container_id(path: &str) -> Option<&str> {
    if let Some(start) = path.find("docker-") {
        let rest = &path[start + "docker-".len()..];
        if let Some(end) = rest.find(".scope") {
            let id = &rest[..end];
            if !id.is_empty() {
                return Some(id);
            }
        }
    }

    segment_after(path, "docker/")
        .or_else(|| segment_after(path, "cri-containerd/"))
        .or_else(|| segment_after(path, "containerd/"))
}

fn segment_after<'a>(path: &'a str, marker: &str) -> Option<&'a str> {
    let start = path.rfind(marker)? + marker.len();
    path[start..].split('/').next().filter(|s| !s.is_empty())
}
