use std::collections::HashMap;
use std::future::Future;

use anyhow::Context;
use bollard::{Docker, query_parameters::ListContainersOptions, secret::ContainerSummary};
use log::debug;

/// One running container as reported by the runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerMeta {
    pub id: String,
    pub name: String,
}

/// Capability seam over the container runtime inventory.
pub trait ContainerRegistry {
    fn list_running(
        &self,
    ) -> impl Future<Output = Result<Vec<ContainerMeta>, anyhow::Error>> + Send;
}

pub struct DockerRegistry {
    docker: Docker,
}

impl DockerRegistry {
    pub fn connect() -> Result<Self, anyhow::Error> {
        let docker =
            Docker::connect_with_socket_defaults().context("connecting to the Docker socket")?;
        Ok(Self { docker })
    }
}

impl ContainerRegistry for DockerRegistry {
    async fn list_running(&self) -> Result<Vec<ContainerMeta>, anyhow::Error> {
        let options = Some(ListContainersOptions {
            all: false,
            limit: None,
            size: false,
            filters: Some(HashMap::from([("status".into(), vec!["running".into()])])),
        });
        let containers = self.docker.list_containers(options).await?;

        let mut running = Vec::with_capacity(containers.len());
        for container in containers {
            let Some(meta) = container_meta(&container) else {
                debug!("Skipping container without an id: {:?}", container.names);
                continue;
            };
            running.push(meta);
        }
        Ok(running)
    }
}

fn container_meta(container: &ContainerSummary) -> Option<ContainerMeta> {
    let id = container.id.clone()?;
    // The Engine API prefixes names with a slash.
    let name = container
        .names
        .as_ref()
        .and_then(|names| names.first())
        .map(|name| name.trim_start_matches('/').to_string())
        .unwrap_or_else(|| id.chars().take(12).collect());
    Some(ContainerMeta { id, name })
}
