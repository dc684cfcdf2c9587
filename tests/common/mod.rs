#![allow(dead_code)]

use bollard::models::{
    ContainerConfig, ContainerCreateBody, ContainerInspectResponse, ContainerState,
    ContainerStateStatusEnum, ContainerSummary, Health, HealthStatusEnum, HostConfig,
    ImageInspect, PortBinding,
};
use docksentinel::outbound::sqlite::Sqlite;
use docksentinel::runtime::{ContainerId, ContainerRuntime, RuntimeError};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

pub fn unique_db_path() -> String {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let id = COUNTER.fetch_add(1, Ordering::SeqCst);
    format!(
        "sqlite:///tmp/docksentinel_test_{}_{}.db",
        std::process::id(),
        id
    )
}

pub async fn store() -> Sqlite {
    let store = Sqlite::new(&unique_db_path())
        .await
        .expect("Failed to connect to database");
    store.migrate().await.expect("Failed to run migrations");
    store
}

/// How containers created from an image behave once started.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Behaviour {
    /// Running, no healthcheck configured.
    Plain,
    Healthy,
    Unhealthy,
    /// Healthcheck never leaves `starting`.
    Starting,
    /// Exits right after start.
    Crashes,
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub image_id: String,
    pub running: bool,
    pub exit_code: Option<i64>,
    pub labels: HashMap<String, String>,
    pub env: Vec<String>,
    pub host_port: Option<String>,
    pub behaviour: Behaviour,
}

#[derive(Default)]
pub struct FakeState {
    pub containers: Vec<FakeContainer>,
    /// image id -> repo digests
    pub images: HashMap<String, Vec<String>>,
    /// image reference -> digest served by the registry
    pub remote: HashMap<String, String>,
    pub broken_registry: HashSet<String>,
    pub behaviours: HashMap<String, Behaviour>,
    pub fail_create: HashSet<String>,
    /// Daemon refuses to list containers.
    pub fail_list: bool,
    pub calls: Vec<String>,
    next_id: u32,
}

impl FakeState {
    fn find(&self, container: &str) -> Option<usize> {
        self.containers
            .iter()
            .position(|c| c.id == container || c.name == container)
    }

    fn get(&self, container: &str) -> Result<usize, RuntimeError> {
        self.find(container)
            .ok_or_else(|| RuntimeError::NotFound(format!("No such container: {container}")))
    }

    fn name_taken(&self, name: &str) -> bool {
        self.containers.iter().any(|c| c.name == name)
    }
}

/// In-memory container runtime mimicking the Docker engine's answers.
#[derive(Clone, Default)]
pub struct FakeRuntime {
    state: Arc<Mutex<FakeState>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Add a running container whose local image carries `local_digest`.
    pub fn add_container(&self, name: &str, image: &str, local_digest: &str) -> String {
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("{:0>12}{}", state.next_id, "c0ffee");
        let image_id = format!("sha256:local-{name}");
        let repository = image.split(':').next().unwrap_or(image);
        state.images.insert(
            image_id.clone(),
            vec![format!("{repository}@{local_digest}")],
        );
        state.containers.push(FakeContainer {
            id: id.clone(),
            name: name.to_string(),
            image: image.to_string(),
            image_id,
            running: true,
            exit_code: None,
            labels: HashMap::new(),
            env: vec!["MODE=production".to_string()],
            host_port: None,
            behaviour: Behaviour::Plain,
        });
        id
    }

    pub fn set_label(&self, container: &str, key: &str, value: &str) {
        let mut state = self.state();
        let idx = state.find(container).unwrap();
        state.containers[idx]
            .labels
            .insert(key.to_string(), value.to_string());
    }

    pub fn set_host_port(&self, container: &str, port: &str) {
        let mut state = self.state();
        let idx = state.find(container).unwrap();
        state.containers[idx].host_port = Some(port.to_string());
    }

    pub fn set_running(&self, container: &str, running: bool) {
        let mut state = self.state();
        let idx = state.find(container).unwrap();
        state.containers[idx].running = running;
    }

    pub fn publish(&self, image: &str, digest: &str) {
        self.state()
            .remote
            .insert(image.to_string(), digest.to_string());
    }

    pub fn behave(&self, image: &str, behaviour: Behaviour) {
        self.state()
            .behaviours
            .insert(image.to_string(), behaviour);
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        let state = self.state();
        state.find(name).map(|idx| state.containers[idx].clone())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state()
            .containers
            .iter()
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    fn record(&self, call: String) {
        self.state().calls.push(call);
    }
}

fn inspect(container: &FakeContainer) -> ContainerInspectResponse {
    let health = match container.behaviour {
        Behaviour::Healthy => Some(HealthStatusEnum::HEALTHY),
        Behaviour::Unhealthy => Some(HealthStatusEnum::UNHEALTHY),
        Behaviour::Starting => Some(HealthStatusEnum::STARTING),
        Behaviour::Plain | Behaviour::Crashes => None,
    };
    let port_bindings = container.host_port.as_ref().map(|port| {
        HashMap::from([(
            "80/tcp".to_string(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(port.clone()),
            }]),
        )])
    });
    ContainerInspectResponse {
        id: Some(container.id.clone()),
        name: Some(format!("/{}", container.name)),
        image: Some(container.image_id.clone()),
        config: Some(ContainerConfig {
            image: Some(container.image.clone()),
            env: Some(container.env.clone()),
            labels: Some(container.labels.clone()),
            ..Default::default()
        }),
        host_config: Some(HostConfig {
            port_bindings,
            ..Default::default()
        }),
        state: Some(ContainerState {
            running: Some(container.running),
            status: Some(if container.running {
                ContainerStateStatusEnum::RUNNING
            } else if container.exit_code.is_some() {
                ContainerStateStatusEnum::EXITED
            } else {
                ContainerStateStatusEnum::CREATED
            }),
            exit_code: container.exit_code,
            health: health.filter(|_| container.running).map(|status| Health {
                status: Some(status),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn conflict(message: String) -> RuntimeError {
    RuntimeError::Server {
        status: 409,
        message,
    }
}

impl ContainerRuntime for FakeRuntime {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let state = self.state();
        if state.fail_list {
            return Err(RuntimeError::Server {
                status: 500,
                message: "daemon unavailable".to_string(),
            });
        }
        Ok(state
            .containers
            .iter()
            .map(|c| ContainerSummary {
                id: Some(c.id.clone()),
                names: Some(vec![format!("/{}", c.name)]),
                image: Some(c.image.clone()),
                labels: Some(c.labels.clone()),
                ..Default::default()
            })
            .collect())
    }

    async fn inspect_container(
        &self,
        container: &str,
    ) -> Result<ContainerInspectResponse, RuntimeError> {
        let state = self.state();
        let idx = state.get(container)?;
        Ok(inspect(&state.containers[idx]))
    }

    async fn inspect_image(&self, image: &str) -> Result<ImageInspect, RuntimeError> {
        let state = self.state();
        let repo_digests = state
            .images
            .get(image)
            .ok_or_else(|| RuntimeError::NotFound(format!("No such image: {image}")))?;
        Ok(ImageInspect {
            id: Some(image.to_string()),
            repo_digests: Some(repo_digests.clone()),
            ..Default::default()
        })
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.record(format!("pull {image}"));
        let mut state = self.state();
        let digest = state
            .remote
            .get(image)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(format!("manifest unknown: {image}")))?;
        let repository = image.split(':').next().unwrap_or(image).to_string();
        state.images.insert(
            format!("sha256:pulled-{image}"),
            vec![format!("{repository}@{digest}")],
        );
        Ok(())
    }

    async fn create_container(
        &self,
        name: &str,
        body: ContainerCreateBody,
    ) -> Result<ContainerId, RuntimeError> {
        self.record(format!("create {name}"));
        let mut state = self.state();
        let image = body.image.unwrap_or_default();
        if state.fail_create.contains(&image) {
            return Err(RuntimeError::Server {
                status: 500,
                message: format!("cannot create container from {image}"),
            });
        }
        if state.name_taken(name) {
            return Err(conflict(format!("name {name} is already in use")));
        }
        state.next_id += 1;
        let id = format!("{:0>12}{}", state.next_id, "beef");
        let host_port = body
            .host_config
            .and_then(|host_config| host_config.port_bindings)
            .into_iter()
            .flat_map(|bindings| bindings.into_values())
            .flatten()
            .flatten()
            .find_map(|binding| binding.host_port);
        let behaviour = state
            .behaviours
            .get(&image)
            .copied()
            .unwrap_or(Behaviour::Plain);
        state.containers.push(FakeContainer {
            id: id.clone(),
            name: name.to_string(),
            image_id: format!("sha256:pulled-{image}"),
            image,
            running: false,
            exit_code: None,
            labels: body.labels.unwrap_or_default(),
            env: body.env.unwrap_or_default(),
            host_port,
            behaviour,
        });
        Ok(id)
    }

    async fn start_container(&self, container: &str) -> Result<(), RuntimeError> {
        self.record(format!("start {container}"));
        let mut state = self.state();
        let idx = state.get(container)?;
        if state.containers[idx].running {
            return Err(RuntimeError::NotModified("container already started".to_string()));
        }
        if let Some(port) = state.containers[idx].host_port.clone() {
            let taken = state
                .containers
                .iter()
                .enumerate()
                .any(|(other, c)| other != idx && c.running && c.host_port.as_ref() == Some(&port));
            if taken {
                return Err(RuntimeError::Server {
                    status: 500,
                    message: format!("Bind for 0.0.0.0:{port} failed: port is already allocated"),
                });
            }
        }
        let target = &mut state.containers[idx];
        if target.behaviour == Behaviour::Crashes {
            target.running = false;
            target.exit_code = Some(1);
        } else {
            target.running = true;
            target.exit_code = None;
        }
        Ok(())
    }

    async fn stop_container(
        &self,
        container: &str,
        _timeout_secs: i32,
    ) -> Result<(), RuntimeError> {
        self.record(format!("stop {container}"));
        let mut state = self.state();
        let idx = state.get(container)?;
        let target = &mut state.containers[idx];
        if !target.running {
            return Err(RuntimeError::NotModified("container already stopped".to_string()));
        }
        target.running = false;
        target.exit_code = Some(0);
        Ok(())
    }

    async fn rename_container(&self, container: &str, new_name: &str) -> Result<(), RuntimeError> {
        self.record(format!("rename {container} {new_name}"));
        let mut state = self.state();
        let idx = state.get(container)?;
        if state.containers[idx].name != new_name && state.name_taken(new_name) {
            return Err(conflict(format!("name {new_name} is already in use")));
        }
        state.containers[idx].name = new_name.to_string();
        Ok(())
    }

    async fn remove_container(&self, container: &str, force: bool) -> Result<(), RuntimeError> {
        self.record(format!("remove {container}"));
        let mut state = self.state();
        let idx = state.get(container)?;
        if state.containers[idx].running && !force {
            return Err(conflict("cannot remove a running container".to_string()));
        }
        state.containers.remove(idx);
        Ok(())
    }

    async fn inspect_distribution(&self, image: &str) -> Result<serde_json::Value, RuntimeError> {
        let state = self.state();
        if state.broken_registry.contains(image) {
            return Err(RuntimeError::Server {
                status: 500,
                message: "registry unavailable".to_string(),
            });
        }
        match state.remote.get(image) {
            Some(digest) => Ok(json!({
                "Descriptor": {
                    "mediaType": "application/vnd.oci.image.index.v1+json",
                    "Digest": digest,
                    "Size": 1024
                },
                "Platforms": [{"architecture": "amd64", "os": "linux"}]
            })),
            None => Err(RuntimeError::NotFound(format!(
                "{image}: manifest unknown"
            ))),
        }
    }
}
