//! Docker-backed orchestrator for running test services as real containers.
//!
//! Every run gets its own bridge network; services receive static IPs from that
//! network's subnet and mount the shared test volume from the host. Partitioning is
//! not enforced here, so only the default partition is accepted.

use crate::{
    AddServiceArgs, AddServiceResponse, Error, OrchestratorClient, OrchestratorError,
    RegisterTestExecutionArgs, RemoveServiceArgs, RepartitionArgs, Result,
};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
        StopContainerOptions,
    },
    image::CreateImageOptions,
    network::{ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions},
    secret::{EndpointIpamConfig, EndpointSettings, HostConfig, Ipam, IpamConfig, PortBinding},
    Docker,
};
use futures::StreamExt;
use ipnetwork::Ipv4Network;
use rand::Rng;
use std::{
    collections::HashMap,
    net::Ipv4Addr,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tokio::{sync::Mutex, task::JoinHandle};

/// Configuration for [`DockerOrchestrator`]
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Prefix for container and network names
    pub name_prefix: String,
    /// Subnet of the run's bridge network
    pub subnet: Ipv4Network,
    /// Host directory mounted into every container as the test volume
    pub volume_host_dirpath: PathBuf,
    /// Host directory holding downloaded artifacts, one subdirectory per artifact ID
    pub artifact_cache_dirpath: Option<PathBuf>,
    /// Whether to remove containers and the network on drop
    pub cleanup_on_drop: bool,
}

impl DockerConfig {
    pub fn new(volume_host_dirpath: impl Into<PathBuf>) -> Self {
        Self {
            volume_host_dirpath: volume_host_dirpath.into(),
            ..Self::default()
        }
    }

    pub fn with_artifact_cache(mut self, dirpath: impl Into<PathBuf>) -> Self {
        self.artifact_cache_dirpath = Some(dirpath.into());
        self
    }

    pub fn with_subnet(mut self, subnet: Ipv4Network) -> Self {
        self.subnet = subnet;
        self
    }

    pub fn with_cleanup_on_drop(mut self, cleanup: bool) -> Self {
        self.cleanup_on_drop = cleanup;
        self
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        // Timestamp in the prefix makes stale resources easy to identify
        let timestamp = chrono::Utc::now().format("%Y%m%d-%H%M%S").to_string();
        let random_id = rand::thread_rng().gen::<u16>();
        let name_prefix = format!("testnet-{}-{}", timestamp, random_id);

        let cleanup_on_drop = std::env::var("TESTNET_DOCKER_KEEP_RESOURCES").is_err();

        Self {
            name_prefix,
            subnet: random_subnet(),
            volume_host_dirpath: crate::config::default_volume_dirpath(),
            artifact_cache_dirpath: None,
            cleanup_on_drop,
        }
    }
}

/// Random /24 inside 172.16.0.0/12, so concurrent runs rarely collide
fn random_subnet() -> Ipv4Network {
    let mut rng = rand::thread_rng();
    let base = Ipv4Addr::new(172, rng.gen_range(16..=31), rng.gen(), 0);
    // Prefix 24 is always in range, so the single-host fallback is never built
    Ipv4Network::new(base, 24).unwrap_or_else(|_| Ipv4Network::from(base))
}

/// Address of host number `host` in `subnet`, skipping the network address and gateway
fn host_ip(subnet: Ipv4Network, host: u32) -> Option<Ipv4Addr> {
    subnet
        .nth(host + 2)
        .filter(|ip| *ip != subnet.broadcast())
}

/// Docker port key, defaulting to TCP when no protocol is given
fn port_key(port: &str) -> String {
    if port.contains('/') {
        port.to_string()
    } else {
        format!("{}/tcp", port)
    }
}

fn substitute_ip(value: &str, placeholder: &str, ip: &str) -> String {
    if placeholder.is_empty() {
        value.to_string()
    } else {
        value.replace(placeholder, ip)
    }
}

fn environment_list(vars: &HashMap<String, String>, placeholder: &str, ip: &str) -> Vec<String> {
    let mut env: Vec<String> = vars
        .iter()
        .map(|(key, value)| format!("{}={}", key, substitute_ip(value, placeholder, ip)))
        .collect();
    env.sort();
    env
}

fn volume_binds(config: &DockerConfig, args: &AddServiceArgs) -> std::result::Result<Vec<String>, OrchestratorError> {
    let mut binds = vec![format!(
        "{}:{}",
        config.volume_host_dirpath.display(),
        args.test_volume_mount_dirpath
    )];

    if args.files_artifact_mount_dirpaths.is_empty() {
        return Ok(binds);
    }
    let cache = config.artifact_cache_dirpath.as_ref().ok_or_else(|| {
        OrchestratorError::Rejected(format!(
            "service '{}' mounts files artifacts but no artifact cache is configured",
            args.service_id
        ))
    })?;

    let mut artifact_binds: Vec<String> = args
        .files_artifact_mount_dirpaths
        .iter()
        .map(|(artifact_id, dirpath)| format!("{}:{}:ro", cache.join(artifact_id).display(), dirpath))
        .collect();
    artifact_binds.sort();
    binds.extend(artifact_binds);
    Ok(binds)
}

fn created_network_id(network_name: &str, id: Option<String>) -> Result<String> {
    id.filter(|id| !id.is_empty()).ok_or_else(|| {
        Error::Other(anyhow::anyhow!(
            "Docker created network {} without returning its ID",
            network_name
        ))
    })
}

/// Docker answers 304 when stopping a container that is not running
fn is_already_stopped(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

/// Background task that removes every container of the run when the hard timeout expires.
///
/// Each registration belongs to one test execution, so arming replaces the previous timer.
#[derive(Debug, Default)]
struct Reaper {
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Reaper {
    fn arm<F>(&self, timeout: Duration, on_expiry: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut task = self.task.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(previous) = task.take() {
            previous.abort();
        }
        *task = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            on_expiry.await;
        }));
    }

    fn disarm(&self) {
        let mut task = self.task.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(task) = task.take() {
            task.abort();
        }
    }
}

#[derive(Debug, Default)]
struct RunState {
    /// Service ID -> container ID
    containers: HashMap<String, String>,
    next_host: u32,
}

/// Runs services as containers on the local Docker daemon
pub struct DockerOrchestrator {
    docker: Docker,
    config: DockerConfig,
    network_name: String,
    network_id: String,
    state: Arc<Mutex<RunState>>,
    reaper: Reaper,
}

impl DockerOrchestrator {
    /// Connect to the local daemon and create the run's network
    pub async fn new(mut config: DockerConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Other(anyhow::anyhow!("Failed to connect to Docker: {}", e)))?;

        docker
            .ping()
            .await
            .map_err(|e| Error::Other(anyhow::anyhow!("Docker ping failed: {}", e)))?;

        std::fs::create_dir_all(&config.volume_host_dirpath)?;

        let network_name = format!("{}-net", config.name_prefix);
        let network_id = Self::create_network(&docker, &mut config, &network_name).await?;

        Ok(Self {
            docker,
            config,
            network_name,
            network_id,
            state: Arc::new(Mutex::new(RunState::default())),
            reaper: Reaper::default(),
        })
    }

    /// Create the bridge network, picking a new random subnet on conflicts
    async fn create_network(docker: &Docker, config: &mut DockerConfig, network_name: &str) -> Result<String> {
        const MAX_SUBNET_RETRIES: usize = 10;

        for attempt in 0..MAX_SUBNET_RETRIES {
            let options = CreateNetworkOptions {
                name: network_name.to_string(),
                driver: "bridge".to_string(),
                ipam: Ipam {
                    config: Some(vec![IpamConfig {
                        subnet: Some(config.subnet.to_string()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                },
                ..Default::default()
            };

            match docker.create_network(options).await {
                Ok(response) => {
                    let network_id = created_network_id(network_name, response.id)?;
                    tracing::info!(
                        "Created network {} ({}) with subnet {}",
                        network_name,
                        network_id,
                        config.subnet
                    );
                    return Ok(network_id);
                }
                Err(e) if e.to_string().contains("Pool overlaps") => {
                    let old_subnet = config.subnet;
                    config.subnet = random_subnet();
                    tracing::warn!(
                        "Subnet {} conflicts with an existing network, retrying with {} (attempt {}/{})",
                        old_subnet,
                        config.subnet,
                        attempt + 1,
                        MAX_SUBNET_RETRIES
                    );
                }
                Err(e) => {
                    return Err(Error::Other(anyhow::anyhow!(
                        "Failed to create network {}: {}",
                        network_name,
                        e
                    )))
                }
            }
        }

        Err(Error::Other(anyhow::anyhow!(
            "Failed to create network {} after {} attempts due to subnet conflicts",
            network_name,
            MAX_SUBNET_RETRIES
        )))
    }

    pub fn config(&self) -> &DockerConfig {
        &self.config
    }

    pub fn network_name(&self) -> &str {
        &self.network_name
    }

    async fn ensure_image(&self, image: &str) -> std::result::Result<(), OrchestratorError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        tracing::info!("Pulling image {}...", image);
        let mut pull = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            let info = progress?;
            if let Some(status) = info.status {
                tracing::trace!("{}: {}", image, status);
            }
        }
        Ok(())
    }

    /// Move a created container from the default bridge onto the run network and start it
    async fn attach_and_start(&self, container_id: &str, ip: &str) -> std::result::Result<(), OrchestratorError> {
        let _ = self
            .docker
            .disconnect_network(
                "bridge",
                DisconnectNetworkOptions {
                    container: container_id.to_string(),
                    force: true,
                },
            )
            .await;

        self.docker
            .connect_network(
                &self.network_id,
                ConnectNetworkOptions {
                    container: container_id.to_string(),
                    endpoint_config: EndpointSettings {
                        ipam_config: Some(EndpointIpamConfig {
                            ipv4_address: Some(ip.to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                },
            )
            .await?;

        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    /// Stop then force-remove a container. Removal is attempted even if the stop fails;
    /// the first error is returned.
    async fn stop_and_remove(
        docker: &Docker,
        container_id: &str,
        stop_timeout_secs: i64,
    ) -> std::result::Result<(), bollard::errors::Error> {
        let stopped = match docker
            .stop_container(container_id, Some(StopContainerOptions { t: stop_timeout_secs }))
            .await
        {
            Err(e) if !is_already_stopped(&e) => {
                tracing::debug!("Failed to stop container {}: {}", container_id, e);
                Err(e)
            }
            _ => Ok(()),
        };

        let removed = docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
        if let Err(e) = &removed {
            tracing::debug!("Failed to remove container {}: {}", container_id, e);
        }

        stopped.and(removed)
    }

    async fn remove_container(docker: &Docker, container_id: &str, stop_timeout_secs: i64) {
        let _ = Self::stop_and_remove(docker, container_id, stop_timeout_secs).await;
    }
}

#[async_trait]
impl OrchestratorClient for DockerOrchestrator {
    async fn add_service(&self, args: AddServiceArgs) -> std::result::Result<AddServiceResponse, OrchestratorError> {
        if !args.partition_id.is_empty() {
            return Err(OrchestratorError::Unsupported("partitions other than the default"));
        }

        let mut state = self.state.lock().await;
        if state.containers.contains_key(&args.service_id) {
            return Err(OrchestratorError::Rejected(format!(
                "service '{}' is already running",
                args.service_id
            )));
        }

        let ip = host_ip(self.config.subnet, state.next_host).ok_or_else(|| {
            OrchestratorError::Rejected(format!("subnet {} exhausted", self.config.subnet))
        })?;
        let ip_str = ip.to_string();

        self.ensure_image(&args.image_name).await?;

        let ports: Vec<String> = args.used_ports.iter().map(|p| port_key(p)).collect();
        let container_name = format!("{}-{}", self.config.name_prefix, args.service_id);
        let config = Config {
            image: Some(args.image_name.clone()),
            hostname: Some(args.service_id.clone()),
            cmd: args.start_command.as_ref().map(|cmd| {
                cmd.iter()
                    .map(|arg| substitute_ip(arg, &args.ip_placeholder, &ip_str))
                    .collect()
            }),
            env: Some(environment_list(
                &args.docker_environment_vars,
                &args.ip_placeholder,
                &ip_str,
            )),
            exposed_ports: Some(
                ports
                    .iter()
                    .map(|port| (port.clone(), HashMap::new()))
                    .collect(),
            ),
            host_config: Some(HostConfig {
                binds: Some(volume_binds(&self.config, &args)?),
                port_bindings: Some(
                    ports
                        .iter()
                        .map(|port| {
                            (
                                port.clone(),
                                Some(vec![PortBinding {
                                    host_ip: Some("0.0.0.0".to_string()),
                                    host_port: None,
                                }]),
                            )
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        };

        let container_id = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name.clone(),
                    ..Default::default()
                }),
                config,
            )
            .await?
            .id;
        if let Err(e) = self.attach_and_start(&container_id, &ip_str).await {
            tracing::warn!(
                "Container {} for service '{}' failed to start: {}",
                container_name,
                args.service_id,
                e
            );
            Self::remove_container(&self.docker, &container_id, 0).await;
            return Err(e);
        }

        state.containers.insert(args.service_id.clone(), container_id);
        state.next_host += 1;

        tracing::info!(
            "Started container {} for service '{}' at {}",
            container_name,
            args.service_id,
            ip_str
        );
        Ok(AddServiceResponse { ip_address: ip_str })
    }

    async fn remove_service(&self, args: RemoveServiceArgs) -> std::result::Result<(), OrchestratorError> {
        let container_id = self
            .state
            .lock()
            .await
            .containers
            .remove(&args.service_id)
            .ok_or_else(|| OrchestratorError::Rejected(format!("no running service '{}'", args.service_id)))?;

        let stop_timeout = i64::try_from(args.container_stop_timeout_seconds).unwrap_or(i64::MAX);
        if let Err(e) = Self::stop_and_remove(&self.docker, &container_id, stop_timeout).await {
            // A container that survived stays tracked so the reaper or drop cleanup removes it
            if self.docker.inspect_container(&container_id, None).await.is_ok() {
                self.state
                    .lock()
                    .await
                    .containers
                    .entry(args.service_id.clone())
                    .or_insert(container_id);
            }
            return Err(e.into());
        }
        tracing::debug!("Removed container for service '{}'", args.service_id);
        Ok(())
    }

    async fn repartition(&self, _args: RepartitionArgs) -> std::result::Result<(), OrchestratorError> {
        Err(OrchestratorError::Unsupported("network partitioning"))
    }

    async fn register_test_execution(
        &self,
        args: RegisterTestExecutionArgs,
    ) -> std::result::Result<(), OrchestratorError> {
        let docker = self.docker.clone();
        let state = Arc::clone(&self.state);
        let timeout = Duration::from_secs(args.test_timeout_seconds);
        self.reaper.arm(timeout, async move {
            let containers: Vec<String> = state.lock().await.containers.drain().map(|(_, id)| id).collect();
            tracing::error!(
                "Test execution exceeded its hard timeout of {}s; removing {} container(s)",
                timeout.as_secs(),
                containers.len()
            );
            let removals = containers
                .iter()
                .map(|container_id| Self::remove_container(&docker, container_id, 0));
            futures::future::join_all(removals).await;
        });

        tracing::debug!("Armed hard timeout of {}s", args.test_timeout_seconds);
        Ok(())
    }
}

impl Drop for DockerOrchestrator {
    fn drop(&mut self) {
        self.reaper.disarm();

        if !self.config.cleanup_on_drop {
            return;
        }
        tracing::info!("Cleaning up Docker resources for {}...", self.config.name_prefix);

        let docker = self.docker.clone();
        let state = Arc::clone(&self.state);
        let network_id = self.network_id.clone();

        let cleanup = async move {
            let containers: Vec<String> = state.lock().await.containers.drain().map(|(_, id)| id).collect();
            let removals = containers
                .iter()
                .map(|container_id| Self::remove_container(&docker, container_id, 2));
            futures::future::join_all(removals).await;

            // Containers must be gone before their network can be removed
            if let Err(e) = docker.remove_network(&network_id).await {
                tracing::debug!("Failed to remove network {}: {}", network_id, e);
            }
            tracing::info!("Docker cleanup complete");
        };

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            tokio::task::block_in_place(|| {
                handle.block_on(cleanup);
            });
        } else if let Ok(rt) = tokio::runtime::Runtime::new() {
            rt.block_on(cleanup);
        } else {
            tracing::error!("Failed to create runtime for cleanup");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn args_with_artifacts(artifacts: &[(&str, &str)]) -> AddServiceArgs {
        AddServiceArgs {
            service_id: "nginx".into(),
            partition_id: String::new(),
            image_name: "nginx:latest".into(),
            used_ports: vec!["80".into()],
            ip_placeholder: crate::IP_PLACEHOLDER.into(),
            start_command: None,
            docker_environment_vars: HashMap::new(),
            test_volume_mount_dirpath: "/test-volume".into(),
            files_artifact_mount_dirpaths: artifacts
                .iter()
                .map(|(id, path)| (id.to_string(), path.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_random_subnet_is_private_slash_24() {
        for _ in 0..50 {
            let subnet = random_subnet();
            let octets = subnet.ip().octets();
            assert_eq!(subnet.prefix(), 24);
            assert_eq!(octets[0], 172);
            assert!((16..=31).contains(&octets[1]));
            assert_eq!(octets[3], 0);
        }
    }

    #[test]
    fn test_host_ips_skip_network_gateway_and_broadcast() {
        let subnet = Ipv4Network::new(Ipv4Addr::new(172, 20, 5, 0), 24).unwrap();
        assert_eq!(host_ip(subnet, 0), Some(Ipv4Addr::new(172, 20, 5, 2)));
        assert_eq!(host_ip(subnet, 252), Some(Ipv4Addr::new(172, 20, 5, 254)));
        assert_eq!(host_ip(subnet, 253), None);
    }

    #[test]
    fn test_port_keys_default_to_tcp() {
        assert_eq!(port_key("80"), "80/tcp");
        assert_eq!(port_key("53/udp"), "53/udp");
    }

    #[test]
    fn test_environment_substitutes_ip() {
        let vars = HashMap::from([
            ("B".to_string(), "plain".to_string()),
            ("A".to_string(), format!("http://{}:80", crate::IP_PLACEHOLDER)),
        ]);
        assert_eq!(
            environment_list(&vars, crate::IP_PLACEHOLDER, "172.20.0.2"),
            vec!["A=http://172.20.0.2:80".to_string(), "B=plain".to_string()]
        );
    }

    #[test]
    fn test_binds_mount_volume_and_artifacts() {
        let config = DockerConfig::new("/tmp/volume").with_artifact_cache("/tmp/artifacts");
        let binds = volume_binds(&config, &args_with_artifacts(&[("abc123", "/static")])).unwrap();

        assert_eq!(binds[0], "/tmp/volume:/test-volume");
        assert_eq!(
            binds[1],
            format!("{}:/static:ro", Path::new("/tmp/artifacts").join("abc123").display())
        );
    }

    #[test]
    fn test_artifacts_require_cache() {
        let config = DockerConfig::new("/tmp/volume");
        assert!(volume_binds(&config, &args_with_artifacts(&[])).is_ok());
        assert!(matches!(
            volume_binds(&config, &args_with_artifacts(&[("abc123", "/static")])),
            Err(OrchestratorError::Rejected(_))
        ));
    }

    #[test]
    fn test_created_network_requires_an_id() {
        assert_eq!(created_network_id("run-net", Some("abc".into())).unwrap(), "abc");
        assert!(matches!(created_network_id("run-net", None), Err(Error::Other(_))));
        assert!(created_network_id("run-net", Some(String::new())).is_err());
    }

    #[test]
    fn test_not_modified_means_already_stopped() {
        let not_modified = bollard::errors::Error::DockerResponseServerError {
            status_code: 304,
            message: String::new(),
        };
        let conflict = bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message: "conflict".into(),
        };
        assert!(is_already_stopped(&not_modified));
        assert!(!is_already_stopped(&conflict));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearming_reaper_replaces_previous_timer() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let reaper = Reaper::default();
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));

        let fired = Arc::clone(&first);
        reaper.arm(Duration::from_secs(10), async move {
            fired.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_secs(5)).await;

        let fired = Arc::clone(&second);
        reaper.arm(Duration::from_secs(10), async move {
            fired.fetch_add(1, Ordering::SeqCst);
        });

        // Past the first deadline, before the second
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarmed_reaper_never_fires() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let reaper = Reaper::default();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        reaper.arm(Duration::from_secs(1), async move {
            flag.store(true, Ordering::SeqCst);
        });
        reaper.disarm();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
