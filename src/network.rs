use crate::orchestrator::{artifact_mounts_to_wire, ceil_seconds};
use crate::{
    AddServiceArgs, ArtifactResolver, AvailabilityChecker, Error, OrchestratorClient, PartitionId,
    PartitionTopology, RemoveServiceArgs, RepartitionArgs, RepartitionerBuilder, Result, Service,
    ServiceId, ServiceInitSpec, ServiceRegistry, TestVolume, IP_PLACEHOLDER,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// The network a test runs against
///
/// Every mutation (adding, removing, repartitioning) holds a single lock for its whole
/// duration, including the orchestrator call, so mutations are linearizable.
pub struct NetworkContext<S> {
    orchestrator: Arc<dyn OrchestratorClient>,
    volume: TestVolume,
    artifacts: ArtifactResolver,
    partitioning_enabled: bool,
    registry: Mutex<ServiceRegistry<S>>,
}

impl<S: Service> NetworkContext<S> {
    pub fn new(
        orchestrator: Arc<dyn OrchestratorClient>,
        volume: TestVolume,
        artifacts: ArtifactResolver,
        partitioning_enabled: bool,
    ) -> Self {
        Self {
            orchestrator,
            volume,
            artifacts,
            partitioning_enabled,
            registry: Mutex::new(ServiceRegistry::new()),
        }
    }

    pub fn is_partitioning_enabled(&self) -> bool {
        self.partitioning_enabled
    }

    /// Add a service to the default partition
    pub async fn add_service(
        &self,
        service_id: impl Into<ServiceId>,
        spec: &dyn ServiceInitSpec<S>,
    ) -> Result<(Arc<S>, AvailabilityChecker<S>)> {
        self.add_service_to_partition(service_id, PartitionId::default_partition(), spec)
            .await
    }

    /// Start a service's container in the given partition and register its handle.
    ///
    /// The returned checker should be used to wait for the service before talking to it.
    pub async fn add_service_to_partition(
        &self,
        service_id: impl Into<ServiceId>,
        partition: impl Into<PartitionId>,
        spec: &dyn ServiceInitSpec<S>,
    ) -> Result<(Arc<S>, AvailabilityChecker<S>)> {
        let service_id = service_id.into();
        let partition = partition.into();

        let mut registry = self.registry.lock().await;
        registry.ensure_available(&service_id)?;
        if !partition.is_default() && !self.partitioning_enabled {
            return Err(Error::PartitioningDisabled);
        }

        tracing::info!(
            "Adding service '{}' to partition '{}' using image {}",
            service_id,
            partition,
            spec.image()
        );

        let mountpoint = spec.test_volume_mountpoint();
        let service_dir = self.volume.create_service_dir(&service_id)?;
        let file_keys = spec.files_to_generate();
        let (mut files, mounted_file_paths) = service_dir.generate_files(&file_keys, &mountpoint)?;
        spec.initialize_generated_files(&mut files).map_err(|e| {
            Error::Other(e.context(format!(
                "Failed to initialize generated files for service '{}'",
                service_id
            )))
        })?;
        // Close every handle before the container reads the files
        drop(files);
        tracing::trace!(
            "Generated {} file(s) for service '{}' in {}",
            mounted_file_paths.len(),
            service_id,
            service_dir.host_path().display()
        );

        let mut artifact_mounts = HashMap::new();
        for (artifact, dirpath) in spec.files_artifact_mountpoints() {
            let content_id = self
                .artifacts
                .resolve(&artifact)
                .cloned()
                .ok_or_else(|| Error::UnknownArtifact {
                    service_id: service_id.clone(),
                    artifact: artifact.clone(),
                })?;
            artifact_mounts.insert(content_id, dirpath);
        }

        let start_command = spec
            .start_command(&mounted_file_paths, IP_PLACEHOLDER)
            .map_err(|e| {
                Error::Other(e.context(format!(
                    "Failed to build the start command for service '{}'",
                    service_id
                )))
            })?;

        let mut used_ports: Vec<String> = spec.used_ports().into_iter().collect();
        used_ports.sort();

        let args = AddServiceArgs {
            service_id: service_id.to_string(),
            partition_id: partition.to_string(),
            image_name: spec.image(),
            used_ports,
            ip_placeholder: IP_PLACEHOLDER.to_string(),
            start_command,
            docker_environment_vars: spec.environment(),
            test_volume_mount_dirpath: mountpoint,
            files_artifact_mount_dirpaths: artifact_mounts_to_wire(artifact_mounts),
        };

        tracing::debug!("Requesting container for service '{}'", service_id);
        let response = self
            .orchestrator
            .add_service(args)
            .await
            .map_err(|e| Error::AddServiceFailed {
                service_id: service_id.clone(),
                reason: e.to_string(),
            })?;

        let service = Arc::new(spec.service_from_ip(&response.ip_address));
        registry.insert(service_id.clone(), partition, Arc::clone(&service))?;

        tracing::info!(
            "Service '{}' started at {}",
            service_id,
            response.ip_address
        );

        let checker = AvailabilityChecker::new(service_id, Arc::clone(&service));
        Ok((service, checker))
    }

    pub async fn get_service(&self, service_id: &ServiceId) -> Result<Arc<S>> {
        self.registry.lock().await.get(service_id)
    }

    /// Stop and forget a service.
    ///
    /// The service leaves the registry before the remote stop, so it is gone even if
    /// the stop fails.
    pub async fn remove_service(&self, service_id: &ServiceId, stop_timeout: Duration) -> Result<()> {
        let mut registry = self.registry.lock().await;
        registry.remove(service_id)?;

        tracing::info!("Removing service '{}'", service_id);
        self.orchestrator
            .remove_service(RemoveServiceArgs {
                service_id: service_id.to_string(),
                container_stop_timeout_seconds: ceil_seconds(stop_timeout),
            })
            .await
            .map_err(|e| Error::RemoveServiceFailed {
                service_id: service_id.clone(),
                reason: e.to_string(),
            })
    }

    /// Remove every service, logging and skipping individual failures
    pub async fn remove_all(&self, stop_timeout: Duration) {
        let service_ids = self.registry.lock().await.ids();
        tracing::info!("Removing all {} service(s) from the network", service_ids.len());

        for service_id in service_ids {
            if let Err(e) = self.remove_service(&service_id, stop_timeout).await {
                tracing::warn!("Failed to remove service '{}': {}", service_id, e);
            }
        }
    }

    pub async fn size(&self) -> usize {
        self.registry.lock().await.len()
    }

    /// Partition the service currently belongs to
    pub async fn partition_of(&self, service_id: &ServiceId) -> Result<PartitionId> {
        self.registry
            .lock()
            .await
            .partition_of(service_id)
            .cloned()
            .ok_or_else(|| Error::ServiceNotFound(service_id.clone()))
    }

    pub fn repartitioner_builder(&self, is_default_connection_blocked: bool) -> RepartitionerBuilder {
        RepartitionerBuilder::new(is_default_connection_blocked)
    }

    /// Replace the network's partition topology.
    ///
    /// Nothing is recorded locally unless the orchestrator accepts the new topology.
    pub async fn repartition_network(&self, topology: &PartitionTopology) -> Result<()> {
        if !self.partitioning_enabled {
            return Err(Error::PartitioningDisabled);
        }

        let mut registry = self.registry.lock().await;
        if let Some(unknown) = registry.find_unknown(topology) {
            return Err(Error::ServiceNotFound(unknown));
        }

        tracing::info!(
            "Repartitioning network into {} partition(s)",
            topology.services().len()
        );
        self.orchestrator
            .repartition(RepartitionArgs::from(topology))
            .await
            .map_err(|e| Error::RepartitionFailed(e.to_string()))?;

        registry.apply_topology(topology);
        tracing::debug!("Repartition applied");
        Ok(())
    }
}
