//! Docker lifecycle watcher.
//!
//! Subscribes to container start/stop/die/destroy events, translates
//! qualifying containers into application records via their labels, and
//! feeds the orchestrator's channel. An initial synchronous scan seeds the
//! record set before event streaming begins; the event stream reconnects
//! with a fixed backoff on transport errors.

use std::collections::HashMap;
use std::time::Duration;

use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::models::{ContainerSummary, EventMessage};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::orchestrator::AppEvent;
use crate::record;

const SHORT_ID_LEN: usize = 12;

/// Watches the container engine and reports lifecycle transitions.
pub struct DockerWatcher {
    docker: Docker,
    tx: mpsc::Sender<AppEvent>,
    backoff: Duration,
}

impl DockerWatcher {
    /// Connect to the engine socket. Failure here is non-fatal to the
    /// daemon: captures proceed with an empty record set.
    pub fn connect(
        tx: mpsc::Sender<AppEvent>,
        config: &Config,
    ) -> Result<Self, bollard::errors::Error> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            tx,
            backoff: Duration::from_secs(config.docker_backoff_secs),
        })
    }

    /// Seed from already-running containers, then stream events until the
    /// root context cancels.
    pub async fn run(self, mut cancel: watch::Receiver<bool>) {
        self.seed().await;

        loop {
            let mut events = self.docker.events(Some(event_options()));
            info!("docker event stream connected");

            loop {
                tokio::select! {
                    _ = cancel.changed() => {
                        info!("docker watcher stopping");
                        return;
                    }
                    item = events.next() => {
                        match item {
                            Some(Ok(message)) => self.handle_event(message).await,
                            Some(Err(e)) => {
                                warn!(error = %e, "docker event stream error, reconnecting");
                                break;
                            }
                            None => {
                                warn!("docker event stream ended, reconnecting");
                                break;
                            }
                        }
                    }
                }
            }

            tokio::select! {
                _ = cancel.changed() => return,
                _ = tokio::time::sleep(self.backoff) => {}
            }
        }
    }

    async fn seed(&self) {
        let options = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let containers = match self.docker.list_containers(Some(options)).await {
            Ok(containers) => containers,
            Err(e) => {
                warn!(error = %e, "container scan failed, starting with empty record set");
                return;
            }
        };

        info!(count = containers.len(), "scanning existing containers");

        for container in containers {
            let Some(id) = container.id.as_deref() else {
                continue;
            };
            let container_id = short_id(id);
            let labels = container.labels.clone().unwrap_or_default();
            let fallback = summary_published_port(&container);

            if let Some(record) = record::derive_record(&container_id, &labels, fallback) {
                info!(container = %container_id, app = %record.app_name, "seeding record");
                let sent = self
                    .tx
                    .send(AppEvent::Started {
                        container_id,
                        record,
                        announce: false,
                    })
                    .await;
                if sent.is_err() {
                    return;
                }
            }
        }
    }

    async fn handle_event(&self, message: EventMessage) {
        let action = message.action.as_deref().unwrap_or("");
        let actor = message.actor.unwrap_or_default();
        let Some(id) = actor.id.as_deref() else {
            return;
        };
        let container_id = short_id(id);
        let name = actor
            .attributes
            .as_ref()
            .and_then(|a| a.get("name").cloned())
            .unwrap_or_else(|| container_id.clone());

        match action {
            "start" => {
                info!(container = %name, id = %container_id, "container started");
                self.handle_start(container_id).await;
            }
            "stop" | "die" | "destroy" => {
                info!(container = %name, id = %container_id, action, "container down");
                let _ = self
                    .tx
                    .send(AppEvent::Stopped { container_id })
                    .await;
            }
            _ => debug!(container = %name, action, "ignoring event"),
        }
    }

    async fn handle_start(&self, container_id: String) {
        // Event attributes carry an incomplete label set; inspect for the
        // full one.
        let inspection = match self
            .docker
            .inspect_container(&container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspection) => inspection,
            Err(e) => {
                debug!(container = %container_id, error = %e, "inspect failed");
                return;
            }
        };

        let labels = inspection
            .config
            .as_ref()
            .and_then(|c| c.labels.clone())
            .unwrap_or_default();
        let fallback = inspected_published_port(&inspection.network_settings);

        if let Some(record) = record::derive_record(&container_id, &labels, fallback) {
            let _ = self
                .tx
                .send(AppEvent::Started {
                    container_id,
                    record,
                    announce: true,
                })
                .await;
        }
    }
}

fn event_options() -> EventsOptions<String> {
    let mut filters = HashMap::new();
    filters.insert("type".to_string(), vec!["container".to_string()]);
    filters.insert(
        "event".to_string(),
        ["start", "stop", "die", "destroy"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    );
    EventsOptions {
        since: None,
        until: None,
        filters,
    }
}

fn short_id(id: &str) -> String {
    id.chars().take(SHORT_ID_LEN).collect()
}

/// First published host port from a container summary.
fn summary_published_port(container: &ContainerSummary) -> Option<u16> {
    container
        .ports
        .as_ref()?
        .iter()
        .find_map(|port| port.public_port.and_then(|p| u16::try_from(p).ok()))
}

/// First published host port from an inspect response. Keys are sorted so
/// the "first" port is stable across calls.
fn inspected_published_port(
    settings: &Option<bollard::models::NetworkSettings>,
) -> Option<u16> {
    let ports = settings.as_ref()?.ports.as_ref()?;
    let mut keys: Vec<_> = ports.keys().collect();
    keys.sort();

    for key in keys {
        let Some(Some(bindings)) = ports.get(key) else {
            continue;
        };
        for binding in bindings {
            if let Some(port) = binding.host_port.as_deref().and_then(|p| p.parse().ok()) {
                return Some(port);
            }
        }
    }
    None
}
