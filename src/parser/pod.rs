//! Pods and their containers
//!
//! A pod fans out into Container children, the Images those containers run,
//! the registries serving them, plus the usual conditions, labels and
//! node-selector attributes.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, ContainerState, ContainerStatus, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde_json::Value;

use super::{quantity_value, time_value, top_level_node, GraphBuilder, ImageRef, Parser};
use crate::graph::{GraphNode, RefField};
use crate::kind::EntityKind;
use crate::store::EntityRef;
use crate::Result;

const OWNER_KIND_RC: &str = "ReplicationController";

impl Parser<Pod> for GraphBuilder<'_> {
    fn parse(&mut self, raw: &Pod) -> Result<()> {
        let mut node = top_level_node(EntityKind::Pod, &raw.metadata)?;
        let namespace = node.namespace.clone().unwrap_or_default();
        let spec = raw.spec.as_ref();
        let status = raw.status.as_ref();

        node.set_opt("phase", status.and_then(|s| s.phase.clone()));
        node.set_opt("reason", status.and_then(|s| s.reason.clone()));
        node.set_opt("message", status.and_then(|s| s.message.clone()));
        node.set_opt("pod_ip", status.and_then(|s| s.pod_ip.clone()));
        node.set_opt("host_ip", status.and_then(|s| s.host_ip.clone()));
        node.set_opt("restart_policy", spec.and_then(|s| s.restart_policy.clone()));
        node.set_opt("dns_policy", spec.and_then(|s| s.dns_policy.clone()));

        let namespace_ref = self.lazy(EntityKind::Namespace, &[&namespace]);
        node.set_ref("namespace", namespace_ref);
        let node_ref = self.lazy_opt(
            EntityKind::Node,
            spec.and_then(|s| s.node_name.as_deref()).map(|n| vec![n]),
        );
        node.set_ref("node", node_ref);

        let controller = raw
            .metadata
            .owner_references
            .iter()
            .flatten()
            .find(|o| o.kind == OWNER_KIND_RC)
            .map(|o| o.name.as_str());
        let controller_ref = self.lazy_opt(
            EntityKind::ReplicationController,
            controller.map(|name| vec![namespace.as_str(), name]),
        );
        node.set_ref("replication_controller", controller_ref);

        let parent = node.entity_ref();
        self.insert(node);

        let statuses: BTreeMap<&str, &ContainerStatus> = status
            .and_then(|s| s.container_statuses.as_ref())
            .into_iter()
            .flatten()
            .map(|cs| (cs.name.as_str(), cs))
            .collect();
        for container in spec.map(|s| s.containers.as_slice()).unwrap_or_default() {
            let container_status = statuses.get(container.name.as_str()).copied();
            self.container(&parent, container, container_status);
        }

        if let Some(conditions) = status.and_then(|s| s.conditions.as_ref()) {
            self.conditions(&parent, conditions);
        }
        self.labels(&parent, &raw.metadata);
        self.custom_attributes(
            &parent,
            "node_selectors",
            spec.and_then(|s| s.node_selector.as_ref()),
        );
        Ok(())
    }
}

impl GraphBuilder<'_> {
    fn container(&mut self, pod: &EntityRef, spec: &Container, status: Option<&ContainerStatus>) {
        let identity = format!("{}/{}", pod.identity, spec.name);
        let owner = format!("container/{identity}");
        let mut node = GraphNode::new(
            EntityKind::Container,
            identity,
            vec![pod.identity.clone(), spec.name.clone()],
            spec.name.clone(),
        )
        .with_parent(pod.clone());

        // The status image is what actually runs; the spec image is what was asked for
        let reference = status
            .map(|s| s.image.as_str())
            .filter(|i| !i.is_empty())
            .or(spec.image.as_deref());
        node.set_opt("image", reference);
        node.set_opt("restart_count", status.map(|s| s.restart_count));
        node.set("ready", status.is_some_and(|s| s.ready));
        set_state(&mut node, status.and_then(|s| s.state.as_ref()));

        let resources = spec.resources.as_ref();
        set_resources(&mut node, &owner, "request", resources.and_then(|r| r.requests.as_ref()));
        set_resources(&mut node, &owner, "limit", resources.and_then(|r| r.limits.as_ref()));

        let (image_ref, registry_ref) = match reference.and_then(ImageRef::parse) {
            Some(parsed) => {
                let parsed = parsed.with_image_id(status.map(|s| s.image_id.as_str()));
                self.image(&parsed)
            }
            None => (RefField::Null, RefField::Null),
        };
        node.set_ref("image", image_ref);
        node.set_ref("registry", registry_ref);
        self.insert(node);
    }
}

fn set_state(node: &mut GraphNode, state: Option<&ContainerState>) {
    let (name, reason, started, finished) = match state {
        Some(ContainerState {
            running: Some(running),
            ..
        }) => (
            "running",
            None,
            running.started_at.as_ref().map(time_value),
            None,
        ),
        Some(ContainerState {
            terminated: Some(terminated),
            ..
        }) => (
            "terminated",
            terminated.reason.clone(),
            terminated.started_at.as_ref().map(time_value),
            terminated.finished_at.as_ref().map(time_value),
        ),
        Some(ContainerState {
            waiting: Some(waiting),
            ..
        }) => ("waiting", waiting.reason.clone(), None, None),
        _ => ("unknown", None, None, None),
    };
    node.set("state", name);
    node.set_opt("state_reason", reason);
    node.set_opt::<Value>("started_at", started);
    node.set_opt::<Value>("finished_at", finished);
}

fn set_resources(
    node: &mut GraphNode,
    owner: &str,
    suffix: &str,
    quantities: Option<&BTreeMap<String, Quantity>>,
) {
    let get = |name: &str| quantities.and_then(|q| q.get(name)).map(|q| q.0.as_str());
    node.set(
        &format!("cpu_{suffix}"),
        quantity_value(&format!("cpu_{suffix}"), owner, get("cpu")),
    );
    node.set(
        &format!("memory_{suffix}"),
        quantity_value(&format!("memory_{suffix}"), owner, get("memory")),
    );
}
