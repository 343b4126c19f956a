use k8s_openapi::api::core::v1::Node;

use super::{quantity_value, top_level_node, GraphBuilder, Parser};
use crate::kind::EntityKind;
use crate::Result;

impl Parser<Node> for GraphBuilder<'_> {
    fn parse(&mut self, raw: &Node) -> Result<()> {
        let mut node = top_level_node(EntityKind::Node, &raw.metadata)?;
        let owner = format!("node/{}", node.name);

        node.set_opt(
            "provider_id",
            raw.spec.as_ref().and_then(|s| s.provider_id.clone()),
        );
        node.set(
            "unschedulable",
            raw.spec
                .as_ref()
                .and_then(|s| s.unschedulable)
                .unwrap_or(false),
        );

        let status = raw.status.as_ref();
        let info = status.and_then(|s| s.node_info.as_ref());
        node.set_opt("kernel_version", info.map(|i| i.kernel_version.clone()));
        node.set_opt("os_image", info.map(|i| i.os_image.clone()));
        node.set_opt(
            "container_runtime_version",
            info.map(|i| i.container_runtime_version.clone()),
        );
        node.set_opt("kubelet_version", info.map(|i| i.kubelet_version.clone()));

        let capacity = status.and_then(|s| s.capacity.as_ref());
        let quantity = |name: &str| {
            capacity
                .and_then(|c| c.get(name))
                .map(|q| q.0.as_str())
        };
        node.set("cpu_cores", quantity_value("cpu", &owner, quantity("cpu")));
        node.set(
            "memory_bytes",
            quantity_value("memory", &owner, quantity("memory")),
        );
        node.set("max_pods", quantity_value("pods", &owner, quantity("pods")));

        let address = |kind: &str| {
            status
                .and_then(|s| s.addresses.as_ref())
                .and_then(|addrs| addrs.iter().find(|a| a.type_ == kind))
                .map(|a| a.address.clone())
        };
        node.set_opt("internal_ip", address("InternalIP"));
        node.set_opt("hostname", address("Hostname"));

        let parent = node.entity_ref();
        self.insert(node);
        if let Some(conditions) = status.and_then(|s| s.conditions.as_ref()) {
            self.conditions(&parent, conditions);
        }
        self.labels(&parent, &raw.metadata);
        Ok(())
    }
}
