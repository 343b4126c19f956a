//! Services and the pods behind them
//!
//! A Service's `pods` list comes from the Endpoints object sharing its
//! namespace and name, looked up among the objects of the same pass.

use k8s_openapi::api::core::v1::{Endpoints, Service};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde_json::{json, Map, Value};

use super::{top_level_node, GraphBuilder, Parser};
use crate::graph::RefField;
use crate::kind::EntityKind;
use crate::Result;

impl Parser<Service> for GraphBuilder<'_> {
    fn parse(&mut self, raw: &Service) -> Result<()> {
        let mut node = top_level_node(EntityKind::Service, &raw.metadata)?;
        let namespace = node.namespace.clone().unwrap_or_default();
        let spec = raw.spec.as_ref();

        node.set_opt("type", spec.and_then(|s| s.type_.clone()));
        node.set_opt("cluster_ip", spec.and_then(|s| s.cluster_ip.clone()));
        node.set_opt(
            "session_affinity",
            spec.and_then(|s| s.session_affinity.clone()),
        );

        let ports: Vec<Value> = spec
            .and_then(|s| s.ports.as_ref())
            .into_iter()
            .flatten()
            .map(|p| {
                json!({
                    "name": p.name,
                    "protocol": p.protocol,
                    "port": p.port,
                    "target_port": p.target_port.as_ref().map(target_port),
                    "node_port": p.node_port,
                })
            })
            .collect();
        node.set("ports", ports);

        let selector: Map<String, Value> = spec
            .and_then(|s| s.selector.as_ref())
            .into_iter()
            .flatten()
            .map(|(k, v)| (k.clone(), Value::from(v.clone())))
            .collect();
        node.set("selector", selector);

        let namespace_ref = self.lazy(EntityKind::Namespace, &[&namespace]);
        node.set_ref("namespace", namespace_ref);

        let pod_uids = self
            .endpoints_for(&namespace, &node.name)
            .map(endpoint_pod_uids)
            .unwrap_or_default();
        let pods: Vec<RefField> = pod_uids
            .iter()
            .map(|uid| self.lazy_identity(EntityKind::Pod, uid))
            .collect();
        node.set_ref_list("pods", pods);

        self.insert(node);
        Ok(())
    }
}

fn target_port(port: &IntOrString) -> Value {
    match port {
        IntOrString::Int(n) => Value::from(*n),
        IntOrString::String(s) => Value::from(s.clone()),
    }
}

/// Uids of the pods an Endpoints object routes to, ready or not, in order
fn endpoint_pod_uids(endpoints: &Endpoints) -> Vec<String> {
    let mut uids: Vec<String> = endpoints
        .subsets
        .iter()
        .flatten()
        .flat_map(|subset| {
            subset
                .addresses
                .iter()
                .flatten()
                .chain(subset.not_ready_addresses.iter().flatten())
        })
        .filter_map(|address| address.target_ref.as_ref())
        .filter(|target| target.kind.as_deref() == Some("Pod"))
        .filter_map(|target| target.uid.clone())
        .collect();
    uids.sort();
    uids.dedup();
    uids
}
