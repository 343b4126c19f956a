use k8s_openapi::api::core::v1::ReplicationController;
use serde_json::{Map, Value};

use super::{top_level_node, GraphBuilder, Parser};
use crate::kind::EntityKind;
use crate::Result;

impl Parser<ReplicationController> for GraphBuilder<'_> {
    fn parse(&mut self, raw: &ReplicationController) -> Result<()> {
        let mut node = top_level_node(EntityKind::ReplicationController, &raw.metadata)?;
        let namespace = node.namespace.clone().unwrap_or_default();
        let spec = raw.spec.as_ref();
        let status = raw.status.as_ref();

        node.set_opt("desired_replicas", spec.and_then(|s| s.replicas));
        node.set_opt("current_replicas", status.map(|s| s.replicas));
        node.set("ready_replicas", status.and_then(|s| s.ready_replicas).unwrap_or(0));

        let selector: Map<String, Value> = spec
            .and_then(|s| s.selector.as_ref())
            .into_iter()
            .flatten()
            .map(|(k, v)| (k.clone(), Value::from(v.clone())))
            .collect();
        node.set("selector", selector);

        let namespace_ref = self.lazy(EntityKind::Namespace, &[&namespace]);
        node.set_ref("namespace", namespace_ref);
        self.insert(node);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::test_support::{meta, target_of};
    use crate::tags::TagMapper;
    use k8s_openapi::api::core::v1::{ReplicationControllerSpec, ReplicationControllerStatus};

    #[test]
    fn replica_counts() {
        let tags = TagMapper::default();
        let rc = ReplicationController {
            metadata: meta(Some("ns1"), "rc1", "rc-uid"),
            spec: Some(ReplicationControllerSpec {
                replicas: Some(3),
                ..Default::default()
            }),
            status: Some(ReplicationControllerStatus {
                replicas: 2,
                ..Default::default()
            }),
        };

        let mut builder = GraphBuilder::new(&tags);
        builder.parse(&rc).unwrap();
        let built = builder.finish();

        let node = &built.graph.nodes(EntityKind::ReplicationController)[0];
        assert_eq!(node.attributes["desired_replicas"], Value::from(3));
        assert_eq!(node.attributes["current_replicas"], Value::from(2));
        assert_eq!(node.attributes["ready_replicas"], Value::from(0));
        assert_eq!(
            target_of(&built, &node.refs["namespace"]).as_deref(),
            Some("Namespace[ns1]")
        );
    }
}
