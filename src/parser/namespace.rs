use k8s_openapi::api::core::v1::Namespace;

use super::{top_level_node, GraphBuilder, Parser};
use crate::kind::EntityKind;
use crate::Result;

impl Parser<Namespace> for GraphBuilder<'_> {
    fn parse(&mut self, raw: &Namespace) -> Result<()> {
        let mut node = top_level_node(EntityKind::Namespace, &raw.metadata)?;
        node.set_opt(
            "phase",
            raw.status.as_ref().and_then(|s| s.phase.clone()),
        );

        let parent = node.entity_ref();
        self.insert(node);
        self.labels(&parent, &raw.metadata);
        Ok(())
    }
}
