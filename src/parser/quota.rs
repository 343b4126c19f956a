//! Resource quotas and limit ranges
//!
//! Both expand into one child row per resource line.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{LimitRange, ResourceQuota};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use super::{child_node, quantity_value, top_level_node, GraphBuilder, Parser};
use crate::kind::EntityKind;
use crate::Result;

type Quantities = BTreeMap<String, Quantity>;

impl Parser<ResourceQuota> for GraphBuilder<'_> {
    fn parse(&mut self, raw: &ResourceQuota) -> Result<()> {
        let mut node = top_level_node(EntityKind::ResourceQuota, &raw.metadata)?;
        let namespace = node.namespace.clone().unwrap_or_default();
        let owner = format!("resourcequota/{namespace}/{}", node.name);

        let namespace_ref = self.lazy(EntityKind::Namespace, &[&namespace]);
        node.set_ref("namespace", namespace_ref);
        let parent = node.entity_ref();
        self.insert(node);

        // Status carries the enforced hard limits; the spec is only the request
        let hard = raw
            .status
            .as_ref()
            .and_then(|s| s.hard.as_ref())
            .or_else(|| raw.spec.as_ref().and_then(|s| s.hard.as_ref()));
        let used = raw.status.as_ref().and_then(|s| s.used.as_ref());

        let resources: BTreeSet<&String> = hard
            .into_iter()
            .chain(used)
            .flat_map(BTreeMap::keys)
            .collect();
        for resource in resources {
            let mut item = child_node(EntityKind::QuotaItem, &parent, resource);
            item.set("resource", resource.clone());
            item.set("hard", quantity_value("hard", &owner, lookup(hard, resource)));
            item.set("used", quantity_value("used", &owner, lookup(used, resource)));
            self.insert(item);
        }
        Ok(())
    }
}

impl Parser<LimitRange> for GraphBuilder<'_> {
    fn parse(&mut self, raw: &LimitRange) -> Result<()> {
        let mut node = top_level_node(EntityKind::LimitRange, &raw.metadata)?;
        let namespace = node.namespace.clone().unwrap_or_default();
        let owner = format!("limitrange/{namespace}/{}", node.name);

        let namespace_ref = self.lazy(EntityKind::Namespace, &[&namespace]);
        node.set_ref("namespace", namespace_ref);
        let parent = node.entity_ref();
        self.insert(node);

        for limit in raw.spec.iter().flat_map(|s| s.limits.iter()) {
            let columns: [(&str, Option<&Quantities>); 5] = [
                ("max", limit.max.as_ref()),
                ("min", limit.min.as_ref()),
                ("default", limit.default.as_ref()),
                ("default_request", limit.default_request.as_ref()),
                (
                    "max_limit_request_ratio",
                    limit.max_limit_request_ratio.as_ref(),
                ),
            ];
            let resources: BTreeSet<&String> = columns
                .iter()
                .filter_map(|(_, q)| *q)
                .flat_map(BTreeMap::keys)
                .collect();

            for resource in resources {
                let discriminator = format!("{}/{}", limit.type_, resource);
                let mut item = child_node(EntityKind::LimitItem, &parent, &discriminator);
                item.set("type", limit.type_.clone());
                item.set("resource", resource.clone());
                for (column, quantities) in &columns {
                    item.set(
                        column,
                        quantity_value(column, &owner, lookup(*quantities, resource)),
                    );
                }
                self.insert(item);
            }
        }
        Ok(())
    }
}

fn lookup<'q>(quantities: Option<&'q Quantities>, resource: &str) -> Option<&'q str> {
    quantities
        .and_then(|q| q.get(resource))
        .map(|q| q.0.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::test_support::meta;
    use crate::tags::TagMapper;
    use k8s_openapi::api::core::v1::{
        LimitRangeItem, LimitRangeSpec, ResourceQuotaSpec, ResourceQuotaStatus,
    };
    use serde_json::Value;

    fn quantities(pairs: &[(&str, &str)]) -> Quantities {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
            .collect()
    }

    #[test]
    fn quota_items_cover_hard_and_used() {
        let quota = ResourceQuota {
            metadata: meta(Some("ns1"), "compute", "rq-uid"),
            spec: Some(ResourceQuotaSpec {
                hard: Some(quantities(&[("cpu", "10")])),
                ..Default::default()
            }),
            status: Some(ResourceQuotaStatus {
                hard: Some(quantities(&[("cpu", "8"), ("pods", "20")])),
                used: Some(quantities(&[("cpu", "1500m"), ("services", "2")])),
            }),
        };

        let tags = TagMapper::default();
        let mut builder = GraphBuilder::new(&tags);
        builder.parse(&quota).unwrap();
        let built = builder.finish();

        let items = built.graph.nodes(EntityKind::QuotaItem);
        let by_resource: BTreeMap<String, (Value, Value)> = items
            .iter()
            .map(|i| {
                (
                    i.attributes["resource"].as_str().unwrap().to_string(),
                    (i.attributes["hard"].clone(), i.attributes["used"].clone()),
                )
            })
            .collect();
        assert_eq!(by_resource.len(), 3);
        assert_eq!(by_resource["cpu"], (Value::from(8), Value::from(1.5)));
        assert_eq!(by_resource["pods"], (Value::from(20), Value::Null));
        assert_eq!(by_resource["services"], (Value::Null, Value::from(2)));
        assert!(items
            .iter()
            .all(|i| i.parent.as_ref().map(|p| p.identity.as_str()) == Some("rq-uid")));
    }

    #[test]
    fn limit_items_per_type_and_resource() {
        let range = LimitRange {
            metadata: meta(Some("ns1"), "limits", "lr-uid"),
            spec: Some(LimitRangeSpec {
                limits: vec![
                    LimitRangeItem {
                        type_: "Container".to_string(),
                        max: Some(quantities(&[("cpu", "2"), ("memory", "1Gi")])),
                        default_request: Some(quantities(&[("cpu", "100m")])),
                        ..Default::default()
                    },
                    LimitRangeItem {
                        type_: "Pod".to_string(),
                        max: Some(quantities(&[("cpu", "4")])),
                        ..Default::default()
                    },
                ],
            }),
        };

        let tags = TagMapper::default();
        let mut builder = GraphBuilder::new(&tags);
        builder.parse(&range).unwrap();
        let built = builder.finish();

        let items = built.graph.nodes(EntityKind::LimitItem);
        assert_eq!(items.len(), 3);
        let container_cpu = items
            .iter()
            .find(|i| i.identity == "LimitRange/lr-uid/Container/cpu")
            .unwrap();
        assert_eq!(container_cpu.attributes["max"], Value::from(2));
        assert_eq!(container_cpu.attributes["default_request"], Value::from(0.1));
        assert_eq!(container_cpu.attributes["min"], Value::Null);
    }
}
