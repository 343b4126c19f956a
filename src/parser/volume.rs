//! Persistent volumes and claims
//!
//! A bound pair references each other: the volume through its claim
//! reference, the claim through its volume name. Either side may be parsed
//! first.

use k8s_openapi::api::core::v1::{
    PersistentVolume, PersistentVolumeClaim, PersistentVolumeSpec,
};
use serde_json::Value;

use super::{quantity_value, top_level_node, GraphBuilder, Parser};
use crate::kind::EntityKind;
use crate::Result;

impl Parser<PersistentVolume> for GraphBuilder<'_> {
    fn parse(&mut self, raw: &PersistentVolume) -> Result<()> {
        let mut node = top_level_node(EntityKind::PersistentVolume, &raw.metadata)?;
        let owner = format!("persistentvolume/{}", node.name);
        let spec = raw.spec.as_ref();

        node.set(
            "capacity_bytes",
            quantity_value(
                "storage",
                &owner,
                spec.and_then(|s| s.capacity.as_ref())
                    .and_then(|c| c.get("storage"))
                    .map(|q| q.0.as_str()),
            ),
        );
        node.set("access_modes", access_modes(spec.and_then(|s| s.access_modes.as_ref())));
        node.set_opt(
            "reclaim_policy",
            spec.and_then(|s| s.persistent_volume_reclaim_policy.clone()),
        );
        node.set_opt("storage_class", spec.and_then(|s| s.storage_class_name.clone()));
        node.set_opt("source_type", spec.and_then(source_type));
        node.set_opt("phase", raw.status.as_ref().and_then(|s| s.phase.clone()));

        // Prefer the uid; older claim refs only carry namespace and name
        let claim = spec.and_then(|s| s.claim_ref.as_ref());
        let claim_ref = match claim.and_then(|c| c.uid.as_deref()) {
            Some(uid) if !uid.is_empty() => {
                self.lazy_identity(EntityKind::PersistentVolumeClaim, uid)
            }
            _ => self.lazy_opt(
                EntityKind::PersistentVolumeClaim,
                claim.and_then(|c| Some(vec![c.namespace.as_deref()?, c.name.as_deref()?])),
            ),
        };
        node.set_ref("claim", claim_ref);

        self.insert(node);
        Ok(())
    }
}

impl Parser<PersistentVolumeClaim> for GraphBuilder<'_> {
    fn parse(&mut self, raw: &PersistentVolumeClaim) -> Result<()> {
        let mut node = top_level_node(EntityKind::PersistentVolumeClaim, &raw.metadata)?;
        let namespace = node.namespace.clone().unwrap_or_default();
        let owner = format!("persistentvolumeclaim/{namespace}/{}", node.name);
        let spec = raw.spec.as_ref();
        let status = raw.status.as_ref();

        node.set_opt("phase", status.and_then(|s| s.phase.clone()));
        node.set(
            "requested_bytes",
            quantity_value(
                "requests.storage",
                &owner,
                spec.and_then(|s| s.resources.as_ref())
                    .and_then(|r| r.requests.as_ref())
                    .and_then(|r| r.get("storage"))
                    .map(|q| q.0.as_str()),
            ),
        );
        node.set(
            "capacity_bytes",
            quantity_value(
                "capacity.storage",
                &owner,
                status
                    .and_then(|s| s.capacity.as_ref())
                    .and_then(|c| c.get("storage"))
                    .map(|q| q.0.as_str()),
            ),
        );
        node.set("access_modes", access_modes(spec.and_then(|s| s.access_modes.as_ref())));
        node.set_opt("storage_class", spec.and_then(|s| s.storage_class_name.clone()));
        let volume_name = spec.and_then(|s| s.volume_name.clone());
        node.set_opt("volume_name", volume_name.clone());

        let namespace_ref = self.lazy(EntityKind::Namespace, &[&namespace]);
        node.set_ref("namespace", namespace_ref);
        let volume_ref = self.lazy_opt(
            EntityKind::PersistentVolume,
            volume_name.as_deref().map(|v| vec![v]),
        );
        node.set_ref("volume", volume_ref);

        self.insert(node);
        Ok(())
    }
}

fn access_modes(modes: Option<&Vec<String>>) -> Value {
    Value::from(modes.cloned().unwrap_or_default())
}

fn source_type(spec: &PersistentVolumeSpec) -> Option<&'static str> {
    let sources = [
        ("csi", spec.csi.is_some()),
        ("nfs", spec.nfs.is_some()),
        ("host_path", spec.host_path.is_some()),
        ("local", spec.local.is_some()),
        ("iscsi", spec.iscsi.is_some()),
        ("fc", spec.fc.is_some()),
        ("rbd", spec.rbd.is_some()),
        ("cephfs", spec.cephfs.is_some()),
        ("glusterfs", spec.glusterfs.is_some()),
        ("aws_elastic_block_store", spec.aws_elastic_block_store.is_some()),
        ("gce_persistent_disk", spec.gce_persistent_disk.is_some()),
        ("azure_disk", spec.azure_disk.is_some()),
        ("azure_file", spec.azure_file.is_some()),
        ("cinder", spec.cinder.is_some()),
        ("vsphere_volume", spec.vsphere_volume.is_some()),
    ];
    sources
        .into_iter()
        .find_map(|(name, present)| present.then_some(name))
}
