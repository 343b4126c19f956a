//! Container image references
//!
//! Turns `registry.example.com:5000/team/app:1.2@sha256:...` (and the
//! `docker-pullable://` image IDs kubelet reports) into parts. Images are
//! content-addressed: the digest, when known, is the identity.

/// Default port assumed when an image names a registry host without a port
pub const DEFAULT_REGISTRY_PORT: u16 = 443;

const IMAGE_ID_PREFIXES: [&str; 3] = ["docker-pullable://", "docker://", "containerd://"];

/// Parsed image reference
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageRef {
    /// Registry host, if the reference names one
    pub registry_host: Option<String>,
    /// Registry port
    pub registry_port: Option<u16>,
    /// Repository path without registry, tag or digest
    pub name: String,
    /// Tag, if any
    pub tag: Option<String>,
    /// Digest (`sha256:...`), if any
    pub digest: Option<String>,
}

impl ImageRef {
    /// Parse an image reference as written in a pod spec
    pub fn parse(reference: &str) -> Option<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return None;
        }

        let (rest, digest) = match reference.split_once('@') {
            Some((rest, digest)) if !digest.is_empty() => (rest, Some(digest.to_string())),
            Some(_) => return None,
            None => (reference, None),
        };

        // The first path component is a registry if it looks like a host
        let (registry, path) = match rest.split_once('/') {
            Some((first, path))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (Some(first), path)
            }
            _ => (None, rest),
        };

        // A tag colon only counts after the last slash
        let last_slash = path.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match path[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&path[..split], Some(path[split + 1..].to_string()))
            }
            None => (path, None),
        };
        if name.is_empty() {
            return None;
        }

        let (registry_host, registry_port) = match registry {
            Some(r) => match r.rsplit_once(':') {
                Some((host, port)) => (Some(host.to_string()), Some(port.parse().ok()?)),
                None => (Some(r.to_string()), Some(DEFAULT_REGISTRY_PORT)),
            },
            None => (None, None),
        };

        Some(Self {
            registry_host,
            registry_port,
            name: name.to_string(),
            tag,
            digest,
        })
    }

    /// Fill in the digest from the image ID kubelet reports, if we lack one
    pub fn with_image_id(mut self, image_id: Option<&str>) -> Self {
        if self.digest.is_none() {
            self.digest = image_id.and_then(digest_from_image_id);
        }
        self
    }

    /// Registry key as `host:port`
    pub fn registry_key(&self) -> Option<(String, u16)> {
        Some((self.registry_host.clone()?, self.registry_port?))
    }

    /// Full name including registry and tag
    pub fn full_name(&self) -> String {
        let mut out = String::new();
        if let (Some(host), Some(port)) = (&self.registry_host, self.registry_port) {
            out.push_str(host);
            if port != DEFAULT_REGISTRY_PORT {
                out.push_str(&format!(":{port}"));
            }
            out.push('/');
        }
        out.push_str(&self.name);
        out.push(':');
        out.push_str(self.tag.as_deref().unwrap_or("latest"));
        out
    }

    /// Content identity: the digest when known, the full name otherwise
    pub fn content_identity(&self) -> String {
        match &self.digest {
            Some(digest) => digest.clone(),
            None => self.full_name(),
        }
    }
}

/// Extract `sha256:...` from an image ID like `docker-pullable://repo@sha256:...`
pub fn digest_from_image_id(image_id: &str) -> Option<String> {
    let stripped = IMAGE_ID_PREFIXES
        .iter()
        .find_map(|p| image_id.strip_prefix(p))
        .unwrap_or(image_id);
    let digest = match stripped.split_once('@') {
        Some((_, digest)) => digest,
        None => stripped,
    };
    digest.starts_with("sha256:").then(|| digest.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_name() {
        let img = ImageRef::parse("nginx").unwrap();
        assert_eq!(img.name, "nginx");
        assert_eq!(img.tag, None);
        assert_eq!(img.registry_key(), None);
        assert_eq!(img.full_name(), "nginx:latest");
    }

    #[test]
    fn registry_with_port_tag_and_digest() {
        let img = ImageRef::parse("registry.local:5000/team/app:1.2@sha256:abc").unwrap();
        assert_eq!(img.registry_key(), Some(("registry.local".to_string(), 5000)));
        assert_eq!(img.name, "team/app");
        assert_eq!(img.tag.as_deref(), Some("1.2"));
        assert_eq!(img.content_identity(), "sha256:abc");
    }

    #[test]
    fn registry_without_port_defaults() {
        let img = ImageRef::parse("quay.io/coreos/etcd:v3.5").unwrap();
        assert_eq!(img.registry_key(), Some(("quay.io".to_string(), DEFAULT_REGISTRY_PORT)));
        assert_eq!(img.full_name(), "quay.io/coreos/etcd:v3.5");
    }

    #[test]
    fn first_component_without_dot_is_a_path() {
        let img = ImageRef::parse("library/redis:7").unwrap();
        assert_eq!(img.registry_host, None);
        assert_eq!(img.name, "library/redis");
    }

    #[test]
    fn localhost_registry() {
        let img = ImageRef::parse("localhost/app").unwrap();
        assert_eq!(img.registry_host.as_deref(), Some("localhost"));
        assert_eq!(img.name, "app");
    }

    #[test]
    fn image_id_supplies_digest() {
        let img = ImageRef::parse("nginx:1.25")
            .unwrap()
            .with_image_id(Some("docker-pullable://nginx@sha256:deadbeef"));
        assert_eq!(img.content_identity(), "sha256:deadbeef");

        let same = ImageRef::parse("docker.io/library/nginx@sha256:deadbeef").unwrap();
        assert_eq!(same.content_identity(), img.content_identity());
    }

    #[test]
    fn digest_extraction() {
        assert_eq!(
            digest_from_image_id("sha256:1234").as_deref(),
            Some("sha256:1234")
        );
        assert_eq!(digest_from_image_id("docker://abcd"), None);
    }

    #[test]
    fn invalid_references() {
        assert!(ImageRef::parse("").is_none());
        assert!(ImageRef::parse("nginx@").is_none());
        assert!(ImageRef::parse("host.io:notaport/app").is_none());
    }
}
