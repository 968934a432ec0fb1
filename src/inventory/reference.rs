//! Heuristics for turning Kubernetes pod-spec/status image fields into
//! the canonical image name an operator would actually type (spec
//! §4.2, step 2c). Grounded in `k8s-inventory.py`'s container-status
//! image-name resolution.

use std::collections::HashMap;

/// Build `digest → repo:tag` from every container image reference in a
/// pod spec that carries an explicit digest (`repo:tag@sha256:...`).
/// Used to reverse-resolve digest-only status references.
pub fn digest_prefix_map(container_images: &[String]) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for image in container_images {
        if let Some((prefix, digest)) = image.split_once('@') {
            map.insert(digest.to_string(), prefix.to_string());
        }
    }
    map
}

/// Decide a canonical image name for one container status, returning
/// `(name, recovered_digest)`.
pub fn canonical_container_image(
    status_image: &str,
    status_image_id: &str,
    image_by_digest: &HashMap<String, String>,
    sole_container_image: Option<&str>,
) -> (String, Option<String>) {
    let mut image_name = if status_image.contains('/') {
        status_image.to_string()
    } else {
        status_image_id.to_string()
    };

    let mut digest = None;
    if !image_by_digest.is_empty() {
        if let Some((_, d)) = image_name.split_once('@') {
            digest = Some(d.to_string());
            if let Some(rewritten) = image_by_digest.get(d) {
                image_name = rewritten.clone();
            }
        }
    }

    if image_name.contains('@') {
        if let Some(sole) = sole_container_image {
            image_name = sole.to_string();
        }
    }

    (image_name, digest)
}
