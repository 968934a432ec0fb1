//! Fixture builders shared by the integration tests: `ImageUsage`
//! snapshots and a `wiremock`-backed stand-in registry.

use registry_janitor::model::{ImageUsage, Occurrence, PhaseFlags, UsageRecord};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Build a single-occurrence `ImageUsage` for `reference`, with one
/// `(context, namespace, pod)` appearance carrying `phase`.
pub fn usage_with_occurrence(
    reference: &str,
    context: &str,
    namespace: &str,
    pod: &str,
    phase: PhaseFlags,
    last_wanted_days: f64,
) -> ImageUsage {
    let mut usage = ImageUsage::new();
    let mut record = UsageRecord {
        phase_any: phase,
        last_wanted_days,
        ..Default::default()
    };
    record.occurrences.insert(
        UsageRecord::occurrence_key(context, namespace, pod),
        Occurrence {
            phase,
            last_wanted_days,
            node: None,
        },
    );
    usage.insert(reference.to_string(), record);
    usage
}

/// Start a mock registry with the `/v2/` probe `RegistryClient::connect`
/// issues already mounted.
pub async fn start_mock_registry() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    server
}

/// The `host` string to hand to `RegistryClient::connect`/`Cli` for a
/// mock server: its full `http://127.0.0.1:port` URI, which
/// `RegistryClient::connect` recognizes as already carrying a scheme.
pub fn mock_host(server: &MockServer) -> String {
    server.uri()
}

pub fn manifest_body(created: &str) -> serde_json::Value {
    let v1compat = serde_json::json!({ "created": created }).to_string();
    serde_json::json!({ "history": [{ "v1Compatibility": v1compat }] })
}

pub async fn mount_manifest(server: &MockServer, repo: &str, reference: &str, digest: &str, created: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/v2/{repo}/manifests/{reference}")))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("docker-content-digest", digest)
                .insert_header(
                    "content-type",
                    "application/vnd.docker.distribution.manifest.v2+json",
                )
                .set_body_json(manifest_body(created)),
        )
        .mount(server)
        .await;
}

pub async fn mount_missing_manifest(server: &MockServer, repo: &str, reference: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/v2/{repo}/manifests/{reference}")))
        .respond_with(ResponseTemplate::new(404))
        .mount(server)
        .await;
}

pub async fn mount_tags(server: &MockServer, repo: &str, tags: &[&str]) {
    Mock::given(method("GET"))
        .and(path(format!("/v2/{repo}/tags/list")))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "tags": tags })))
        .mount(server)
        .await;
}

pub async fn mount_catalog(server: &MockServer, repos: &[&str]) {
    Mock::given(method("GET"))
        .and(path("/v2/_catalog"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "repositories": repos })),
        )
        .mount(server)
        .await;
}

pub async fn mount_delete(server: &MockServer, repo: &str, digest: &str, status: u16) {
    Mock::given(method("DELETE"))
        .and(path(format!("/v2/{repo}/manifests/{digest}")))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}
