//! End-to-end `RegistryClient::connect` scenarios against an in-process
//! mock registry.

mod common;

use std::time::Duration;

use registry_janitor::error::CoreError;
use registry_janitor::registry::RegistryClient;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn connect_succeeds_on_a_200_probe() {
    let server = common::start_mock_registry().await;
    let host = common::mock_host(&server);

    let result = RegistryClient::connect(&host, Duration::from_secs(5)).await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn connect_fails_with_registry_unavailable_on_a_non_200_probe() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let host = server.uri();

    let err = RegistryClient::connect(&host, Duration::from_secs(5))
        .await
        .unwrap_err();

    match err {
        CoreError::RegistryUnavailable { host: err_host, reason, source } => {
            assert_eq!(err_host, host);
            assert!(reason.contains("503"));
            assert!(source.is_none());
        },
        other => panic!("expected RegistryUnavailable, got {other:?}"),
    }
}
