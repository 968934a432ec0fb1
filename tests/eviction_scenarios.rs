//! End-to-end Evictor scenarios against an in-process mock
//! registry.

mod common;

use std::time::Duration;

use registry_janitor::evict::{EvictionAction, Evictor};
use registry_janitor::keeprules::Ruleset;
use registry_janitor::model::{ImageUsage, KeepDecision, KeepRule};
use registry_janitor::registry::RegistryClient;
use tokio_util::sync::CancellationToken;

async fn mount_repo(server: &wiremock::MockServer, repo: &str, tags: &[(&str, &str, &str)]) {
    let names: Vec<&str> = tags.iter().map(|(tag, _, _)| *tag).collect();
    common::mount_tags(server, repo, &names).await;
    for (tag, digest, created) in tags {
        common::mount_manifest(server, repo, tag, digest, created).await;
    }
}

fn action_of<'a>(log: &'a [registry_janitor::evict::EvictionLogEntry], tag: &str) -> &'a EvictionAction {
    &log.iter().find(|e| e.tag == tag).unwrap().action
}

#[tokio::test]
async fn eviction_preserves_newest_three() {
    let server = common::start_mock_registry().await;
    mount_repo(
        &server,
        "svc/a",
        &[
            ("t1", "d1", "2024-01-01T00:00:00Z"),
            ("t2", "d2", "2024-01-02T00:00:00Z"),
            ("t3", "d3", "2024-01-03T00:00:00Z"),
            ("t4", "d4", "2024-01-04T00:00:00Z"),
            ("t5", "d5", "2024-01-05T00:00:00Z"),
        ],
    )
    .await;
    common::mount_delete(&server, "svc/a", "d1", 202).await;
    common::mount_delete(&server, "svc/a", "d2", 202).await;

    let host = common::mock_host(&server);
    let registry = RegistryClient::connect(&host, Duration::from_secs(5)).await.unwrap();
    let rules = Ruleset::load(vec![]).unwrap();
    // One occurrence against the newest tag marks the repo as in use,
    // selecting the `delete_most_manifests` policy; the
    // ramp it adds falls entirely within the newest-three already kept.
    let reference = format!("{host}/svc/a:t5");
    let usage = common::usage_with_occurrence(
        &reference,
        "prod",
        "ns1",
        "pod-a",
        registry_janitor::model::PhaseFlags {
            running: true,
            ..Default::default()
        },
        0.0,
    );
    let cancel = CancellationToken::new();

    let evictor = Evictor::new(&registry, &host, &rules, &usage, false, &cancel);
    let log = evictor
        .evict_all(Some(vec!["svc/a".to_string()]))
        .await
        .unwrap();

    assert_eq!(action_of(&log, "t1"), &EvictionAction::Deleted);
    assert_eq!(action_of(&log, "t2"), &EvictionAction::Deleted);
    assert_eq!(action_of(&log, "t3"), &EvictionAction::Kept);
    assert_eq!(action_of(&log, "t4"), &EvictionAction::Kept);
    assert_eq!(action_of(&log, "t5"), &EvictionAction::Kept);
}

#[tokio::test]
async fn in_use_backing_ramp_keeps_three_either_side() {
    let server = common::start_mock_registry().await;
    let tags = [
        ("t1", "d1", "2024-01-01T00:00:00Z"),
        ("t2", "d2", "2024-01-02T00:00:00Z"),
        ("t3", "d3", "2024-01-03T00:00:00Z"),
        ("t4", "d4", "2024-01-04T00:00:00Z"),
        ("t5", "d5", "2024-01-05T00:00:00Z"),
        ("t6", "d6", "2024-01-06T00:00:00Z"),
        ("t7", "d7", "2024-01-07T00:00:00Z"),
    ];
    mount_repo(&server, "svc/a", &tags).await;
    common::mount_delete(&server, "svc/a", "d1", 202).await;
    common::mount_delete(&server, "svc/a", "d2", 202).await;

    let host = common::mock_host(&server);
    let registry = RegistryClient::connect(&host, Duration::from_secs(5)).await.unwrap();
    let rules = Ruleset::load(vec![]).unwrap();

    let reference = format!("{host}/svc/a:t5");
    let usage = common::usage_with_occurrence(
        &reference,
        "prod",
        "ns1",
        "pod-a",
        registry_janitor::model::PhaseFlags {
            running: true,
            ..Default::default()
        },
        0.0,
    );
    let cancel = CancellationToken::new();

    let evictor = Evictor::new(&registry, &host, &rules, &usage, false, &cancel);
    let log = evictor
        .evict_all(Some(vec!["svc/a".to_string()]))
        .await
        .unwrap();

    for tag in ["t3", "t4", "t5", "t6", "t7"] {
        assert_eq!(action_of(&log, tag), &EvictionAction::Kept, "{tag} should be kept");
    }
    for tag in ["t1", "t2"] {
        assert_eq!(action_of(&log, tag), &EvictionAction::Deleted, "{tag} should be deleted");
    }
}

#[tokio::test]
async fn digest_aliasing_spares_the_older_alias() {
    let server = common::start_mock_registry().await;
    mount_repo(
        &server,
        "svc/a",
        &[
            ("a", "D1", "2024-01-01T00:00:00Z"),
            ("b", "D2", "2024-01-02T00:00:00Z"),
            ("c", "D3", "2024-01-03T00:00:00Z"),
            ("d", "D1", "2024-01-04T00:00:00Z"),
        ],
    )
    .await;

    let host = common::mock_host(&server);
    let registry = RegistryClient::connect(&host, Duration::from_secs(5)).await.unwrap();
    let rules = Ruleset::load(vec![]).unwrap();
    // `d` is in use, selecting `delete_most_manifests`; newest-three is
    // already `{b, c, d}`, so the ramp adds nothing new, and `a` is
    // spared purely by sharing digest D1 with kept tag `d`.
    let reference = format!("{host}/svc/a:d");
    let usage = common::usage_with_occurrence(
        &reference,
        "prod",
        "ns1",
        "pod-a",
        registry_janitor::model::PhaseFlags {
            running: true,
            ..Default::default()
        },
        0.0,
    );
    let cancel = CancellationToken::new();

    let evictor = Evictor::new(&registry, &host, &rules, &usage, false, &cancel);
    let log = evictor
        .evict_all(Some(vec!["svc/a".to_string()]))
        .await
        .unwrap();

    for tag in ["a", "b", "c", "d"] {
        assert_eq!(action_of(&log, tag), &EvictionAction::Kept, "{tag} should be kept");
    }
}

#[tokio::test]
async fn unused_repo_with_keep_all_rule_is_never_touched() {
    let server = common::start_mock_registry().await;
    mount_repo(&server, "infra/base", &[("v1", "d1", "2024-01-01T00:00:00Z")]).await;
    // No DELETE mock registered: any delete attempt would 404/panic the
    // mock server's expectation, proving nothing was deleted.

    let host = common::mock_host(&server);
    let registry = RegistryClient::connect(&host, Duration::from_secs(5)).await.unwrap();
    let rules = Ruleset::load(vec![KeepRule {
        pattern: "^infra/".to_string(),
        keep: KeepDecision::All,
    }])
    .unwrap();
    let usage = ImageUsage::new();
    let cancel = CancellationToken::new();

    let evictor = Evictor::new(&registry, &host, &rules, &usage, false, &cancel);
    let log = evictor
        .evict_all(Some(vec!["infra/base".to_string()]))
        .await
        .unwrap();

    assert_eq!(action_of(&log, "v1"), &EvictionAction::Kept);
}

#[tokio::test]
async fn dry_run_logs_deletions_without_issuing_them() {
    let server = common::start_mock_registry().await;
    mount_repo(
        &server,
        "svc/a",
        &[
            ("t1", "d1", "2024-01-01T00:00:00Z"),
            ("t2", "d2", "2024-01-02T00:00:00Z"),
            ("t3", "d3", "2024-01-03T00:00:00Z"),
            ("t4", "d4", "2024-01-04T00:00:00Z"),
        ],
    )
    .await;
    // No DELETE mock: a dry run issuing a real DELETE would fail to match.

    let host = common::mock_host(&server);
    let registry = RegistryClient::connect(&host, Duration::from_secs(5)).await.unwrap();
    let rules = Ruleset::load(vec![]).unwrap();
    let usage = ImageUsage::new();
    let cancel = CancellationToken::new();

    let evictor = Evictor::new(&registry, &host, &rules, &usage, true, &cancel);
    let log = evictor
        .evict_all(Some(vec!["svc/a".to_string()]))
        .await
        .unwrap();

    let t1 = log.iter().find(|e| e.tag == "t1").unwrap();
    assert_eq!(t1.action, EvictionAction::Deleted);
    assert!(t1.dry_run);
}
