mod common;

use common::{cluster, fast_settings, harness, harness_with, sorted};
use fleet_common::{AuthType, EngineError, KeyPair, Tag, TAG_CLUSTER_NAME, TAG_TASK_ID};
use fleet_orchestrator::params::engine_tags;
use fleet_orchestrator::EngineSettings;
use fleet_providers::mock::{CallMatch, FaultKind, MockProvider};
use std::time::Duration;

#[tokio::test]
async fn test_expand_splits_into_capped_batches() {
    let h = harness();
    let report = h.engine.expand(&cluster("web"), &engine_tags(1, "web"), 250).await;

    assert!(report.is_ok());
    assert_eq!(report.instance_ids.len(), 250);
    assert_eq!(sorted(h.mock.create_calls()), vec![50, 100, 100]);
}

#[tokio::test]
async fn test_expand_batch_sizes_follow_settings() {
    let settings = EngineSettings {
        batch_max: 7,
        ..fast_settings()
    };
    let h = harness_with(MockProvider::new("local"), settings);
    let report = h.engine.expand(&cluster("web"), &[], 30).await;

    assert_eq!(report.instance_ids.len(), 30);
    let calls = h.mock.create_calls();
    assert_eq!(calls.len(), 5);
    assert_eq!(calls.iter().sum::<usize>(), 30);
}

#[tokio::test]
async fn test_expand_zero_contacts_nobody() {
    let h = harness();
    let report = h.engine.expand(&cluster("web"), &[], 0).await;

    assert!(report.is_ok());
    assert!(report.instance_ids.is_empty());
    assert!(h.mock.create_calls().is_empty());
    assert_eq!(h.engine.registry().cached_len(), 0);
}

#[tokio::test]
async fn test_expand_keeps_ids_from_healthy_batches() {
    let h = harness();
    h.mock.inject_create_fault(CallMatch::Size(100), FaultKind::Reject);

    let report = h.engine.expand(&cluster("web"), &[], 250).await;

    assert_eq!(report.instance_ids.len(), 150);
    assert!(report.is_partial_success());
    match report.error {
        Some(EngineError::PartialFailure {
            requested,
            obtained,
            ref causes,
        }) => {
            assert_eq!((requested, obtained), (250, 150));
            assert_eq!(causes.len(), 1);
            assert!(matches!(causes[0], EngineError::Vendor { .. }));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_expand_survives_a_panicking_unit() {
    let h = harness();
    h.mock.inject_create_fault(CallMatch::Nth(2), FaultKind::Panic);

    let report = h.engine.expand(&cluster("web"), &[], 400).await;

    assert_eq!(report.instance_ids.len(), 300);
    let err = report.error.expect("a unit faulted");
    assert!(err
        .causes()
        .iter()
        .any(|c| matches!(c, EngineError::UnitFault { .. })));
}

#[tokio::test]
async fn test_expand_collects_every_unit_error() {
    let h = harness();
    h.mock.inject_create_fault(CallMatch::Size(100), FaultKind::Reject);
    h.mock.inject_create_fault(CallMatch::Size(100), FaultKind::Reject);
    h.mock.inject_create_fault(CallMatch::Size(50), FaultKind::Panic);

    let report = h.engine.expand(&cluster("web"), &[], 250).await;

    assert!(report.instance_ids.is_empty());
    assert!(!report.is_partial_success());
    assert_eq!(report.error.expect("all units failed").causes().len(), 3);
}

#[tokio::test]
async fn test_expand_stamps_tags() {
    let h = harness();
    let mut c = cluster("web");
    c.tags = vec![Tag::new("team", "infra"), Tag::new(TAG_CLUSTER_NAME, "spoofed")];

    let report = h.engine.expand(&c, &engine_tags(9, "web"), 2).await;
    let instance = h.mock.instance(&report.instance_ids[0]).expect("created");

    assert!(instance.tags.contains(&Tag::new(TAG_TASK_ID, "9")));
    assert!(instance.tags.contains(&Tag::new(TAG_CLUSTER_NAME, "web")));
    assert!(instance.tags.contains(&Tag::new("team", "infra")));
    assert!(!instance.tags.contains(&Tag::new(TAG_CLUSTER_NAME, "spoofed")));
}

#[tokio::test]
async fn test_expand_in_deed_retries_only_the_missing_count() {
    let h = harness();
    h.mock.inject_create_fault(CallMatch::Size(100), FaultKind::Reject);

    let report = h.engine.expand_in_deed(&cluster("web"), 250, 11).await;

    assert!(report.is_ok());
    assert_eq!(report.instance_ids.len(), 250);
    let calls = h.mock.create_calls();
    // first attempt: three batches; second attempt: the lost 100
    assert_eq!(calls.len(), 4);
    assert_eq!(calls[3], 100);
}

#[tokio::test]
async fn test_expand_in_deed_halts_once_target_is_met() {
    let h = harness();
    let report = h.engine.expand_in_deed(&cluster("web"), 20, 12).await;

    assert!(report.is_ok());
    assert_eq!(report.instance_ids.len(), 20);
    assert_eq!(h.mock.create_calls(), vec![20]);
}

#[tokio::test]
async fn test_expand_in_deed_returns_last_error_after_budget() {
    let h = harness();
    for _ in 0..3 {
        h.mock.inject_create_fault(CallMatch::Size(5), FaultKind::Reject);
    }

    let report = h.engine.expand_in_deed(&cluster("web"), 5, 13).await;

    assert!(report.instance_ids.is_empty());
    assert!(matches!(report.error, Some(EngineError::PartialFailure { .. })));
    assert_eq!(h.mock.create_calls(), vec![5, 5, 5]);
}

#[tokio::test]
async fn test_expand_in_deed_stops_on_config_error() {
    let h = harness();
    let mut c = cluster("web");
    c.provider = "OracleCloud".to_string();

    let report = h.engine.expand_in_deed(&c, 5, 14).await;

    assert!(report.error.expect("unsupported").is_config());
    assert!(h.mock.create_calls().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_expansions_share_one_client() {
    let h = harness_with(
        MockProvider::new("local").with_create_delay(Duration::from_millis(5)),
        fast_settings(),
    );
    let mut handles = Vec::new();
    for task_id in 0..8 {
        let engine = h.engine.clone();
        handles.push(tokio::spawn(async move {
            engine.expand_in_deed(&cluster("web"), 3, task_id).await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().instance_ids.len(), 3);
    }

    assert_eq!(h.builds(), 1);
    assert_eq!(h.engine.registry().cached_len(), 1);
    assert_eq!(h.mock.instance_ids().len(), 24);
}

#[tokio::test]
async fn test_check_cluster_params_is_a_dry_run() {
    let h = harness();
    h.engine.check_cluster_params(&cluster("web")).await.unwrap();
    assert_eq!(h.mock.dry_runs(), 1);
    assert!(h.mock.instance_ids().is_empty());

    let mut bad = cluster("web");
    bad.image.clear();
    let err = h.engine.check_cluster_params(&bad).await.unwrap_err();
    assert!(matches!(err, EngineError::Vendor { .. }));
}

#[tokio::test]
async fn test_record_instances_writes_pending_rows() {
    let h = harness();
    let c = cluster("web");
    let ids = h.engine.expand_in_deed(&c, 3, 21).await.instance_ids;
    h.engine.record_instances(&c, Some(21), &ids).await.unwrap();

    let rows = h.store.snapshot();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.task_id == Some(21) && r.cluster_name == "web"));
}

#[tokio::test]
async fn test_expand_in_deed_never_returns_more_than_requested() {
    let h = harness_with(MockProvider::new("local").with_over_delivery(1), fast_settings());
    let c = cluster("web");

    let report = h.engine.expand_in_deed(&c, 5, 15).await;

    assert!(report.is_ok());
    assert_eq!(report.instance_ids.len(), 5);
    assert_eq!(h.mock.instance_ids().len(), 6);

    // The extra instance is tagged with the task and reaped by repair.
    h.engine.record_instances(&c, Some(15), &report.instance_ids).await.unwrap();
    let alive = h
        .engine
        .repair_cluster(&c, 15, &report.instance_ids, &report.instance_ids)
        .await;
    assert_eq!(alive, 5);
    assert_eq!(h.mock.delete_calls().len(), 1);
    assert_eq!(h.mock.delete_calls()[0].len(), 1);
    assert!(!report.instance_ids.contains(&h.mock.delete_calls()[0][0]));
}

#[tokio::test]
async fn test_expand_caps_each_attempt_across_batches() {
    let settings = EngineSettings {
        batch_max: 4,
        ..fast_settings()
    };
    let h = harness_with(MockProvider::new("local").with_over_delivery(2), settings);

    let report = h.engine.expand(&cluster("web"), &[], 10).await;

    assert!(report.is_ok());
    assert_eq!(report.instance_ids.len(), 10);
    assert_eq!(h.mock.instance_ids().len(), 16);
}

#[tokio::test]
async fn test_expand_in_deed_retries_after_key_pair_lookup_failure() {
    let h = harness();
    h.store.add_key_pair(KeyPair {
        id: 3,
        provider: "Mock".into(),
        region_id: "local".into(),
        key_pair_name: "ops".into(),
        key_pair_id: "kp-3".into(),
        public_key: "ssh-ed25519 AAAA".into(),
        private_key: String::new(),
        key_type: "ed25519".into(),
    });
    let mut c = cluster("web");
    c.auth_type = AuthType::KeyPair;
    c.key_id = Some(3);
    h.store.fail_key_pair_lookups(1);

    let report = h.engine.expand_in_deed(&c, 5, 16).await;

    assert!(report.is_ok());
    assert_eq!(report.instance_ids.len(), 5);
    assert_eq!(h.mock.create_calls(), vec![5]);
}

#[tokio::test]
async fn test_expand_in_deed_stops_on_missing_key_pair() {
    let h = harness();
    let mut c = cluster("web");
    c.auth_type = AuthType::KeyPair;
    c.key_id = Some(404);

    let report = h.engine.expand_in_deed(&c, 5, 17).await;

    assert!(report.error.expect("no such key pair").is_config());
    assert!(h.mock.create_calls().is_empty());
}
