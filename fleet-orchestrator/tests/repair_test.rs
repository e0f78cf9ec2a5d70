mod common;

use common::{cluster, harness};
use fleet_common::{CloudInstance, InstanceStatus, ProviderType, Tag, TAG_TASK_ID};

fn s(v: &[&str]) -> Vec<String> {
    v.iter().map(|x| x.to_string()).collect()
}

#[tokio::test]
async fn test_repair_without_drift_changes_nothing() {
    let h = harness();
    let c = cluster("web");
    let ids = h.engine.expand_in_deed(&c, 5, 7).await.instance_ids;
    h.engine.record_instances(&c, Some(7), &ids).await.unwrap();

    let alive = h.engine.repair_cluster(&c, 7, &ids, &ids).await;

    assert_eq!(alive, 5);
    assert!(h.mock.delete_calls().is_empty());
    assert_eq!(h.store.soft_delete_calls(), 0);
    assert_eq!(h.mock.instance_ids().len(), 5);
}

#[tokio::test]
async fn test_repair_deletes_leaked_and_marks_lost() {
    let h = harness();
    let c = cluster("web");
    let ids = h.engine.expand_in_deed(&c, 5, 8).await.instance_ids;
    let mut recorded = ids.clone();
    recorded.push("i-stale".to_string());
    h.engine.record_instances(&c, Some(8), &recorded).await.unwrap();

    // The caller only knows about three; the vendor lost the first of them.
    let available = ids[..3].to_vec();
    assert!(h.mock.remove_instance(&ids[0]));
    let mut all = available.clone();
    all.push("i-stale".to_string());

    let alive = h.engine.repair_cluster(&c, 8, &available, &all).await;

    assert_eq!(alive, 2);
    assert_eq!(h.mock.delete_calls().len(), 1);
    let mut leaked = h.mock.delete_calls()[0].clone();
    leaked.sort();
    let mut expected = ids[3..].to_vec();
    expected.sort();
    assert_eq!(leaked, expected);

    let mut left = h.mock.instance_ids();
    left.sort();
    let mut survivors = ids[1..3].to_vec();
    survivors.sort();
    assert_eq!(left, survivors);

    for id in [ids[0].as_str(), "i-stale"] {
        let row = h.store.instance(id).expect("recorded");
        assert_eq!(row.status, InstanceStatus::Deleted);
        assert!(row.deleted_at.is_some());
        assert_eq!(row.updated_at, row.deleted_at);
    }
    for id in &ids[1..3] {
        assert_eq!(h.store.instance(id).expect("recorded").deleted_at, None);
    }
}

#[tokio::test]
async fn test_repair_twice_is_idempotent() {
    let h = harness();
    let c = cluster("web");
    let ids = h.engine.expand_in_deed(&c, 4, 9).await.instance_ids;
    h.engine.record_instances(&c, Some(9), &ids).await.unwrap();
    h.mock.remove_instance(&ids[0]);
    let available = ids.clone();

    let first = h.engine.repair_cluster(&c, 9, &available, &ids).await;
    let snapshot = h.store.snapshot();
    let second = h.engine.repair_cluster(&c, 9, &available, &ids).await;

    assert_eq!((first, second), (3, 3));
    assert_eq!(h.store.snapshot(), snapshot);
    assert!(h.mock.delete_calls().is_empty());
    let deleted: Vec<_> = snapshot.iter().filter(|r| r.is_deleted()).collect();
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].instance_id, ids[0]);
}

#[tokio::test]
async fn test_repair_retries_vendor_delete() {
    let h = harness();
    let c = cluster("web");
    h.mock.insert_instance(CloudInstance {
        id: "i-leaked".into(),
        provider: Some(ProviderType::Mock),
        status: "Running".into(),
        tags: vec![Tag::new(TAG_TASK_ID, "10")],
        ..Default::default()
    });
    h.mock.fail_deletes(2);

    let alive = h.engine.repair_cluster(&c, 10, &[], &[]).await;

    assert_eq!(alive, 0);
    assert_eq!(h.mock.delete_calls().len(), 3);
    assert!(h.mock.instance_ids().is_empty());
}

#[tokio::test]
async fn test_repair_gives_up_after_three_attempts() {
    let h = harness();
    let c = cluster("web");
    let ids = h.engine.expand_in_deed(&c, 2, 11).await.instance_ids;
    h.engine.record_instances(&c, Some(11), &ids).await.unwrap();
    h.mock.remove_instance(&ids[1]);
    h.store.fail_soft_deletes(5);

    let alive = h.engine.repair_cluster(&c, 11, &ids, &ids).await;

    assert_eq!(alive, 1);
    assert_eq!(h.store.soft_delete_calls(), 3);
    assert_eq!(h.store.instance(&ids[1]).expect("recorded").deleted_at, None);
}

#[tokio::test]
async fn test_repair_treats_failed_tag_query_as_empty_cloud() {
    let h = harness();
    let c = cluster("web");
    let ids = h.engine.expand_in_deed(&c, 2, 12).await.instance_ids;
    h.engine.record_instances(&c, Some(12), &ids).await.unwrap();
    h.mock.fail_tag_queries(true);

    let alive = h.engine.repair_cluster(&c, 12, &ids, &ids).await;

    assert_eq!(alive, 0);
    assert!(h.mock.delete_calls().is_empty());
    assert!(ids.iter().all(|id| h.store.instance(id).unwrap().is_deleted()));
}

#[tokio::test]
async fn test_repair_tolerates_ids_missing_from_all() {
    let h = harness();
    let c = cluster("web");
    let ids = h.engine.expand_in_deed(&c, 2, 13).await.instance_ids;

    // `all` lacks one of the available ids; nothing is lost on the vendor side.
    let alive = h.engine.repair_cluster(&c, 13, &ids, &ids[..1]).await;

    assert_eq!(alive, 2);
    assert_eq!(h.store.soft_delete_calls(), 0);
}

#[tokio::test]
async fn test_shrink_empty_is_a_no_op() {
    let h = harness();
    h.engine.shrink(&cluster("web"), &[]).await.unwrap();
    assert_eq!(h.engine.registry().cached_len(), 0);
    assert!(h.mock.delete_calls().is_empty());

    let ids = h.engine.expand_in_deed(&cluster("web"), 3, 14).await.instance_ids;
    h.engine.shrink(&cluster("web"), &ids).await.unwrap();
    assert_eq!(h.mock.delete_calls(), vec![ids]);
    assert!(h.mock.instance_ids().is_empty());

    h.mock.fail_deletes(1);
    assert!(h.engine.shrink(&cluster("web"), &s(&["i-x"])).await.is_err());
}
