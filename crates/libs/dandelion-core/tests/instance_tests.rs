#![allow(clippy::unwrap_used)]

mod common;

use common::test_env;
use dandelion_core::model::instance::{InstanceStatus, InstanceStatusBmc, state};

fn status(app: &str, host: &str, instance: &str, config_id: i64, st: i64) -> InstanceStatus {
    InstanceStatus {
        app_id: app.to_string(),
        host: host.to_string(),
        instance_id: instance.to_string(),
        config_id,
        commit_id: "c0ffee".to_string(),
        status: st,
        ..InstanceStatus::default()
    }
}

async fn count_rows(mm: &dandelion_core::ModelManager) -> i64 {
    let stmt = mm
        .db_for_test()
        .prepare("SELECT COUNT(*) FROM dandelion_app_instances")
        .await
        .unwrap();
    let mut rows = stmt.query(()).await.unwrap();
    rows.next().await.unwrap().unwrap().get(0).unwrap()
}

#[tokio::test]
async fn test_repeated_status_upserts_single_row() {
    let env = test_env(&[("app1", &[("a.conf", "1\n")])]).await;

    InstanceStatusBmc::upsert_status(&env.mm, &status("app1", "h1", "i1", 1, state::CHECKING))
        .await
        .unwrap();
    InstanceStatusBmc::upsert_status(&env.mm, &status("app1", "h1", "i1", 1, state::SYNCING))
        .await
        .unwrap();
    InstanceStatusBmc::upsert_status(&env.mm, &status("app1", "h1", "i1", 1, state::SUCCESS))
        .await
        .unwrap();

    assert_eq!(count_rows(&env.mm).await, 1);

    let listed = InstanceStatusBmc::list_active(&env.mm, "app1").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, state::SUCCESS);
    assert_eq!(listed[0].config_id, 1);
    // created_time survives updates
    assert!(listed[0].created_time > 0);
    assert!(listed[0].updated_time >= listed[0].created_time);
}

#[tokio::test]
async fn test_status_config_change_rewrites_all_fields() {
    let env = test_env(&[("app1", &[("a.conf", "1\n")])]).await;

    InstanceStatusBmc::upsert_status(&env.mm, &status("app1", "h1", "i1", 1, state::SUCCESS))
        .await
        .unwrap();

    let mut next = status("app1", "h1", "i1", 2, state::SUCCESS);
    next.commit_id = "deadbeef".to_string();
    InstanceStatusBmc::upsert_status(&env.mm, &next).await.unwrap();

    let listed = InstanceStatusBmc::list_active(&env.mm, "app1").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].config_id, 2);
    assert_eq!(listed[0].commit_id, "deadbeef");
}

#[tokio::test]
async fn test_distinct_instances_get_distinct_rows() {
    let env = test_env(&[("app1", &[("a.conf", "1\n")])]).await;

    InstanceStatusBmc::upsert_status(&env.mm, &status("app1", "h1", "i1", 1, state::SUCCESS))
        .await
        .unwrap();
    InstanceStatusBmc::upsert_status(&env.mm, &status("app1", "h1", "i2", 1, state::SUCCESS))
        .await
        .unwrap();
    InstanceStatusBmc::upsert_status(&env.mm, &status("app1", "h2", "i1", 1, state::SUCCESS))
        .await
        .unwrap();

    assert_eq!(count_rows(&env.mm).await, 3);
}

#[tokio::test]
async fn test_offline_derived_without_mutating_storage() {
    let env = test_env(&[("app1", &[("a.conf", "1\n")])]).await;

    InstanceStatusBmc::upsert_status(&env.mm, &status("app1", "h1", "i1", 1, state::SUCCESS))
        .await
        .unwrap();
    // age the heartbeat past the five-minute threshold
    env.mm
        .db_for_test()
        .execute(
            "UPDATE dandelion_app_instances SET updated_time = updated_time - 600",
            (),
        )
        .await
        .unwrap();

    let listed = InstanceStatusBmc::list_active(&env.mm, "app1").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, state::OFFLINE);

    // the stored status is untouched
    let stmt = env
        .mm
        .db_for_test()
        .prepare("SELECT status FROM dandelion_app_instances")
        .await
        .unwrap();
    let mut rows = stmt.query(()).await.unwrap();
    let stored: i64 = rows.next().await.unwrap().unwrap().get(0).unwrap();
    assert_eq!(stored, state::SUCCESS);
}

#[tokio::test]
async fn test_stale_rows_fall_out_of_listing() {
    let env = test_env(&[("app1", &[("a.conf", "1\n")])]).await;

    InstanceStatusBmc::upsert_status(&env.mm, &status("app1", "h1", "i1", 1, state::SUCCESS))
        .await
        .unwrap();
    env.mm
        .db_for_test()
        .execute(
            "UPDATE dandelion_app_instances SET updated_time = updated_time - 90000",
            (),
        )
        .await
        .unwrap();

    let listed = InstanceStatusBmc::list_active(&env.mm, "app1").await.unwrap();
    assert!(listed.is_empty());
}

#[tokio::test]
async fn test_ping_refreshes_known_rows_only() {
    let env = test_env(&[("app1", &[("a.conf", "1\n")])]).await;

    InstanceStatusBmc::upsert_status(&env.mm, &status("app1", "h1", "i1", 1, state::SUCCESS))
        .await
        .unwrap();

    // one known row, one unknown: ping must not create the unknown one
    let known = status("app1", "h1", "i1", 1, state::SUCCESS);
    let unknown = status("app1", "h9", "i9", 1, state::SUCCESS);
    InstanceStatusBmc::refresh_ping(&env.mm, &[known, unknown])
        .await
        .unwrap();

    assert_eq!(count_rows(&env.mm).await, 1);
}
