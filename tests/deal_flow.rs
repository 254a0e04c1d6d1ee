// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

use std::sync::Arc;

use fil_vault::car::PackInput;
use fil_vault::client::MemoryNode;
use fil_vault::config::{CarConfig, DealConfig};
use fil_vault::deals::{deal_status, DealManager, DealParams, DealStatus};
use fil_vault::error::VaultError;
use fvm_shared::bigint::BigInt;

const MIB: u64 = 1 << 20;

fn deal_config() -> DealConfig {
    DealConfig {
        client_address: Some("f1client".to_string()),
        poll_attempts: 3,
        poll_base_delay_ms: 5,
        poll_max_delay_ms: 10,
        ..Default::default()
    }
}

fn manager(node: Arc<MemoryNode>) -> DealManager {
    DealManager::new(node, deal_config(), CarConfig::default())
}

fn three_providers() -> Arc<MemoryNode> {
    let node = Arc::new(MemoryNode::new(10_000));
    node.add_miner("f01003", 300_000_000_000, 1 << 40);
    node.add_miner("f01001", 100_000_000_000, 1 << 40);
    node.add_miner("f01002", 200_000_000_000, 1 << 40);
    node
}

#[tokio::test]
async fn cost_is_ranked_and_padded() {
    let deals = manager(three_providers());
    let estimate = deals
        .calculate_storage_cost(10 * MIB, 1_000, false)
        .await
        .unwrap();

    assert_eq!(estimate.padded_size, 16 * MIB);
    assert_eq!(estimate.size_gib, 1);
    let order: Vec<_> = estimate.providers.iter().map(|p| p.miner_id.as_str()).collect();
    assert_eq!(order, vec!["f01001", "f01002", "f01003"]);
    assert_eq!(estimate.min.atto(), &BigInt::from(100_000_000_000_000u64));
    assert_eq!(estimate.avg.atto(), &BigInt::from(200_000_000_000_000u64));
    assert_eq!(estimate.max.atto(), &BigInt::from(300_000_000_000_000u64));
    assert_eq!(estimate.providers[0].total_fil, "0.0001");
}

#[test]
fn status_window_boundaries() {
    assert_eq!(deal_status(99, 100, 200), DealStatus::Pending);
    assert_eq!(deal_status(100, 100, 200), DealStatus::Active);
    assert_eq!(deal_status(200, 100, 200), DealStatus::Active);
    assert_eq!(deal_status(201, 100, 200), DealStatus::Expired);
}

#[tokio::test]
async fn deals_across_providers_then_track_and_renew() {
    let node = three_providers();
    let deals = manager(node.clone());
    let providers = vec!["f01001".to_string(), "f01002".to_string()];
    let placed = deals
        .create_storage_deals(
            PackInput::Bytes(b"replicated payload".to_vec()),
            &DealParams::default(),
            &providers,
        )
        .await
        .unwrap();
    assert_eq!(placed.len(), 2);
    assert!(placed.iter().all(|d| d.status == DealStatus::Published));
    assert_eq!(placed[0].data_cid, placed[1].data_cid);
    assert_eq!(node.proposals().len(), 2);

    // move into the deal window
    let first = placed[0].clone();
    node.set_head(first.start_epoch + 1);
    let report = deals.check_deal_status(&first).await.unwrap();
    assert_eq!(report.status, DealStatus::Active);
    assert!(!report.renewal_recommended);

    // near the end the deal is due for renewal
    node.set_head(first.end_epoch - 10);
    let reports = deals.check_deal_statuses(&placed).await.unwrap();
    assert!(reports.iter().all(|r| r.renewal_recommended));
    let plan = deals.create_renewal_plan(&placed).await.unwrap();
    assert_eq!(plan.due_now.len(), 2);
    assert!(plan.expired.is_empty());

    let extended = deals.extend_deal(&first, 1_000).await.unwrap();
    assert_eq!(extended.status, DealStatus::Pending);
    assert_eq!(extended.piece_cid, first.piece_cid);
    assert_eq!(node.proposals().len(), 3);

    node.set_head(first.end_epoch + 1);
    let plan = deals.create_renewal_plan(&placed).await.unwrap();
    assert_eq!(plan.expired.len(), 2);
    assert!(deals.extend_deal(&first, 1_000).await.is_err());
}

#[tokio::test]
async fn never_published_deal_is_pending() {
    let node = three_providers();
    node.publish_after(None);
    let deal = manager(node.clone())
        .create_storage_deal(
            PackInput::Bytes(b"slow provider".to_vec()),
            &DealParams::with_provider("f01001"),
        )
        .await
        .unwrap();
    assert_eq!(deal.status, DealStatus::Pending);
    assert_eq!(deal.deal_id, None);
    assert_eq!(node.proposals().len(), 1);
}

#[tokio::test]
async fn all_providers_failing_is_exhausted() {
    let node = three_providers();
    node.set_reachable("f01001", false);
    node.set_reachable("f01002", false);
    let providers = vec!["f01001".to_string(), "f01002".to_string(), "f09999".to_string()];
    let err = manager(node)
        .create_storage_deals(
            PackInput::Bytes(b"nobody home".to_vec()),
            &DealParams::default(),
            &providers,
        )
        .await
        .unwrap_err();
    match err {
        VaultError::ExhaustedProviders { attempts } => {
            assert_eq!(attempts.len(), 3);
            assert!(attempts[0].starts_with("f01001"));
        }
        other => panic!("unexpected error {other}"),
    }
}
