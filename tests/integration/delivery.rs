use crate::*;

use winenet_sim::Report;

// ══════════════════════════════════════════════════════════════════════════════
//  Framed Delivery
// ══════════════════════════════════════════════════════════════════════════════

/// Clean medium: plenty of traffic, nothing delivered twice.
#[tokio::test]
async fn test_exactly_once_without_loss() -> Result<()> {
    let t = &TestMesh::new(0);
    for n in 1..=3 {
        t.join_talking(n, 2).await?;
    }

    wait_for(20, "200 deliveries", move || async move {
        t.stats.totals().packets_received >= 200
    })
    .await?;

    let totals = t.stats.totals();
    assert_eq!(totals.duplicates, 0, "{totals:?}");
    Ok(())
}

/// 10% of datagrams are dropped. Lost ACKs cause retransmissions, which
/// receivers must recognise.
#[tokio::test]
async fn test_exactly_once_under_loss() -> Result<()> {
    let t = &TestMesh::new(10);
    for n in 1..=3 {
        t.join_talking(n, 2).await?;
    }

    wait_for(60, "200 deliveries under loss", move || async move {
        t.stats.totals().packets_received >= 200
    })
    .await?;

    let medium = t.mesh.medium().stats();
    assert!(medium.lost > 0, "{medium:?}");
    let totals = t.stats.totals();
    assert_eq!(totals.duplicates, 0, "{totals:?}");
    Ok(())
}

/// The run report carries every node and the medium counters.
#[tokio::test]
async fn test_report_serialises() -> Result<()> {
    let t = &TestMesh::new(0);
    for n in 1..=3 {
        t.join_talking(n, 1).await?;
    }
    wait_for(10, "first deliveries", move || async move {
        t.stats.totals().packets_received > 0
    })
    .await?;

    let report = Report::collect(&t.mesh, &t.stats, Duration::from_secs(1)).await;
    let json = serde_json::to_value(&report)?;

    let nodes = json["nodes"].as_array().expect("nodes array");
    assert_eq!(nodes.len(), 3);
    assert!(nodes[0]["state"].is_string());
    assert!(nodes[0]["traffic"]["packets_sent"].is_u64());
    assert!(json["medium"]["sent"].as_u64().unwrap_or(0) > 0);
    Ok(())
}
