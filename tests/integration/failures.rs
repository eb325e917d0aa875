use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Departures & Link Failures
// ══════════════════════════════════════════════════════════════════════════════

/// A node leaves mid-run. The other two forget it and keep rotating.
#[tokio::test]
async fn test_departed_node_does_not_stall_mesh() -> Result<()> {
    let t = &TestMesh::new(0);
    let a = &t.join_talking(1, 2).await?;
    t.join_talking(2, 2).await?;
    t.join_talking(3, 2).await?;

    wait_for(20, "one stream per node", move || async move {
        (1..=3).all(|n| t.streams_completed(n) >= 1)
    })
    .await?;

    assert!(t.mesh.leave(uid(3)).await);
    assert!(!t.mesh.leave(uid(3)).await);

    let (s1, s2) = (t.streams_completed(1), t.streams_completed(2));
    wait_for(20, "two more streams each", move || async move {
        t.streams_completed(1) >= s1 + 2 && t.streams_completed(2) >= s2 + 2
    })
    .await?;

    let snap = a.snapshot().await;
    assert!(snap.neighbours.iter().all(|n| n.uid != uid(3)));
    Ok(())
}

/// A link that goes silent gets its neighbour invalidated. Once restored,
/// discovery pings it again and traffic resumes.
#[tokio::test]
async fn test_blocked_link_recovers() -> Result<()> {
    let t = &TestMesh::new(0);
    let a = &t.join_talking(1, 2).await?;
    let b = &t.join_talking(2, 2).await?;

    wait_for(20, "streams flowing", move || async move {
        t.streams_completed(1) >= 1 && t.streams_completed(2) >= 1
    })
    .await?;

    t.mesh.medium().block(uid(1), uid(2));
    wait_for(10, "a neighbour invalidated", move || async move {
        let sa = a.snapshot().await;
        let sb = b.snapshot().await;
        sa.neighbours.iter().any(|n| !n.valid) || sb.neighbours.iter().any(|n| !n.valid)
    })
    .await?;

    t.mesh.medium().unblock(uid(1), uid(2));
    let (s1, s2) = (t.streams_completed(1), t.streams_completed(2));
    wait_for(30, "traffic after recovery", move || async move {
        t.streams_completed(1) > s1 && t.streams_completed(2) > s2
    })
    .await?;

    assert_eq!(t.stats.totals().duplicates, 0);
    Ok(())
}
