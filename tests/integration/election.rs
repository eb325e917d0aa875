use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Election & Rotation
// ══════════════════════════════════════════════════════════════════════════════

/// Two fresh nodes validate each other through the ping handshake.
#[tokio::test]
async fn test_handshake_validates_both_sides() -> Result<()> {
    let t = &TestMesh::new(0);
    let a = &t.join_silent(1).await?;
    let b = &t.join_silent(2).await?;

    wait_for(5, "mutual validation", move || async move {
        let sa = a.snapshot().await;
        let sb = b.snapshot().await;
        sa.neighbours.iter().any(|n| n.uid == uid(2) && n.valid)
            && sb.neighbours.iter().any(|n| n.uid == uid(1) && n.valid)
    })
    .await?;

    assert_ne!(a.state(), WnetState::Idle);
    assert_ne!(b.state(), WnetState::Idle);
    Ok(())
}

/// A node with an endless stream keeps the channel; everyone else follows it.
#[tokio::test]
async fn test_single_speaker_holds_channel() -> Result<()> {
    let t = &TestMesh::new(0);
    t.join_talking(1, usize::MAX).await?;
    t.join_silent(2).await?;
    t.join_silent(3).await?;

    wait_for(10, "node 1 speaking to both listeners", move || async move {
        let snaps = t.snapshots().await;
        snaps.iter().all(|s| {
            if s.uid == uid(1) {
                s.state == WnetState::Speaker
            } else {
                s.state == WnetState::Listener && s.paired_speaker == Some(uid(1))
            }
        })
    })
    .await?;

    for _ in 0..10 {
        assert_eq!(t.speakers().await, vec![uid(1)]);
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    let before = t.stats.get(uid(2)).packets_received;
    wait_for(5, "listener receiving", move || async move {
        t.stats.get(uid(2)).packets_received > before
    })
    .await?;
    assert!(t.stats.get(uid(3)).packets_received > 0);
    Ok(())
}

/// Speakership rotates: every talking node finishes several streams.
#[tokio::test]
async fn test_rotation_gives_every_talker_a_turn() -> Result<()> {
    let t = &TestMesh::new(0);
    for n in 1..=3 {
        t.join_talking(n, 2).await?;
    }

    wait_for(20, "three streams per node", move || async move {
        (1..=3).all(|n| t.streams_completed(n) >= 3)
    })
    .await?;

    for n in 1..=3 {
        assert!(t.stats.get(uid(n)).packets_received > 0, "node {n} heard nobody");
    }
    Ok(())
}
