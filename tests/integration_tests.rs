//! Integration tests for client/server bundle exchange.
//!
//! Drives two real nodes with on-disk state through the exchanges a carrier
//! produces in practice: loss, duplication, reordering and restarts.

use ddd_core::{Adu, AduEvent, BundleTransmission, IngestOutcome, Result};
use ddd_crypto::PeerIdentity;
use ddd_integration_tests::fixtures::{Carrier, TwoNodeFixture};

fn received(node: &BundleTransmission, peer: &PeerIdentity, app: &str) -> Vec<Vec<u8>> {
    node.received_adus(peer, app, 0)
        .unwrap()
        .map(|adu| adu.map(|a: Adu| a.data))
        .collect::<Result<_>>()
        .unwrap()
}

fn pending(node: &BundleTransmission, peer: &PeerIdentity, app: &str) -> Vec<u64> {
    node.pending_adus(peer, app)
        .unwrap()
        .map(|adu| adu.map(|a| a.id))
        .collect::<Result<_>>()
        .unwrap()
}

// ============================================================================
// End-to-end exchange
// ============================================================================

#[tokio::test]
async fn test_round_trip_releases_both_sides() {
    let f = TwoNodeFixture::new();
    f.client.enqueue_adu(&f.server_id, "mail", b"m1").unwrap();
    f.client.enqueue_adu(&f.server_id, "chat", b"c1").unwrap();

    let up = f.upstream().await.unwrap().unwrap();
    f.server.ingest(&up.bytes).await.unwrap();
    assert_eq!(received(&f.server, &f.client_id, "mail"), vec![b"m1".to_vec()]);
    assert_eq!(received(&f.server, &f.client_id, "chat"), vec![b"c1".to_vec()]);

    f.server.enqueue_adu(&f.client_id, "mail", b"reply").unwrap();
    let down = f.downstream().await.unwrap().unwrap();
    let outcome = f.client.ingest(&down.bytes).await.unwrap();
    assert!(matches!(
        outcome,
        IngestOutcome::Processed {
            stored: 1,
            acked: Some(0),
            ..
        }
    ));
    assert!(pending(&f.client, &f.server_id, "mail").is_empty());
    assert!(pending(&f.client, &f.server_id, "chat").is_empty());
    assert_eq!(received(&f.client, &f.server_id, "mail"), vec![b"reply".to_vec()]);

    // The client's next bundle acknowledges the reply
    let up = f.upstream().await.unwrap().unwrap();
    let outcome = f.server.ingest(&up.bytes).await.unwrap();
    assert!(matches!(
        outcome,
        IngestOutcome::Processed {
            counter: 1,
            stored: 0,
            acked: Some(0),
            ..
        }
    ));
    assert!(pending(&f.server, &f.client_id, "mail").is_empty());
}

#[tokio::test]
async fn test_adu_events_close_with_sentinel() {
    let f = TwoNodeFixture::new();
    let mut events = f.server.subscribe();
    f.client.enqueue_adu(&f.server_id, "a", b"1").unwrap();
    f.client.enqueue_adu(&f.server_id, "a", b"2").unwrap();
    f.client.enqueue_adu(&f.server_id, "b", b"3").unwrap();

    let up = f.upstream().await.unwrap().unwrap();
    f.server.ingest(&up.bytes).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert_eq!(
        seen,
        vec![
            AduEvent::Arrived {
                peer: f.client_id.clone(),
                app_id: "a".into(),
                adu_ids: vec![1, 2],
            },
            AduEvent::Arrived {
                peer: f.client_id.clone(),
                app_id: "b".into(),
                adu_ids: vec![1],
            },
            AduEvent::AllAppsProcessed {
                peer: f.client_id.clone()
            },
        ]
    );
}

// ============================================================================
// Loss, duplication and reordering
// ============================================================================

#[tokio::test]
async fn test_lost_bundle_is_resent_identically() {
    let f = TwoNodeFixture::new();
    f.client.enqueue_adu(&f.server_id, "mail", b"m1").unwrap();

    // First copy lost on the way
    let lost = f.upstream().await.unwrap().unwrap();
    let resent = f.upstream().await.unwrap().unwrap();
    assert!(resent.retransmission);
    assert_eq!(resent.file_name(), lost.file_name());
    assert_eq!(resent.bytes, lost.bytes);

    f.server.ingest(&resent.bytes).await.unwrap();
    assert_eq!(received(&f.server, &f.client_id, "mail").len(), 1);
}

#[tokio::test]
async fn test_duplicates_are_suppressed() {
    let f = TwoNodeFixture::new();
    let mut carrier = Carrier::default();
    f.client.enqueue_adu(&f.server_id, "mail", b"m1").unwrap();
    carrier.pick_up(&f.upstream().await.unwrap().unwrap());

    let mut outcomes = Vec::new();
    for _ in 0..3 {
        for bytes in carrier.replay() {
            outcomes.push(f.server.ingest(&bytes).await.unwrap());
        }
    }
    assert!(matches!(outcomes[0], IngestOutcome::Processed { .. }));
    for outcome in &outcomes[1..] {
        assert_eq!(
            outcome,
            &IngestOutcome::Duplicate {
                peer: f.client_id.clone(),
                counter: 0
            }
        );
    }
    assert_eq!(received(&f.server, &f.client_id, "mail").len(), 1);
}

#[tokio::test]
async fn test_reordered_bundles() {
    let f = TwoNodeFixture::new();
    let mut carrier = Carrier::default();
    for data in [b"m1", b"m2", b"m3"] {
        f.client.enqueue_adu(&f.server_id, "mail", data).unwrap();
        carrier.pick_up(&f.upstream().await.unwrap().unwrap());
    }
    assert_eq!(carrier.len(), 3);

    // Newest first: it already carries every ADU, the older ones are stale
    let outcomes = {
        let mut outcomes = Vec::new();
        for bytes in carrier.drain_reversed() {
            outcomes.push(f.server.ingest(&bytes).await.unwrap());
        }
        outcomes
    };
    assert!(matches!(
        outcomes[0],
        IngestOutcome::Processed {
            counter: 2,
            stored: 3,
            ..
        }
    ));
    assert!(matches!(outcomes[1], IngestOutcome::Duplicate { counter: 1, .. }));
    assert!(matches!(outcomes[2], IngestOutcome::Duplicate { counter: 0, .. }));

    // One acknowledgement releases the whole window
    let down = f.downstream().await.unwrap().unwrap();
    f.client.ingest(&down.bytes).await.unwrap();
    let window = f.client.window_state(&f.server_id).unwrap();
    assert_eq!((window.start, window.end), (3, 3));
    assert!(pending(&f.client, &f.server_id, "mail").is_empty());
}

#[tokio::test]
async fn test_stale_ack_is_harmless() {
    let f = TwoNodeFixture::new();
    f.client.enqueue_adu(&f.server_id, "mail", b"m1").unwrap();
    let up = f.upstream().await.unwrap().unwrap();
    f.server.ingest(&up.bytes).await.unwrap();

    let first_ack = f.downstream().await.unwrap().unwrap();
    f.client.ingest(&first_ack.bytes).await.unwrap();

    // Client answers, server acknowledges again with a new bundle
    let up = f.upstream().await.unwrap().unwrap();
    f.server.ingest(&up.bytes).await.unwrap();
    let second_ack = f.downstream().await.unwrap().unwrap();
    assert_eq!(second_ack.counter, 1);
    let outcome = f.client.ingest(&second_ack.bytes).await.unwrap();
    assert!(matches!(outcome, IngestOutcome::Processed { acked: Some(1), .. }));

    // The first ack bundle turning up late changes nothing
    let outcome = f.client.ingest(&first_ack.bytes).await.unwrap();
    assert!(matches!(outcome, IngestOutcome::Duplicate { counter: 0, .. }));
    let window = f.client.window_state(&f.server_id).unwrap();
    assert_eq!((window.start, window.end), (2, 2));
}

#[tokio::test]
async fn test_garbage_is_a_local_error() {
    let f = TwoNodeFixture::new();
    let err = f.server.ingest(b"definitely not a bundle").await.unwrap_err();
    assert!(err.is_local());

    let mut zeros = vec![0u8; 4096];
    zeros[0] = 1;
    let err = f.server.ingest(&zeros).await.unwrap_err();
    assert!(err.is_local());
}

// ============================================================================
// Window scenarios
// ============================================================================

#[tokio::test]
async fn test_capacity_three_window() {
    let f = TwoNodeFixture::with_capacity(3);
    let mut sent = Vec::new();
    for data in [b"a", b"b", b"c"] {
        f.client.enqueue_adu(&f.server_id, "mail", data).unwrap();
        sent.push(f.upstream().await.unwrap().unwrap());
    }
    let counters: Vec<u64> = sent.iter().map(|b| b.counter).collect();
    assert_eq!(counters, vec![0, 1, 2]);
    assert!(f.client.window_state(&f.server_id).unwrap().is_full());

    // Full: the fourth attempt resends counter 2
    f.client.enqueue_adu(&f.server_id, "mail", b"d").unwrap();
    let fourth = f.upstream().await.unwrap().unwrap();
    assert!(fourth.retransmission);
    assert_eq!(fourth.counter, 2);
    assert_eq!(fourth.bytes, sent[2].bytes);

    // Server only ever saw bundle 0 and acknowledges it
    f.server.ingest(&sent[0].bytes).await.unwrap();
    let down = f.downstream().await.unwrap().unwrap();
    f.client.ingest(&down.bytes).await.unwrap();
    let window = f.client.window_state(&f.server_id).unwrap();
    assert!(!window.is_full());
    assert_eq!(window.start, 1);

    // ADU 1 was released; the next bundle is new and carries the rest
    assert_eq!(pending(&f.client, &f.server_id, "mail"), vec![2, 3, 4]);
    let next = f.upstream().await.unwrap().unwrap();
    assert!(!next.retransmission);
    assert_eq!(next.counter, 3);
    let outcome = f.server.ingest(&next.bytes).await.unwrap();
    assert!(matches!(outcome, IngestOutcome::Processed { stored: 3, .. }));
}

#[tokio::test]
async fn test_capacity_one_window() {
    let f = TwoNodeFixture::with_capacity(1);
    f.client.enqueue_adu(&f.server_id, "mail", b"a").unwrap();
    let first = f.upstream().await.unwrap().unwrap();
    f.client.enqueue_adu(&f.server_id, "mail", b"b").unwrap();
    let again = f.upstream().await.unwrap().unwrap();
    assert_eq!(again.counter, first.counter);
    assert!(again.retransmission);
}

// ============================================================================
// Persistence and many peers
// ============================================================================

#[tokio::test]
async fn test_exchange_continues_after_restart() {
    let mut f = TwoNodeFixture::new();
    f.client.enqueue_adu(&f.server_id, "mail", b"before").unwrap();
    let up = f.upstream().await.unwrap().unwrap();
    f.server.ingest(&up.bytes).await.unwrap();

    f.restart();

    // Both ratchets and counters came back from disk
    let down = f.downstream().await.unwrap().unwrap();
    let outcome = f.client.ingest(&down.bytes).await.unwrap();
    assert!(matches!(outcome, IngestOutcome::Processed { acked: Some(0), .. }));

    f.client.enqueue_adu(&f.server_id, "mail", b"after").unwrap();
    let up = f.upstream().await.unwrap().unwrap();
    assert_eq!(up.counter, 1);
    let outcome = f.server.ingest(&up.bytes).await.unwrap();
    assert!(matches!(outcome, IngestOutcome::Processed { stored: 1, .. }));
    assert_eq!(
        received(&f.server, &f.client_id, "mail"),
        vec![b"before".to_vec(), b"after".to_vec()]
    );
}

#[tokio::test]
async fn test_server_serves_many_clients() {
    let f = TwoNodeFixture::new();
    let other = f.second_client("other");
    let other_id = other.local_id().clone();

    f.client.enqueue_adu(&f.server_id, "mail", b"from first").unwrap();
    other.enqueue_adu(&f.server_id, "mail", b"from second").unwrap();
    let up = f.upstream().await.unwrap().unwrap();
    f.server.ingest(&up.bytes).await.unwrap();
    let up = other.bundle_to_send_for(&f.server_id).await.unwrap().unwrap();
    f.server.ingest(&up.bytes).await.unwrap();

    let mut expected = vec![f.client_id.clone(), other_id.clone()];
    expected.sort();
    assert_eq!(f.server.known_peers(), expected);

    let results = f.server.bundles_for_peers(&expected).await;
    assert_eq!(results.len(), 2);
    for (peer, result) in results {
        let bundle = result.unwrap().unwrap();
        let target = if peer == f.client_id { &f.client } else { &other };
        let outcome = target.ingest(&bundle.bytes).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Processed { acked: Some(0), .. }));
    }

    // A bundle for one client means nothing to the other
    let bundle = f.downstream().await.unwrap().unwrap();
    assert_eq!(other.ingest(&bundle.bytes).await.unwrap(), IngestOutcome::NotForUs);
}
