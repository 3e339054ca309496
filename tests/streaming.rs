//! End-to-end scenarios: one send loop, a synthetic tree, and a fake client
//! on the other side of the recorded transport.
use canopy::testing::*;
use canopy::CanopyConfig;
use canopy::ViewFrustum;
use glam::Vec3;

/// A camera well behind the tree, far plane pushed out so every element of
/// the synthetic tree is visible from any x offset the tests use.
fn wide_view(x: f32) -> ViewFrustum {
    let mut f = ViewFrustum::new(Vec3::new(x, 0.0, -1500.0), Vec3::Z, Vec3::Y);
    f.far = 8192.0;
    f
}

#[test]
fn thousand_node_scene_within_one_interval() {
    init_logger();
    // budget of 50 packets per interval, 1400-byte packets, ~20 bytes per
    // element: the whole scene fits comfortably into a single tick
    let mut config = CanopyConfig::default();
    config.max_packets_per_client_per_interval = 50;
    let mut harness = StreamTestHarness::with_config(config, 1000, 10);
    harness.disable_frustum_culling();
    harness.set_max_query_pps(3000);

    harness.tick();

    assert!(harness.last_tick_packet_count <= 50);
    assert!(harness.bag_is_empty());
    assert!(harness.view_sent());
    assert_eq!(harness.distinct_elements_received(), 1000);
    assert!(
        !harness.any_element_received_twice(),
        "zero elements may be encoded twice in one scene"
    );
}

#[test]
fn sequence_numbers_increase_in_send_order() {
    init_logger();
    let mut harness = StreamTestHarness::new(300, 40);
    harness.disable_frustum_culling();
    for _ in 0..20 {
        harness.tick();
    }
    let sequences: Vec<u16> = harness.packets_delivered.iter().map(|p| p.sequence).collect();
    assert!(!sequences.is_empty());
    for pair in sequences.windows(2) {
        assert!(pair[1] > pair[0], "sequence went backwards: {pair:?}");
    }
}

#[test]
fn frustum_stop_forces_full_scene_resend() {
    init_logger();
    let mut harness = StreamTestHarness::new(30, 8);
    harness.set_view(wide_view(0.0));

    // first sight counts as a view change; the scene streams out
    harness.tick();
    assert_eq!(harness.distinct_elements_received(), 30);
    assert!(harness.view_sent());

    // the camera keeps sweeping; content already sent for the last delivered
    // view is not re-sent while it moves
    for step in 1..=3 {
        harness.set_view(wide_view(step as f32 * 200.0));
        harness.tick();
    }
    assert!(!harness.any_element_received_twice());

    // the tick after movement stops forces a full scene, and completing a
    // forced full scene sends a stats packet so the client knows it's stable
    let stats_before = harness.stats_packets_received;
    harness.tick();
    assert!(harness.view_sent());
    assert!(harness.elements_received.values().all(|count| *count == 2));
    assert!(harness.stats_packets_received > stats_before);

    // and then the stream goes quiet again
    harness.tick();
    harness.tick();
    assert!(harness.elements_received.values().all(|count| *count == 2));
}

#[test]
fn lod_change_forces_full_scene() {
    init_logger();
    let mut harness = StreamTestHarness::new(30, 8);
    harness.set_view(wide_view(0.0));
    harness.tick(); // first sight: everything streams
    harness.tick(); // view just stopped changing: one full re-send
    harness.tick(); // quiet
    assert_eq!(harness.distinct_elements_received(), 30);
    assert!(harness.elements_received.values().all(|count| *count == 2));

    {
        let mut peer = harness.peer.lock().unwrap();
        peer.query.lod.boundary_level_adjust = -1;
    }
    harness.tick();
    assert!(
        harness.elements_received.values().all(|count| *count == 3),
        "a LOD change must restart the scene from scratch"
    );
}

#[test]
fn nacked_packet_is_retransmitted_with_original_sequence() {
    init_logger();
    let mut harness = StreamTestHarness::new(100, 50);
    harness.disable_frustum_culling();

    // ~5 data packets this tick; lose the third
    harness.tick_with_drops(vec![2]);
    assert_eq!(harness.missing.missing_count(), 1);
    let missing_seq = harness.missing.missing_set()[0];
    assert!(harness.distinct_elements_received() < 100);

    // client reports the gap; the next tick replays the retained packet
    assert_eq!(harness.send_nacks(), 1);
    harness.tick();

    assert_eq!(harness.missing.missing_count(), 0);
    assert_eq!(harness.distinct_elements_received(), 100);
    assert!(
        harness
            .packets_delivered
            .iter()
            .any(|p| p.sequence == missing_seq),
        "retransmit must preserve the original sequence number"
    );
}

#[test]
fn nack_suppressed_while_inbound_packets_pending() {
    init_logger();
    let mut harness = StreamTestHarness::new(100, 50);
    harness.disable_frustum_culling();

    // a real loss, fully processed: the missing set is non-empty
    harness.tick_with_drops(vec![1]);
    assert!(harness.missing.missing_count() > 0);

    // more packets arrive but sit unprocessed (client lagging): the gap may
    // be explained by processing lag, so no NACK goes out
    harness.touch_node(canopy::NodeId(10));
    harness.tick_without_processing();
    assert!(harness.has_packets_to_process());
    assert_eq!(harness.send_nacks(), 0);
    assert!(!harness.peer.lock().unwrap().has_next_nacked_packet());

    // once the queue drains, the NACK cycle proceeds
    harness.process_inbound();
    assert!(harness.send_nacks() > 0);
    assert!(harness.peer.lock().unwrap().has_next_nacked_packet());
}

#[test]
fn missing_set_unchanged_until_retransmit_arrives() {
    init_logger();
    let mut harness = StreamTestHarness::new(200, 50);
    harness.disable_frustum_culling();

    harness.tick_with_drops(vec![1, 3]);
    let first = harness.missing.missing_set();
    assert_eq!(first.len(), 2);

    // constructing NACKs must not remove anything from the missing set
    harness.send_nacks();
    assert_eq!(harness.missing.missing_set(), first);
    harness.send_nacks();
    assert_eq!(harness.missing.missing_set(), first);
}

#[test]
fn special_packets_flow_after_traversal() {
    init_logger();
    let mut harness = StreamTestHarness::new(10, 8);
    harness.disable_frustum_culling();
    let special = vec![0xAB; 32];
    {
        let mut peer = harness.peer.lock().unwrap();
        peer.queue_special_packet(2, special.clone());
    }
    harness.tick_without_processing();
    // the special datagram is handed to the transport verbatim
    assert!(harness.inbound_queue.iter().any(|bytes| *bytes == special));
    assert_eq!(
        harness
            .stats
            .total_special_packets
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}
