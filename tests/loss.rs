//! Soak tests over a lossy link: sustained random packet loss, NACK cycles,
//! and the per-interval budget invariant.
use canopy::testing::*;
use canopy::CanopyConfig;

/// Lossy ticks to run before letting the link settle.
const LOSSY_TICKS: usize = 60;
/// Clean ticks afterwards for straggling retransmits.
const SETTLE_TICKS: usize = 60;

#[test]
fn soak_scene_survives_packet_loss() {
    init_logger();
    let mut harness = StreamTestHarness::new(300, 30);
    harness.disable_frustum_culling();
    harness.set_drop_chance(0.2);

    for _ in 0..LOSSY_TICKS {
        harness.tick();
        harness.send_nacks();
    }

    // the link heals; every remaining gap gets replayed
    harness.set_drop_chance(0.0);
    for _ in 0..SETTLE_TICKS {
        harness.tick();
        harness.send_nacks();
        if harness.missing.missing_count() == 0 {
            break;
        }
    }

    assert_eq!(harness.missing.missing_count(), 0, "gaps left unhealed");
    assert_eq!(
        harness.distinct_elements_received(),
        300,
        "elements lost despite NACK recovery"
    );
    assert!(harness.view_sent());
}

#[test]
fn budget_invariant_holds_every_tick() {
    init_logger();
    let config = CanopyConfig::default();
    // default peer quota: 600 pps / 60 intervals = 10 packets per interval
    let max_per_interval = (config.default_max_query_pps / config.intervals_per_second) as usize;
    let mut harness = StreamTestHarness::with_config(config, 500, 60);
    harness.disable_frustum_culling();
    harness.set_drop_chance(0.1);

    for tick in 0..80 {
        harness.tick();
        assert!(
            harness.last_tick_packet_count <= max_per_interval,
            "tick {tick} sent {} packets, budget is {max_per_interval}",
            harness.last_tick_packet_count
        );
        harness.send_nacks();
    }
}

#[test]
fn edits_stream_through_sustained_loss() {
    init_logger();
    let mut harness = StreamTestHarness::new(100, 30);
    harness.disable_frustum_culling();

    // deliver the initial scene cleanly
    while !harness.bag_is_empty() || harness.distinct_elements_received() < 100 {
        harness.tick();
    }

    harness.set_drop_chance(0.25);
    for i in 0..40 {
        harness.touch_node(canopy::NodeId((1 + i % 100) as u32));
        harness.tick();
        harness.send_nacks();
    }
    harness.set_drop_chance(0.0);
    for _ in 0..SETTLE_TICKS {
        harness.tick();
        harness.send_nacks();
        if harness.missing.missing_count() == 0 {
            break;
        }
    }

    assert_eq!(harness.missing.missing_count(), 0);
    assert_eq!(harness.distinct_elements_received(), 100);
}
