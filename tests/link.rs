//! End-to-end tests: two engines joined by a linked pair of mock radios

use std::time::{Duration, Instant};

use serde_json::json;

use lora_tracker::controller::{BeaconController, SimulatedBattery, TrackerController};
use lora_tracker::gps::{GpsReceiver, SimulatedNmeaSource};
use lora_tracker::protocol::{
    CommandPayload, DeliveryState, LoRaEngine, Message, MessageType, Payload, PositionReport,
};
use lora_tracker::utils::{BeaconConfig, BusConfig, GpsConfig, ProtocolConfig, RadioConfig, TrackerConfig};
use lora_tracker::{GeoPoint, MockTransceiver, BROADCAST_ID};

const KEY: &str = "0123456789ABCDEF";

fn protocol(node_id: &str, destination_id: &str, key: Option<&str>) -> ProtocolConfig {
    ProtocolConfig {
        node_id: node_id.to_string(),
        destination_id: destination_id.to_string(),
        encryption_key: key.map(str::to_string),
        tx_interval_ms: 5,
        ack_timeout_ms: 500,
        retry_base_delay_ms: 10,
        ..Default::default()
    }
}

fn engine(config: ProtocolConfig, radio: MockTransceiver) -> LoRaEngine {
    let engine = LoRaEngine::with_transceiver(config, radio).unwrap();
    engine
        .connect(&BusConfig::default(), &RadioConfig::default())
        .unwrap();
    engine
}

fn linked_engines(beacon_key: Option<&str>, tracker_key: Option<&str>) -> (LoRaEngine, LoRaEngine) {
    let (a, b) = MockTransceiver::pair();
    let beacon = engine(protocol("BEACON01", "TRACKER01", beacon_key), a);
    let tracker = engine(protocol("TRACKER01", "BEACON01", tracker_key), b);
    beacon.start().unwrap();
    tracker.start().unwrap();
    (beacon, tracker)
}

fn position(lat: f64, lon: f64) -> Payload {
    Payload::Position(PositionReport {
        lat,
        lon,
        satellites: Some(7),
        ..Default::default()
    })
}

/// Poll until a message satisfying `pred` arrives
fn poll_for(engine: &LoRaEngine, timeout: Duration, pred: impl Fn(&Message) -> bool) -> Option<Message> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(message) = engine.poll_message(Duration::from_millis(50)) {
            if pred(&message) {
                return Some(message);
            }
        }
    }
    None
}

fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
fn test_acknowledged_delivery() {
    let (beacon, tracker) = linked_engines(Some(KEY), Some(KEY));

    let id = beacon.send(position(51.5, -0.12), None, true).unwrap();
    let received = poll_for(&tracker, Duration::from_secs(2), |m| m.id == id).unwrap();
    assert_eq!(received.src, "BEACON01");
    assert_eq!(received.message_type(), MessageType::Position);

    assert_eq!(
        beacon.wait_for_delivery(&id, Duration::from_secs(2)),
        Some(DeliveryState::Acked)
    );
    let stats = beacon.statistics();
    assert_eq!(stats.acks_received, 1);
    assert_eq!(stats.tx_packets, 1);
    assert_eq!(stats.tx_errors, 0);
    assert_eq!(tracker.statistics().rx_packets, 1);

    beacon.stop().unwrap();
    tracker.stop().unwrap();
}

#[test]
fn test_plaintext_sender_reaches_keyed_receiver() {
    let (beacon, tracker) = linked_engines(None, Some(KEY));

    let id = beacon.send(position(10.0, 20.0), None, false).unwrap();
    let received = poll_for(&tracker, Duration::from_secs(2), |m| m.id == id).unwrap();
    assert_eq!(received.payload, position(10.0, 20.0));
    assert_eq!(tracker.statistics().rx_errors, 0);

    beacon.stop().unwrap();
    tracker.stop().unwrap();
}

#[test]
fn test_mismatched_keys_are_dropped() {
    let (beacon, tracker) = linked_engines(Some(KEY), Some("FEDCBA9876543210"));

    let id = beacon.send(position(10.0, 20.0), None, true).unwrap();
    assert!(poll_for(&tracker, Duration::from_millis(300), |m| m.id == id).is_none());
    assert!(tracker.statistics().rx_errors >= 1);

    beacon.stop().unwrap();
    tracker.stop().unwrap();
}

#[test]
fn test_minimal_packet_surfaces_as_broadcast_position() {
    let (beacon, tracker) = linked_engines(Some(KEY), Some(KEY));

    beacon.send_minimal(48.1173, 11.5166, 1_700_000_000).unwrap();
    let received = poll_for(&tracker, Duration::from_secs(2), |m| {
        m.message_type() == MessageType::Position
    })
    .unwrap();
    assert_eq!(received.src, "unknown");
    assert_eq!(received.dst, BROADCAST_ID);
    assert!(!received.ack_req);
    match received.payload {
        Payload::Position(report) => {
            assert!((report.lat - 48.1173).abs() < 1e-6);
            assert!((report.lon - 11.5166).abs() < 1e-6);
        }
        other => panic!("unexpected payload {:?}", other),
    }

    beacon.stop().unwrap();
    tracker.stop().unwrap();
}

fn beacon_controller(radio: MockTransceiver) -> BeaconController {
    let engine = engine(protocol("BEACON01", "TRACKER01", Some(KEY)), radio);
    let config = BeaconConfig {
        loop_interval_ms: 50,
        ..Default::default()
    };
    BeaconController::new(
        config,
        engine,
        GpsReceiver::new(GpsConfig::default()),
        Box::new(SimulatedBattery::default()),
    )
    .unwrap()
}

fn simulated_gps(center: GeoPoint) -> Box<SimulatedNmeaSource> {
    Box::new(SimulatedNmeaSource::new(center, Duration::from_millis(100)).with_jitter(0.0))
}

#[test]
fn test_command_round_trip() {
    let (a, b) = MockTransceiver::pair();
    let mut beacon = beacon_controller(a);
    beacon.start(simulated_gps(GeoPoint::new(51.5, -0.12))).unwrap();

    let tracker = engine(protocol("TRACKER01", "BEACON01", Some(KEY)), b);
    tracker.start().unwrap();

    let status = poll_for(&tracker, Duration::from_secs(3), |m| {
        m.message_type() == MessageType::Status
    });
    assert!(status.is_some());

    let mut args = serde_json::Map::new();
    args.insert("waypoint".to_string(), json!({"lat": 51.6, "lon": -0.12, "id": "camp"}));
    let request = tracker
        .send(
            Payload::Command(CommandPayload {
                command: "add_waypoint".to_string(),
                args,
            }),
            None,
            true,
        )
        .unwrap();

    let response = poll_for(&tracker, Duration::from_secs(3), |m| {
        m.message_type() == MessageType::Response
    })
    .unwrap();
    match response.payload {
        Payload::Response(r) => {
            assert_eq!(r.request_id.as_deref(), Some(request.as_str()));
            assert_eq!(r.status, "success");
            assert_eq!(r.extra.get("wp_id"), Some(&json!("camp")));
        }
        other => panic!("unexpected payload {:?}", other),
    }
    assert_eq!(beacon.waypoints().len(), 1);

    beacon.stop().unwrap();
    tracker.stop().unwrap();
}

#[test]
fn test_tracker_follows_beacon() {
    let (a, b) = MockTransceiver::pair();
    let mut beacon = beacon_controller(a);

    let tracker_engine = engine(protocol("TRACKER01", "BEACON01", Some(KEY)), b);
    let mut tracker = TrackerController::new(TrackerConfig::default(), Some(tracker_engine), None).unwrap();
    tracker.set_tracker_position(GeoPoint::new(51.5, -0.13));
    tracker.start(None).unwrap();

    beacon.start(simulated_gps(GeoPoint::new(51.5, -0.12))).unwrap();

    assert!(wait_until(Duration::from_secs(5), || tracker.beacon_updates() >= 1));
    let fix = tracker.last_beacon().unwrap();
    assert_eq!(fix.src, "BEACON01");

    let nav = tracker.navigation();
    let distance = nav.distance.unwrap();
    // 0.01 degrees of longitude at 51.5 N
    assert!((distance - 692.0).abs() < 10.0, "distance {}", distance);
    let bearing = nav.bearing.unwrap();
    assert!((bearing - 90.0).abs() < 1.0, "bearing {}", bearing);

    beacon.stop().unwrap();
    tracker.stop().unwrap();
}
