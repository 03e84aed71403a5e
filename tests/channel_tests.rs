use cartbot::channel::*;
use cartbot::queue::{CommandQueue, QUEUE_CAPACITY};
use cartbot::sim::{SimRadio, CENTRAL_OUTBOX_DEPTH};
use cartbot::telemetry::{TelemetrySample, TelemetrySink};
use std::sync::Arc;
use tokio::sync::mpsc::{self, Receiver};

fn sample() -> TelemetrySample {
    TelemetrySample {
        distance_cm: Some(50.0),
        voltage: Some(7.4),
        current_ma: Some(300.0),
        line_left: false,
        line_right: true,
    }
}

fn connect<R: BleRadio>(radio: &SimRadio, channel: &CommandChannel<'_, R>) -> (u16, Receiver<Vec<u8>>) {
    let (tx, rx) = mpsc::channel(CENTRAL_OUTBOX_DEPTH);
    let (conn, event) = radio.connect_central(tx);
    channel.handle_event(event);
    (conn, rx)
}

fn write<R: BleRadio>(radio: &SimRadio, channel: &CommandChannel<'_, R>, conn: u16, value: &[u8]) {
    let event = radio.central_write(conn, channel.command_handle(), value).unwrap();
    channel.handle_event(event);
}

#[test]
fn test_start_registers_service_and_advertises() {
    let radio = SimRadio::new();
    let mut queue = CommandQueue::new();
    let (tx, _rx) = queue.split();
    let settings = ChannelSettings::default();

    let channel = CommandChannel::start(&radio, &settings, tx).unwrap();

    assert_ne!(channel.command_handle(), channel.telemetry_handle());
    assert_eq!(radio.find_handle(settings.command), Some(channel.command_handle()));
    assert_eq!(radio.find_handle(settings.telemetry), Some(channel.telemetry_handle()));

    let advertising = radio.advertising().unwrap();
    assert_eq!(advertising.interval_us, DEFAULT_ADV_INTERVAL_US);
    assert_eq!(advertising.adv_data, channel.payload().adv_data());
    assert_eq!(&advertising.adv_data[..3], &[0x02, 0x01, 0x06]);
    assert_eq!(&advertising.adv_data[5..], &settings.service.to_le_bytes());
    assert_eq!(&advertising.scan_response[2..], DEFAULT_DEVICE_NAME.as_bytes());
    assert!(channel.connections().is_empty());
}

#[test]
fn test_registration_failure_is_fatal() {
    let radio = SimRadio::new();
    radio.fail_registration(true);
    let mut queue = CommandQueue::new();
    let (tx, _rx) = queue.split();

    let result = CommandChannel::start(&radio, &ChannelSettings::default(), tx);

    assert!(matches!(result, Err(ChannelError::Registration(RadioError::Rejected))));
    assert!(!radio.is_advertising());
}

#[test]
fn test_overlong_device_name_is_rejected() {
    let radio = SimRadio::new();
    let mut queue = CommandQueue::new();
    let (tx, _rx) = queue.split();
    let settings = ChannelSettings {
        name: "a-very-long-delivery-cart-device-name".to_string(),
        ..ChannelSettings::default()
    };

    let result = CommandChannel::start(&radio, &settings, tx);
    assert!(matches!(result, Err(ChannelError::Payload(_))));
}

#[test]
fn test_connect_stops_and_disconnect_resumes_advertising() {
    let radio = SimRadio::new();
    let mut queue = CommandQueue::new();
    let (tx, _rx) = queue.split();
    let channel = CommandChannel::start(&radio, &ChannelSettings::default(), tx).unwrap();

    let (conn, _notifications) = connect(&radio, &channel);
    assert!(channel.connections().contains(conn));
    assert!(!radio.is_advertising());

    channel.handle_event(radio.disconnect_central(conn));
    assert!(!channel.connections().contains(conn));
    assert!(radio.is_advertising());

    let stats = channel.stats();
    assert_eq!(stats.connects, 1);
    assert_eq!(stats.disconnects, 1);
}

#[test]
fn test_command_writes_are_queued_in_order() {
    let radio = SimRadio::new();
    let mut queue = CommandQueue::new();
    let (tx, mut rx) = queue.split();
    let channel = CommandChannel::start(&radio, &ChannelSettings::default(), tx).unwrap();
    let (conn, _notifications) = connect(&radio, &channel);

    write(&radio, &channel, conn, b"FORWARD");
    write(&radio, &channel, conn, b"JOINT_BASE:45");
    write(&radio, &channel, conn, b"STOP");

    assert_eq!(rx.pop().as_deref(), Some("FORWARD"));
    assert_eq!(rx.pop().as_deref(), Some("JOINT_BASE:45"));
    assert_eq!(rx.pop().as_deref(), Some("STOP"));
    assert_eq!(rx.pop(), None);
    assert_eq!(channel.stats().commands_queued, 3);
}

#[test]
fn test_undecodable_writes_are_dropped() {
    let radio = SimRadio::new();
    let mut queue = CommandQueue::new();
    let (tx, rx) = queue.split();
    let channel = CommandChannel::start(&radio, &ChannelSettings::default(), tx).unwrap();
    let (conn, _notifications) = connect(&radio, &channel);

    write(&radio, &channel, conn, &[0xc3, 0x28]);
    write(&radio, &channel, conn, &[b'X'; 100]);

    assert!(rx.is_empty());
    assert_eq!(channel.stats().decode_failures, 2);
}

#[test]
fn test_writes_to_other_attributes_are_ignored() {
    let radio = SimRadio::new();
    let mut queue = CommandQueue::new();
    let (tx, rx) = queue.split();
    let channel = CommandChannel::start(&radio, &ChannelSettings::default(), tx).unwrap();
    let (conn, _notifications) = connect(&radio, &channel);

    channel.handle_event(RadioEvent::GattsWrite {
        conn,
        value_handle: channel.telemetry_handle(),
    });

    assert!(rx.is_empty());
    assert_eq!(channel.stats(), ChannelStats { connects: 1, ..ChannelStats::default() });
}

#[test]
fn test_burst_beyond_capacity_drops_newest() {
    let radio = SimRadio::new();
    let mut queue = CommandQueue::new();
    let (tx, mut rx) = queue.split();
    let channel = CommandChannel::start(&radio, &ChannelSettings::default(), tx).unwrap();
    let (conn, _notifications) = connect(&radio, &channel);

    let usable = QUEUE_CAPACITY - 1;
    for i in 0..usable + 3 {
        write(&radio, &channel, conn, format!("JOINT_BASE:{}", i).as_bytes());
    }

    assert_eq!(rx.len(), usable);
    assert_eq!(rx.dropped(), 3);
    assert_eq!(channel.stats().commands_dropped, 3);

    // Everything that was accepted comes out once, in order
    for i in 0..usable {
        assert_eq!(rx.pop().as_deref(), Some(format!("JOINT_BASE:{}", i).as_str()));
    }
    assert!(rx.pop().is_none());
}

#[test]
fn test_notify_reaches_every_connected_peer() {
    let radio = SimRadio::new();
    let mut queue = CommandQueue::new();
    let (tx, _rx) = queue.split();
    let channel = CommandChannel::start(&radio, &ChannelSettings::default(), tx).unwrap();
    let (_a, mut rx_a) = connect(&radio, &channel);
    let (_b, mut rx_b) = connect(&radio, &channel);

    let report = channel.publish(&sample());

    assert_eq!(report.delivered, 2);
    assert_eq!(report.failed, 0);
    let expected = sample().encode().as_bytes().to_vec();
    assert_eq!(rx_a.try_recv().unwrap(), expected);
    assert_eq!(rx_b.try_recv().unwrap(), expected);
    assert_eq!(radio.attribute_value(channel.telemetry_handle()), Some(expected));
}

#[test]
fn test_failing_peer_does_not_block_others_or_get_evicted() {
    let radio = SimRadio::new();
    let mut queue = CommandQueue::new();
    let (tx, _rx) = queue.split();
    let channel = CommandChannel::start(&radio, &ChannelSettings::default(), tx).unwrap();
    let (bad, _rx_bad) = connect(&radio, &channel);
    let (good, mut rx_good) = connect(&radio, &channel);
    radio.set_notify_failure(bad, true);

    let report = channel.publish(&sample());

    assert_eq!(report.delivered, 1);
    assert_eq!(report.failed, 1);
    assert!(rx_good.try_recv().is_ok());
    assert!(channel.connections().contains(bad));
    assert!(channel.connections().contains(good));
    assert_eq!(channel.connections().len(), 2);
}

#[test]
fn test_closed_central_is_kept_until_disconnect_event() {
    let radio = SimRadio::new();
    let mut queue = CommandQueue::new();
    let (tx, _rx) = queue.split();
    let channel = CommandChannel::start(&radio, &ChannelSettings::default(), tx).unwrap();
    let (conn, rx) = connect(&radio, &channel);
    drop(rx);

    assert_eq!(channel.publish(&sample()).failed, 1);
    assert!(channel.connections().contains(conn));

    channel.handle_event(radio.disconnect_central(conn));
    assert!(channel.connections().is_empty());
    assert_eq!(channel.publish(&sample()).delivered, 0);
}

#[test]
fn test_backed_up_central_fails_notify_but_stays_connected() {
    let radio = SimRadio::new();
    let mut queue = CommandQueue::new();
    let (tx, _rx) = queue.split();
    let channel = CommandChannel::start(&radio, &ChannelSettings::default(), tx).unwrap();
    let (slow, mut rx_slow) = connect(&radio, &channel);
    let (_fast, mut rx_fast) = connect(&radio, &channel);

    // The slow central never drains its outbox
    for _ in 0..CENTRAL_OUTBOX_DEPTH {
        let report = channel.publish(&sample());
        assert_eq!(report.delivered, 2);
        rx_fast.try_recv().unwrap();
    }

    let report = channel.publish(&sample());
    assert_eq!(report.delivered, 1);
    assert_eq!(report.failed, 1);
    assert!(rx_fast.try_recv().is_ok());
    assert!(channel.connections().contains(slow));

    // Draining one slot lets the next notification through
    rx_slow.try_recv().unwrap();
    assert_eq!(channel.publish(&sample()).failed, 0);
}

#[test]
fn test_stop_halts_advertising() {
    let radio = SimRadio::new();
    let mut queue = CommandQueue::new();
    let (tx, _rx) = queue.split();
    let channel = CommandChannel::start(&radio, &ChannelSettings::default(), tx).unwrap();

    channel.stop().unwrap();
    assert!(!radio.is_advertising());
}

#[test]
fn test_connection_set_bounds() {
    let set = ConnectionSet::new();
    for conn in 0..MAX_CONNECTIONS as u16 {
        assert!(set.insert(conn));
    }
    assert!(!set.insert(99));
    // Re-inserting a tracked handle is not an overflow
    assert!(set.insert(0));
    assert_eq!(set.len(), MAX_CONNECTIONS);

    assert!(set.remove(1));
    assert!(!set.remove(1));
    assert_eq!(set.snapshot().len(), MAX_CONNECTIONS - 1);
}

#[test]
fn test_channel_is_shared_across_threads() {
    static QUEUE: static_cell::StaticCell<CommandQueue> = static_cell::StaticCell::new();
    let (tx, mut rx) = QUEUE.init(CommandQueue::new()).split();
    let radio = Arc::new(SimRadio::new());
    let channel = Arc::new(CommandChannel::start(Arc::clone(&radio), &ChannelSettings::default(), tx).unwrap());

    let (outbox, _notifications) = mpsc::channel(CENTRAL_OUTBOX_DEPTH);
    let (conn, event) = radio.connect_central(outbox);
    channel.handle_event(event);

    let producer = {
        let radio = Arc::clone(&radio);
        let channel = Arc::clone(&channel);
        std::thread::spawn(move || {
            for i in 0..10 {
                let value = format!("JOINT_ELBOW:{}", i);
                let event = radio.central_write(conn, channel.command_handle(), value.as_bytes()).unwrap();
                channel.handle_event(event);
            }
        })
    };
    producer.join().unwrap();

    let received: Vec<String> = std::iter::from_fn(|| rx.pop()).map(|t| t.to_string()).collect();
    let expected: Vec<String> = (0..10).map(|i| format!("JOINT_ELBOW:{}", i)).collect();
    assert_eq!(received, expected);
}
