//! Tests for the dispatcher

use super::*;
use crate::midi::MidiMessage;
use crate::queue::event_queue;
use crate::state::Presence;
use anyhow::anyhow;
use parking_lot::Mutex;

/// Sink that records every payload into a shared log
#[derive(Clone, Default)]
struct RecordingSink {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    fail: Arc<Mutex<bool>>,
}

impl RecordingSink {
    fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }
}

impl MidiSink for RecordingSink {
    fn send(&mut self, data: &[u8]) -> anyhow::Result<()> {
        if *self.fail.lock() {
            return Err(anyhow!("port gone"));
        }
        self.sent.lock().push(data.to_vec());
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

struct Harness {
    dispatcher: Dispatcher,
    state: Arc<ConnectivityState>,
    amp: RecordingSink,
    mirror: RecordingSink,
}

fn harness(presence: Presence) -> Harness {
    let state = Arc::new(ConnectivityState::new(presence));
    let amp = RecordingSink::default();
    let mirror = RecordingSink::default();
    let sink: Box<dyn MidiSink> = Box::new(amp.clone());
    let slot: SinkSlot = Arc::new(Mutex::new(Some(sink)));

    let dispatcher = Dispatcher::new(
        TranslationConfig::default(),
        &DispatcherConfig::default(),
        state.clone(),
        slot,
        Some(Box::new(mirror.clone())),
    );

    Harness { dispatcher, state, amp, mirror }
}

fn connected() -> Harness {
    harness(Presence::new(true, true))
}

fn cc(cc: u8, value: u8) -> MidiEvent {
    MidiEvent::from_message(MidiMessage::ControlChange { channel: 0, cc, value })
}

fn pc(program: u8) -> MidiEvent {
    MidiEvent::from_message(MidiMessage::ProgramChange { channel: 0, program })
}

#[test]
fn test_mirror_gets_raw_amp_gets_mapped() {
    let mut h = connected();

    h.dispatcher.handle_event(&cc(4, 100));

    assert_eq!(h.mirror.sent(), vec![vec![0xB0, 4, 100]]);
    assert_eq!(h.amp.sent(), vec![vec![0xB0, 80, 50]]);
}

#[test]
fn test_volume_is_remapped() {
    let mut h = connected();

    h.dispatcher.handle_event(&cc(7, 90));

    assert_eq!(h.amp.sent(), vec![vec![0xB0, 81, 90]]);
}

#[test]
fn test_duplicate_reaches_mirror_but_not_amp() {
    let mut h = connected();

    h.dispatcher.handle_event(&cc(7, 64));
    h.dispatcher.handle_event(&cc(7, 64));

    assert_eq!(h.mirror.sent().len(), 2);
    assert_eq!(h.amp.sent(), vec![vec![0xB0, 81, 64]]);
    assert_eq!(h.dispatcher.stats().duplicates, 1);
}

#[test]
fn test_program_change_preceded_by_volume_reset() {
    let mut h = connected();

    h.dispatcher.handle_event(&cc(7, 20));
    h.dispatcher.handle_event(&pc(5));

    assert_eq!(
        h.amp.sent(),
        vec![vec![0xB0, 81, 20], vec![0xB0, 81, 127], vec![0xC0, 5]]
    );
    assert_eq!(h.mirror.sent(), vec![vec![0xB0, 7, 20], vec![0xC0, 5]]);
}

#[test]
fn test_program_change_then_same_cc_is_sent() {
    let mut h = connected();

    h.dispatcher.handle_event(&cc(7, 127));
    h.dispatcher.handle_event(&pc(1));
    // Last sent is now the program change, not the CC
    h.dispatcher.handle_event(&cc(7, 127));

    assert_eq!(h.amp.sent().len(), 4);
}

#[test]
fn test_amp_absent_drops_amp_sends_only() {
    let mut h = harness(Presence::new(true, false));

    h.dispatcher.handle_event(&cc(7, 1));
    h.dispatcher.handle_event(&pc(2));

    assert!(h.amp.sent().is_empty());
    assert_eq!(h.mirror.sent().len(), 2);
    assert_eq!(h.dispatcher.stats().dropped, 2);
}

#[test]
fn test_drop_while_absent_still_updates_last_sent() {
    let mut h = harness(Presence::new(true, false));

    h.dispatcher.handle_event(&cc(7, 33));
    h.state.set_amp_present(true);
    h.dispatcher.handle_event(&cc(7, 33));
    h.dispatcher.handle_event(&cc(7, 34));

    assert_eq!(h.amp.sent(), vec![vec![0xB0, 81, 34]]);
    assert_eq!(h.dispatcher.stats().duplicates, 1);
}

#[test]
fn test_reconnect_generation_clears_last_sent() {
    let mut h = connected();

    h.dispatcher.handle_event(&cc(7, 50));
    h.state.bump_generation();
    h.dispatcher.handle_event(&cc(7, 50));

    assert_eq!(h.amp.sent().len(), 2);
}

#[test]
fn test_failed_amp_send_abandons_rest_of_event() {
    let mut h = connected();

    *h.amp.fail.lock() = true;
    h.dispatcher.handle_event(&pc(4));
    *h.amp.fail.lock() = false;
    h.dispatcher.handle_event(&cc(7, 10));

    // The program change itself was never attempted
    assert_eq!(h.amp.sent(), vec![vec![0xB0, 81, 10]]);
    assert_eq!(h.dispatcher.stats().sent_to_amp, 1);
}

#[test]
fn test_failed_cc_send_still_counts_as_last_sent() {
    let mut h = connected();

    *h.amp.fail.lock() = true;
    h.dispatcher.handle_event(&cc(7, 10));
    *h.amp.fail.lock() = false;
    h.dispatcher.handle_event(&cc(7, 10));
    h.dispatcher.handle_event(&cc(7, 11));

    // The repeat is a duplicate of the failed send and is not retried
    assert_eq!(h.amp.sent(), vec![vec![0xB0, 81, 11]]);
    assert_eq!(h.dispatcher.stats().duplicates, 1);
}

#[test]
fn test_closed_amp_slot_drops() {
    let state = Arc::new(ConnectivityState::new(Presence::new(true, true)));
    let slot: SinkSlot = Arc::new(Mutex::new(None));
    let mut dispatcher = Dispatcher::new(
        TranslationConfig::default(),
        &DispatcherConfig::default(),
        state,
        slot,
        None,
    );

    dispatcher.handle_event(&cc(7, 10));
    assert_eq!(dispatcher.stats().dropped, 1);
}

#[tokio::test]
async fn test_run_consumes_queue_while_amp_absent() {
    let h = harness(Presence::new(true, false));
    let (tx, rx) = event_queue();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    for v in 0..10 {
        tx.push(cc(7, v)).unwrap();
    }
    drop(tx);

    let stats = h.dispatcher.run(rx, shutdown_rx).await;

    assert_eq!(stats.received, 10);
    assert_eq!(stats.dropped, 10);
    assert!(h.amp.sent().is_empty());
    assert_eq!(h.mirror.sent().len(), 10);
}

#[tokio::test]
async fn test_backlog_dispatched_in_order_when_amp_returns() {
    let h = harness(Presence::new(true, false));
    let (tx, rx) = event_queue();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    // Backlog built up while the amp was away
    let events = [cc(7, 1), pc(3), cc(4, 40), cc(7, 2)];
    for event in &events {
        tx.push(event.clone()).unwrap();
    }
    drop(tx);
    h.state.set_amp_present(true);

    h.dispatcher.run(rx, shutdown_rx).await;

    assert_eq!(
        h.amp.sent(),
        vec![
            vec![0xB0, 81, 1],
            vec![0xB0, 81, 127],
            vec![0xC0, 3],
            vec![0xB0, 80, 20],
            vec![0xB0, 81, 2],
        ]
    );
    let raw: Vec<Vec<u8>> = events.iter().map(|e| e.raw.clone()).collect();
    assert_eq!(h.mirror.sent(), raw);
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let h = connected();
    let (_tx, rx) = event_queue();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(h.dispatcher.run(rx, shutdown_rx));
    shutdown_tx.send(true).unwrap();

    let stats = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("dispatcher did not stop")
        .unwrap();
    assert_eq!(stats, DispatchStats::default());
}
