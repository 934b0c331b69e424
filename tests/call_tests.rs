// Call signaling tests
// Ringing, answering, busy handling, timeouts and lost connections between
// in-process peers with loopback media.

mod common;
use common::{
    fast_config, make_mutual, setup_logging, spawn_peer, spawn_peer_with, wait_until, RawPeer, Recorder, TestPeer,
    ALICE_PHONE, BOB_PHONE, CAROL_PHONE,
};

use std::time::Duration;

use heychat::models::{CallDirection, CallRequest, CallState, CallType, Payload};
use heychat::p2p::{CallEndReason, CallError, CallEvent, LoopbackMedia, MemoryNetwork};

async fn record_calls(peer: &TestPeer) -> Recorder<CallEvent> {
    let events = Recorder::new();
    peer.session.on_call_event(events.callback()).await.unwrap();
    events
}

fn end_reasons(events: &Recorder<CallEvent>) -> Vec<CallEndReason> {
    events
        .items()
        .into_iter()
        .filter_map(|event| match event {
            CallEvent::Ended { reason, .. } => Some(reason),
            _ => None,
        })
        .collect()
}

async fn wait_for_state(peer: &TestPeer, state: CallState) {
    wait_until(&format!("{} to be {}", peer.id(), state), || async move {
        peer.session.current_call().await.map(|call| call.state) == Some(state)
    })
    .await;
}

async fn wait_for_end(events: &Recorder<CallEvent>) -> CallEndReason {
    wait_until("the call to end", || async move { !end_reasons(events).is_empty() }).await;
    end_reasons(events)[0]
}

/// Ring `callee` from `caller` and answer until both sides are Active.
async fn establish(caller: &TestPeer, callee: &TestPeer, call_type: CallType) {
    caller.session.start_call(callee.id(), call_type).await.expect("start call");
    wait_for_state(callee, CallState::Ringing).await;
    let answered = callee.session.accept_call().await.expect("accept call");
    assert_eq!(answered.state, CallState::Connecting);
    wait_for_state(caller, CallState::Active).await;
    wait_for_state(callee, CallState::Active).await;
}

#[tokio::test]
async fn test_call_is_answered_and_hung_up() {
    setup_logging();
    let network = MemoryNetwork::new();
    let alice = spawn_peer(&network, ALICE_PHONE, "Alice", "alice-addr");
    let bob = spawn_peer(&network, BOB_PHONE, "Bob", "bob-addr");
    make_mutual(&alice, &bob).await;
    let alice_events = record_calls(&alice).await;
    let bob_events = record_calls(&bob).await;

    establish(&alice, &bob, CallType::Video).await;

    let incoming = bob_events
        .items()
        .into_iter()
        .find_map(|event| match event {
            CallEvent::Incoming(call) => Some(call),
            _ => None,
        })
        .expect("bob was rung");
    assert_eq!(incoming.contact_id, ALICE_PHONE);
    assert_eq!(incoming.call_type, CallType::Video);
    assert_eq!(incoming.direction, CallDirection::Incoming);

    let states: Vec<CallState> = alice_events
        .items()
        .into_iter()
        .filter_map(|event| match event {
            CallEvent::StateChanged(call) => Some(call.state),
            _ => None,
        })
        .collect();
    assert_eq!(states, vec![CallState::Ringing, CallState::Connecting, CallState::Active]);
    assert!(alice.media.is_active() && bob.media.is_active());
    assert!(bob.media.remote_description().is_some());

    // active calls are not subject to the ringing timeout
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(alice.session.current_call().await.map(|c| c.state), Some(CallState::Active));

    alice.session.end_call().await.unwrap();
    assert_eq!(wait_for_end(&alice_events).await, CallEndReason::LocalHangup);
    assert_eq!(wait_for_end(&bob_events).await, CallEndReason::RemoteHangup);
    assert_eq!(alice.session.current_call().await, None);
    assert_eq!(bob.session.current_call().await, None);
    assert_eq!(alice.media.stop_count(), 1);
    assert_eq!(bob.media.stop_count(), 1);
    assert_eq!(alice.session.end_call().await, Err(CallError::NoActiveCall));
}

#[tokio::test]
async fn test_unanswered_call_times_out() {
    setup_logging();
    let network = MemoryNetwork::new();
    let alice = spawn_peer(&network, ALICE_PHONE, "Alice", "alice-addr");
    let bob = spawn_peer(&network, BOB_PHONE, "Bob", "bob-addr");
    alice.session.connect(bob.address()).await.unwrap();
    let alice_events = record_calls(&alice).await;
    let bob_events = record_calls(&bob).await;

    let call = alice.session.start_call(BOB_PHONE, CallType::Audio).await.unwrap();
    assert_eq!(call.state, CallState::Ringing);
    wait_for_state(&bob, CallState::Ringing).await;

    assert_eq!(wait_for_end(&alice_events).await, CallEndReason::Timeout);
    assert_eq!(wait_for_end(&bob_events).await, CallEndReason::Timeout);
    assert_eq!(alice.session.current_call().await, None);
    assert_eq!(bob.session.current_call().await, None);
    assert_eq!(bob.session.accept_call().await, Err(CallError::NoActiveCall));
}

#[tokio::test]
async fn test_second_caller_gets_busy() {
    setup_logging();
    let network = MemoryNetwork::new();
    let config = fast_config();
    let slow = heychat::p2p::SessionConfig {
        call_timeout: Duration::from_secs(30),
        ..config
    };
    let alice = spawn_peer_with(&network, ALICE_PHONE, "Alice", "alice-addr", slow.clone(), LoopbackMedia::new());
    let bob = spawn_peer_with(&network, BOB_PHONE, "Bob", "bob-addr", slow.clone(), LoopbackMedia::new());
    let carol = spawn_peer_with(&network, CAROL_PHONE, "Carol", "carol-addr", slow, LoopbackMedia::new());
    alice.session.connect(bob.address()).await.unwrap();
    carol.session.connect(bob.address()).await.unwrap();
    let bob_events = record_calls(&bob).await;
    let carol_events = record_calls(&carol).await;

    alice.session.start_call(BOB_PHONE, CallType::Audio).await.unwrap();
    wait_for_state(&bob, CallState::Ringing).await;
    let before = bob.session.current_call().await.unwrap();

    carol.session.start_call(BOB_PHONE, CallType::Video).await.unwrap();
    assert_eq!(wait_for_end(&carol_events).await, CallEndReason::Busy);

    let events = &bob_events;
    wait_until("bob to report the missed call", || async move {
        events
            .items()
            .iter()
            .any(|e| matches!(e, CallEvent::BusyRejected { caller, .. } if caller == CAROL_PHONE))
    })
    .await;
    assert_eq!(bob.session.current_call().await, Some(before));

    // busy locally as well
    assert_eq!(bob.session.start_call(CAROL_PHONE, CallType::Audio).await, Err(CallError::Busy));
}

#[tokio::test]
async fn test_rejected_call() {
    setup_logging();
    let network = MemoryNetwork::new();
    let alice = spawn_peer(&network, ALICE_PHONE, "Alice", "alice-addr");
    let bob = spawn_peer(&network, BOB_PHONE, "Bob", "bob-addr");
    alice.session.connect(bob.address()).await.unwrap();
    let alice_events = record_calls(&alice).await;
    let bob_events = record_calls(&bob).await;

    alice.session.start_call(BOB_PHONE, CallType::Audio).await.unwrap();
    wait_for_state(&bob, CallState::Ringing).await;
    // only the callee can answer
    assert_eq!(
        alice.session.accept_call().await,
        Err(CallError::InvalidState(CallState::Ringing))
    );

    bob.session.reject_call().await.unwrap();
    assert_eq!(wait_for_end(&bob_events).await, CallEndReason::Declined);
    let reason = wait_for_end(&alice_events).await;
    assert_eq!(reason, CallEndReason::RemoteRejected);
    assert_eq!(reason.error(), Some(CallError::RemoteRejected));
}

#[tokio::test]
async fn test_call_needs_connection() {
    setup_logging();
    let network = MemoryNetwork::new();
    let alice = spawn_peer(&network, ALICE_PHONE, "Alice", "alice-addr");

    let result = alice.session.start_call(BOB_PHONE, CallType::Audio).await;
    assert_eq!(result, Err(CallError::NotConnected(BOB_PHONE.to_string())));
    assert_eq!(alice.session.current_call().await, None);
}

#[tokio::test]
async fn test_dropped_connection_ends_call() {
    setup_logging();
    let network = MemoryNetwork::new();
    let alice = spawn_peer(&network, ALICE_PHONE, "Alice", "alice-addr");
    let bob = spawn_peer(&network, BOB_PHONE, "Bob", "bob-addr");
    make_mutual(&alice, &bob).await;
    let alice_events = record_calls(&alice).await;

    establish(&alice, &bob, CallType::Audio).await;
    let first = alice.session.current_call().await.unwrap();

    bob.session.disconnect_all().await;
    assert_eq!(wait_for_end(&alice_events).await, CallEndReason::ConnectionLost);
    assert_eq!(alice.session.current_call().await, None);
    assert!(!alice.media.is_active());

    // a fresh call afterwards is a new, independent session
    alice.session.connect(bob.address()).await.unwrap();
    let second = alice.session.start_call(BOB_PHONE, CallType::Audio).await.unwrap();
    assert_ne!(second.id, first.id);
    assert_eq!(second.state, CallState::Ringing);
    assert_eq!(second.end_reason, None);
    wait_for_state(&bob, CallState::Ringing).await;
}

#[tokio::test]
async fn test_media_failure_on_answer() {
    setup_logging();
    let network = MemoryNetwork::new();
    let alice = spawn_peer(&network, ALICE_PHONE, "Alice", "alice-addr");
    let bob = spawn_peer_with(&network, BOB_PHONE, "Bob", "bob-addr", fast_config(), LoopbackMedia::failing());
    alice.session.connect(bob.address()).await.unwrap();
    let alice_events = record_calls(&alice).await;

    alice.session.start_call(BOB_PHONE, CallType::Video).await.unwrap();
    wait_for_state(&bob, CallState::Ringing).await;

    assert!(matches!(bob.session.accept_call().await, Err(CallError::Media(_))));
    assert_eq!(bob.session.current_call().await, None);
    assert_eq!(wait_for_end(&alice_events).await, CallEndReason::MediaFailure);
}

#[tokio::test]
async fn test_failed_answer_reports_nothing_after_ended() {
    setup_logging();
    let network = MemoryNetwork::new();
    let bob = spawn_peer(&network, BOB_PHONE, "Bob", "bob-addr");
    let bob_events = record_calls(&bob).await;
    let b = &bob;

    let mut carol = RawPeer::open(&network, CAROL_PHONE, "Carol", "carol-addr", bob.address()).await;
    carol.introduce();
    wait_until("bob to identify carol", || async move { b.session.resolve(CAROL_PHONE).await.is_some() }).await;
    carol.send(&carol.message(
        Some(BOB_PHONE),
        Payload::CallRequest(CallRequest {
            call_type: CallType::Audio,
        }),
    ));
    wait_for_state(&bob, CallState::Ringing).await;

    // carol's side of the link goes away just as bob answers
    carol.stop_reading();
    let answer = bob.session.accept_call().await;
    assert!(matches!(answer, Err(CallError::NotConnected(_))), "{:?}", answer);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let events = bob_events.items();
    assert!(matches!(events.first(), Some(CallEvent::Incoming(_))), "{:?}", events);
    assert!(
        matches!(
            events.last(),
            Some(CallEvent::Ended {
                reason: CallEndReason::ConnectionLost,
                ..
            })
        ),
        "{:?}",
        events
    );
    assert!(!events.iter().any(|event| matches!(event, CallEvent::StateChanged(_))), "{:?}", events);
    assert_eq!(end_reasons(&bob_events).len(), 1);
    assert!(bob.session.current_call().await.is_none());
}
