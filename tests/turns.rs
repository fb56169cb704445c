//! End-to-end turn aggregation scenarios on a paused clock

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use beacon_turns::Submitted;
use beacon_turns::channels::messenger::types::MessagingEvent;
use beacon_turns::config::DEFAULT_FALLBACK_REPLY;
use beacon_turns::events::classify::classify_messaging;
use beacon_turns::ledger::EventLedger;
use tokio::time::Instant;

mod common;
use common::{Behavior, MockReasoner, advance, durable_harness, harness, image, ms, text};

#[tokio::test(start_paused = true)]
async fn greeting_is_answered_after_short_wait() {
    let h = harness(MockReasoner::new(Behavior::Echo));
    let start = Instant::now();

    h.dispatcher.submit(text("u1", "xin chào", "m1")).await;

    advance(ms(450)).await;
    assert!(h.reasoner.turns().await.is_empty());

    advance(ms(100)).await;
    let calls = h.reasoner.calls.lock().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1.combined_text, "xin chào");
    assert!(calls[0].0.duration_since(start) >= ms(500));
    drop(calls);

    assert_eq!(h.channel.contents().await, ["re: xin chào"]);
}

#[tokio::test(start_paused = true)]
async fn late_question_is_linked_to_earlier_image() {
    let h = harness(MockReasoner::new(Behavior::Echo));

    h.dispatcher.submit(image("u1", "p1")).await;
    advance(ms(300)).await;
    h.dispatcher.submit(text("u1", "combo này bao nhiêu", "m2")).await;
    advance(Duration::from_secs(9)).await;

    let turns = h.reasoner.turns().await;
    match turns.as_slice() {
        [single] => {
            assert_eq!(single.combined_text, "combo này bao nhiêu");
            assert_eq!(single.attachments.len(), 1);
        }
        [photo, question] => {
            assert!(photo.combined_text.is_empty());
            assert_eq!(photo.attachments.len(), 1);
            assert_eq!(question.combined_text, "combo này bao nhiêu");
            assert!(question.attachments.is_empty());
            let linked = question.linked_context.as_deref().unwrap();
            assert!(linked.contains("https://cdn.example/p1.jpg"));
        }
        other => panic!("unexpected turns: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn dangling_reference_waits_then_goes_text_only() {
    let h = harness(MockReasoner::new(Behavior::Echo));
    h.dispatcher.submit(text("u1", "mô tả ảnh này", "m1")).await;

    advance(Duration::from_millis(7900)).await;
    assert!(h.reasoner.turns().await.is_empty());

    advance(ms(200)).await;
    let turns = h.reasoner.turns().await;
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].combined_text, "mô tả ảnh này");
    assert!(turns[0].attachments.is_empty());
    assert!(turns[0].linked_context.is_none());
}

#[tokio::test(start_paused = true)]
async fn burst_fragments_form_one_turn() {
    let h = harness(MockReasoner::new(Behavior::Echo));

    h.dispatcher.submit(text("u1", "anh", "m1")).await;
    advance(ms(100)).await;
    h.dispatcher.submit(text("u1", "muốn đặt bàn", "m2")).await;
    advance(Duration::from_secs(2)).await;

    let turns = h.reasoner.turns().await;
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].combined_text, "anh muốn đặt bàn");
    assert_eq!(turns[0].event_ids.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn reasoner_timeout_sends_one_apology_without_resubmission() {
    let h = durable_harness(MockReasoner::new(Behavior::Hang));
    h.dispatcher.submit(text("u1", "đặt bàn 7 giờ", "m1")).await;

    advance(Duration::from_secs(40)).await;
    assert_eq!(h.channel.contents().await, [DEFAULT_FALLBACK_REPLY]);
    assert_eq!(h.dispatcher.stats().reasoner_failures, 1);

    // Events were acknowledged, so a restart would not replay the turn
    assert_eq!(h.dispatcher.replay().await, 0);

    advance(Duration::from_secs(60)).await;
    assert_eq!(h.reasoner.turns().await.len(), 1);
    assert_eq!(h.channel.contents().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn every_event_lands_in_exactly_one_turn() {
    let h = harness(MockReasoner::new(Behavior::Echo));
    let mut submitted = HashMap::new();

    for i in 0..12 {
        for user in ["u1", "u2", "u3"] {
            let event = if i % 4 == 3 {
                image(user, &format!("{user}-{i}"))
            } else {
                text(user, &format!("phần {i}"), &format!("{user}-{i}"))
            };
            submitted.insert(event.fingerprint(), user.to_string());
            assert!(matches!(
                h.dispatcher.submit(event).await,
                Submitted::Accepted { .. }
            ));
        }
        // Some gaps exceed the short wait, some do not
        advance(if i % 3 == 0 { ms(700) } else { ms(150) }).await;
    }
    advance(Duration::from_secs(15)).await;

    let turns = h.reasoner.turns().await;
    let mut seen = HashSet::new();
    for turn in &turns {
        assert!(!turn.event_ids.is_empty());
        for id in &turn.event_ids {
            assert!(seen.insert(id.clone()), "event {id} appeared in two turns");
            // Turns never mix users
            assert_eq!(submitted.get(id), Some(&turn.user_id));
        }
    }
    assert_eq!(seen.len(), submitted.len());
    let stats = h.dispatcher.stats();
    assert_eq!(stats.events_received, 36);
    assert_eq!(stats.turns_finalized, u64::try_from(turns.len()).unwrap());
    assert_eq!(stats.pending_turns, 0);
}

#[tokio::test(start_paused = true)]
async fn turns_reach_reasoner_in_creation_order() {
    let h = harness(MockReasoner::with_delay(Behavior::Echo, Duration::from_secs(3)));

    h.dispatcher.submit(text("u1", "một", "m1")).await;
    advance(ms(600)).await;
    h.dispatcher.submit(text("u1", "hai", "m2")).await;
    advance(ms(600)).await;
    h.dispatcher.submit(text("u1", "ba", "m3")).await;
    advance(Duration::from_secs(15)).await;

    let calls = h.reasoner.calls.lock().await;
    let texts: Vec<_> = calls.iter().map(|(_, t)| t.combined_text.as_str()).collect();
    assert_eq!(texts, ["một", "hai", "ba"]);

    // Each call starts only after the previous one finished
    for pair in calls.windows(2) {
        assert!(pair[1].0.duration_since(pair[0].0) >= Duration::from_secs(3));
        assert!(pair[0].1.turn_id < pair[1].1.turn_id);
    }
    drop(calls);

    assert_eq!(h.channel.contents().await, ["re: một", "re: hai", "re: ba"]);
}

#[tokio::test(start_paused = true)]
async fn late_event_opens_fresh_turn_while_reasoner_runs() {
    let h = harness(MockReasoner::with_delay(Behavior::Echo, Duration::from_secs(5)));
    let aggregator = h.dispatcher.aggregator();

    h.dispatcher.submit(text("u1", "cho mình menu", "m1")).await;
    advance(ms(600)).await;
    assert_eq!(h.reasoner.calls.lock().await.len(), 1);
    assert!(h.reasoner.finished.lock().await.is_empty());

    h.dispatcher.submit(text("u1", "với giá nữa", "m2")).await;
    let pending = aggregator.pending("u1").expect("fresh turn opened");
    assert_eq!(pending.event_count, 1);
    assert_eq!(aggregator.in_flight(), 1);
}

#[tokio::test(start_paused = true)]
async fn deadline_moves_with_each_fragment() {
    let h = harness(MockReasoner::new(Behavior::Echo));

    h.dispatcher.submit(text("u1", "a", "m1")).await;
    advance(ms(300)).await;
    h.dispatcher.submit(text("u1", "b", "m2")).await;
    advance(ms(300)).await;
    h.dispatcher.submit(text("u1", "c", "m3")).await;

    // Past the replaced deadlines (0.5 s, 0.8 s), short of the live one (1.1 s)
    advance(ms(400)).await;
    assert!(h.reasoner.turns().await.is_empty());

    advance(ms(200)).await;
    let turns = h.reasoner.turns().await;
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].combined_text, "a b c");
    assert_eq!(h.dispatcher.stats().invariant_violations, 0);
}

#[tokio::test(start_paused = true)]
async fn hard_ceiling_stops_endless_reference_turn() {
    let h = harness(MockReasoner::new(Behavior::Echo));
    let start = Instant::now();

    for i in 0..6 {
        h.dispatcher.submit(text("u1", "ảnh này", &format!("m{i}"))).await;
        advance(Duration::from_secs(2)).await;
    }
    advance(Duration::from_secs(10)).await;

    let calls = h.reasoner.calls.lock().await;
    assert_eq!(calls.len(), 1);
    let elapsed = calls[0].0.duration_since(start);
    assert!(elapsed >= Duration::from_secs(12) && elapsed < Duration::from_millis(12_500));
}

async fn run_script(h: &common::Harness) -> Vec<(String, usize)> {
    h.dispatcher.submit(text("u1", "anh", "m1")).await;
    advance(ms(100)).await;
    h.dispatcher.submit(text("u1", "muốn đặt bàn", "m2")).await;
    advance(Duration::from_secs(2)).await;
    h.dispatcher.submit(image("u1", "p1")).await;
    advance(Duration::from_secs(2)).await;
    h.dispatcher.submit(text("u2", "mô tả ảnh này", "m3")).await;
    advance(Duration::from_secs(1)).await;
    h.dispatcher.submit(image("u2", "p2")).await;
    advance(Duration::from_secs(20)).await;

    let mut turns: Vec<_> = h
        .reasoner
        .turns()
        .await
        .into_iter()
        .map(|t| (format!("{}:{}", t.user_id, t.combined_text), t.attachments.len()))
        .collect();
    turns.sort();
    turns
}

#[tokio::test(start_paused = true)]
async fn degraded_mode_aggregates_like_durable_mode() {
    let durable = durable_harness(MockReasoner::new(Behavior::Echo));
    let degraded = harness(MockReasoner::new(Behavior::Echo));

    assert_eq!(durable.dispatcher.ledger_mode().as_str(), "durable");
    assert_eq!(degraded.dispatcher.ledger_mode().as_str(), "degraded");

    let a = run_script(&durable).await;
    let b = run_script(&degraded).await;
    assert_eq!(a, b);
    assert_eq!(
        a,
        [
            ("u1:".to_string(), 1),
            ("u1:anh muốn đặt bàn".to_string(), 0),
            ("u2:mô tả ảnh này".to_string(), 1),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn replay_resumes_unconsumed_events() {
    let pool = beacon_turns::db::init_memory().unwrap();
    let ledger = beacon_turns::db::SqliteLedger::new(pool.clone());

    // Left behind by a previous run that never finalized the turn
    ledger.append(&text("u1", "anh", "m1")).await.unwrap();
    ledger.append(&text("u1", "muốn đặt bàn", "m2")).await.unwrap();

    let gate = beacon_turns::LedgerGate::durable(std::sync::Arc::new(ledger.clone()));
    let h = common::harness_with(
        &common::test_config(&[]),
        gate,
        MockReasoner::new(Behavior::Echo),
    );

    assert_eq!(h.dispatcher.replay().await, 2);
    advance(Duration::from_secs(2)).await;

    let turns = h.reasoner.turns().await;
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].combined_text, "anh muốn đặt bàn");
    assert!(ledger.unconsumed(Duration::from_secs(600)).await.unwrap().is_empty());

    // Redelivery of a replayed event is still recognized
    assert_eq!(
        h.dispatcher.submit(text("u1", "anh", "m1")).await,
        Submitted::Duplicate
    );
}

#[tokio::test(start_paused = true)]
async fn repeated_attachments_in_one_message_all_reach_reasoner() {
    let messaging: MessagingEvent = serde_json::from_str(
        r#"{"sender":{"id":"u1"},"recipient":{"id":"page"},"timestamp":1700000000000,
            "message":{"mid":"m.1","attachments":[
                {"type":"image","payload":{"url":"https://cdn.example/same.jpg"}},
                {"type":"image","payload":{"url":"https://cdn.example/same.jpg"}}
            ]}}"#,
    )
    .unwrap();

    for h in [
        harness(MockReasoner::new(Behavior::Echo)),
        durable_harness(MockReasoner::new(Behavior::Echo)),
    ] {
        for event in classify_messaging(&messaging, chrono::Utc::now()) {
            assert!(matches!(
                h.dispatcher.submit(event).await,
                Submitted::Accepted { .. }
            ));
        }
        advance(Duration::from_secs(2)).await;

        let turns = h.reasoner.turns().await;
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].attachments.len(), 2);
        assert_eq!(h.dispatcher.stats().duplicates_dropped, 0);
    }
}
