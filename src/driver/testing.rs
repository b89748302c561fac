//! Mock frame source for driver tests
//!
//! Lets the driver run end to end against scripted connections, with
//! tokio's paused clock standing in for real time.

use crate::error::StreamError;
use crate::protocol::Frame;
use crate::transport::{FrameSource, FrameStream};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::Url;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// What one `open` call produces
#[derive(Debug, Clone)]
pub enum Script {
    /// The connection attempt fails
    Fail(StreamError),
    /// Deliver the frames, then end the stream
    Frames(Vec<Frame>),
    /// Deliver the frames, then stay open without sending anything
    Hang(Vec<Frame>),
    /// Deliver each frame after its delay, then end the stream
    Paced(Vec<(Duration, Frame)>),
}

/// Frame source that replays queued scripts, one per connection
#[derive(Default)]
pub struct ScriptedFrameSource {
    scripts: Mutex<VecDeque<Script>>,
    /// Every `open` call, in order
    opens: Mutex<Vec<(Instant, Url)>>,
}

impl ScriptedFrameSource {
    pub fn new(scripts: impl IntoIterator<Item = Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            opens: Mutex::new(Vec::new()),
        })
    }

    pub fn open_count(&self) -> usize {
        self.opens.lock().unwrap().len()
    }

    pub fn open_times(&self) -> Vec<Instant> {
        self.opens.lock().unwrap().iter().map(|(at, _)| *at).collect()
    }

    pub fn urls(&self) -> Vec<Url> {
        self.opens.lock().unwrap().iter().map(|(_, url)| url.clone()).collect()
    }
}

#[async_trait]
impl FrameSource for ScriptedFrameSource {
    async fn open(&self, url: Url) -> Result<FrameStream, StreamError> {
        self.opens.lock().unwrap().push((Instant::now(), url));
        let script = self.scripts.lock().unwrap().pop_front();
        match script {
            None => Err(StreamError::connection("no scripted response")),
            Some(Script::Fail(error)) => Err(error),
            Some(Script::Frames(frames)) => Ok(stream::iter(frames.into_iter().map(Ok)).boxed()),
            Some(Script::Hang(frames)) => Ok(stream::iter(frames.into_iter().map(Ok))
                .chain(stream::pending())
                .boxed()),
            Some(Script::Paced(frames)) => Ok(stream::iter(frames)
                .then(|(delay, frame)| async move {
                    tokio::time::sleep(delay).await;
                    Ok::<_, StreamError>(frame)
                })
                .boxed()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::driver::{
        CallbackEvent, ChannelCallbacks, ConnectionHealth, StreamClient, StreamOptions,
    };
    use crate::error::StreamErrorKind;
    use crate::mode::{Mode, ModeMachine};
    use crate::protocol::{DeltaFrame, DoneFrame};
    use crate::store::{Outcome, FAILED_TURN_TEXT};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn config() -> StreamConfig {
        StreamConfig::default().with_uid("user-1")
    }

    fn spawn(
        config: StreamConfig,
        scripts: Vec<Script>,
    ) -> (StreamClient, Arc<ScriptedFrameSource>, Arc<ModeMachine>) {
        let source = ScriptedFrameSource::new(scripts);
        let mode = ModeMachine::new();
        let client = StreamClient::spawn(config, "s1", Arc::clone(&source), Arc::clone(&mode));
        (client, source, mode)
    }

    fn delta(text: &str, seq: u64) -> Frame {
        Frame::Delta(DeltaFrame::new(text).with_seq(seq))
    }

    fn done() -> Frame {
        Frame::Done(DoneFrame::default())
    }

    /// Collect callback events up to and including the terminal one
    async fn until_terminal(rx: &mut mpsc::UnboundedReceiver<CallbackEvent>) -> Vec<CallbackEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
        events
    }

    async fn assert_silent_afterwards(rx: &mut mpsc::UnboundedReceiver<CallbackEvent>) {
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(rx.try_recv().is_err(), "no callback after the terminal one");
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_errors_retry_with_backoff_then_exhaust() {
        let scripts = (0..4).map(|_| Script::Fail(StreamError::network("unreachable"))).collect();
        let (client, source, mode) = spawn(config(), scripts);
        let (callbacks, mut rx) = ChannelCallbacks::new();

        let turn_id = client
            .start_stream("hi", callbacks, StreamOptions::for_turn("m1"))
            .await
            .unwrap();
        let events = until_terminal(&mut rx).await;

        let retries: Vec<(u32, Duration)> = events
            .iter()
            .filter_map(|e| match e {
                CallbackEvent::Retry { attempt, delay, .. } => Some((*attempt, *delay)),
                _ => None,
            })
            .collect();
        assert_eq!(
            retries,
            vec![
                (1, Duration::from_secs(1)),
                (2, Duration::from_secs(2)),
                (3, Duration::from_secs(4)),
            ]
        );
        match events.last() {
            Some(CallbackEvent::Error(e)) => assert_eq!(e.kind, StreamErrorKind::RetriesExhausted),
            other => panic!("expected a terminal error, got {other:?}"),
        }

        let opens = source.open_times();
        assert_eq!(opens.len(), 4);
        let gaps: Vec<Duration> = opens.windows(2).map(|w| w[1] - w[0]).collect();
        for (gap, expected) in gaps.iter().zip([1_000, 2_000, 4_000]) {
            let expected = Duration::from_millis(expected);
            assert!(
                *gap >= expected && *gap < expected + Duration::from_millis(50),
                "retry gap {gap:?}, expected about {expected:?}"
            );
        }

        let turn = client.store().get(&turn_id).cloned().unwrap();
        assert_eq!(turn.text, FAILED_TURN_TEXT);
        assert!(turn.error.unwrap().contains("Failed after 3 retries"));
        assert!(!client.is_streaming());
        assert_eq!(client.connection_health(), ConnectionHealth::Unhealthy);
        assert_eq!(mode.current(), Mode::Error);

        assert_silent_afterwards(&mut rx).await;
        assert_eq!(source.open_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_and_foreign_fragments_are_dropped() {
        let frames = vec![
            Frame::Open,
            Frame::Delta(DeltaFrame::new("Hello").with_seq(0).for_turn("m1")),
            delta(" world", 1),
            delta("Hello", 0),
            Frame::Delta(DeltaFrame::new("cross-talk").for_turn("m0")),
            done(),
        ];
        let (client, source, mode) = spawn(config(), vec![Script::Frames(frames)]);
        let (callbacks, mut rx) = ChannelCallbacks::new();

        client
            .start_stream("hi", callbacks, StreamOptions::for_turn("m1"))
            .await
            .unwrap();
        let events = until_terminal(&mut rx).await;

        assert_eq!(events[0], CallbackEvent::Open);
        assert_eq!(
            events[1],
            CallbackEvent::FirstFragment {
                turn_id: "m1".to_string()
            }
        );
        let CallbackEvent::Complete(turn) = &events[2] else {
            panic!("expected completion, got {:?}", events[2]);
        };
        assert_eq!(turn.text, "Hello world");
        assert!(!turn.is_streaming);
        let performance = turn.performance.clone().unwrap();
        assert_eq!(performance.fragments, 2);
        assert_eq!(performance.dropped_fragments, 2);
        assert_eq!(performance.retries, 0);
        assert_eq!(performance.characters, 11);

        let url = &source.urls()[0];
        let query: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(query.contains(&("sessionId".to_string(), "s1".to_string())));
        assert!(query.contains(&("uid".to_string(), "user-1".to_string())));
        assert!(query.contains(&("clientMessageId".to_string(), "m1".to_string())));

        let path: Vec<(Mode, Mode)> = mode
            .get_state()
            .history
            .iter()
            .map(|t| (t.from, t.to))
            .collect();
        assert_eq!(
            path,
            vec![
                (Mode::Idle, Mode::Thinking),
                (Mode::Thinking, Mode::Streaming),
                (Mode::Streaming, Mode::Idle),
            ]
        );
        assert_silent_afterwards(&mut rx).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_without_done_retries_and_resumes_sequence() {
        let scripts = vec![
            Script::Frames(vec![delta("a", 0)]),
            Script::Frames(vec![delta("a", 0), delta("b", 1), done()]),
        ];
        let (client, source, _mode) = spawn(config(), scripts);
        let (callbacks, mut rx) = ChannelCallbacks::new();

        client
            .start_stream("hi", callbacks, StreamOptions::for_turn("m1"))
            .await
            .unwrap();
        let events = until_terminal(&mut rx).await;

        assert!(events.iter().any(|e| matches!(
            e,
            CallbackEvent::Retry { attempt: 1, error, .. } if error.kind == StreamErrorKind::Connection
        )));
        let Some(CallbackEvent::Complete(turn)) = events.last() else {
            panic!("expected completion, got {events:?}");
        };
        assert_eq!(turn.text, "ab");
        let performance = turn.performance.clone().unwrap();
        assert_eq!(performance.retries, 1);
        assert_eq!(performance.dropped_fragments, 1);
        assert_eq!(source.open_count(), 2);
        assert_eq!(client.retry_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_fires_exactly_once() {
        let frames = vec![
            delta("a", 0),
            Frame::Done(DoneFrame {
                full: Some("final answer".to_string()),
            }),
            delta("late", 1),
            done(),
        ];
        let (client, _source, _mode) = spawn(config(), vec![Script::Frames(frames)]);
        let (callbacks, mut rx) = ChannelCallbacks::new();

        let turn_id = client.start_stream("hi", callbacks, StreamOptions::default()).await.unwrap();
        let events = until_terminal(&mut rx).await;
        assert!(matches!(events.last(), Some(CallbackEvent::Complete(_))));

        assert_silent_afterwards(&mut rx).await;
        assert_eq!(client.store().get(&turn_id).unwrap().text, "final answer");
        assert_eq!(client.status(), crate::driver::StreamStatus::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_fails_the_turn_once() {
        let scripts = vec![Script::Hang(vec![]); 4];
        let (client, source, mode) = spawn(config(), scripts);
        let (callbacks, mut rx) = ChannelCallbacks::new();

        let started = Instant::now();
        let turn_id = client.start_stream("hi", callbacks, StreamOptions::default()).await.unwrap();
        let events = until_terminal(&mut rx).await;

        assert_eq!(events.len(), 1);
        let CallbackEvent::Error(error) = &events[0] else {
            panic!("expected an error, got {events:?}");
        };
        assert_eq!(error.kind, StreamErrorKind::Inactive);
        assert!(error.message.contains("no activity"));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(120));
        assert!(elapsed < Duration::from_secs(125));

        assert_silent_afterwards(&mut rx).await;
        assert_eq!(source.open_count(), 1);
        assert!(client.store().get(&turn_id).unwrap().is_failed());
        assert!(!client.is_streaming());
        assert_eq!(client.retry_count(), 0);
        assert_eq!(mode.current(), Mode::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pings_keep_streaming_mode_alive() {
        let quiet = Duration::from_secs(20);
        let frames = vec![
            (Duration::ZERO, Frame::Open),
            (Duration::ZERO, delta("Hel", 0)),
            (quiet, Frame::Ping),
            (quiet, Frame::Ping),
            (quiet, Frame::Meta(json!({"model": "m"}))),
            (quiet, delta("lo", 1)),
            (Duration::ZERO, done()),
        ];
        let (client, _source, mode) = spawn(config(), vec![Script::Paced(frames)]);
        let (callbacks, mut rx) = ChannelCallbacks::new();

        let turn_id = client.start_stream("hi", callbacks, StreamOptions::default()).await.unwrap();
        let events = until_terminal(&mut rx).await;
        assert!(matches!(events.last(), Some(CallbackEvent::Complete(_))));

        assert_eq!(client.store().get(&turn_id).unwrap().text, "Hello");
        let visited: Vec<Mode> = mode.get_state().history.iter().map(|t| t.to).collect();
        assert_eq!(visited, vec![Mode::Thinking, Mode::Streaming, Mode::Idle]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_keeps_buffer_and_is_idempotent() {
        let frames = vec![Frame::Open, delta("Hel", 0)];
        let (client, source, mode) = spawn(config(), vec![Script::Hang(frames)]);
        let (callbacks, mut rx) = ChannelCallbacks::new();

        let turn_id = client
            .start_stream("hi", callbacks, StreamOptions::default())
            .await
            .unwrap();
        while let Some(event) = rx.recv().await {
            if matches!(event, CallbackEvent::FirstFragment { .. }) {
                break;
            }
        }

        client.stop_stream().await;
        client.stop_stream().await;

        assert_eq!(rx.recv().await, Some(CallbackEvent::Cancelled));
        assert_silent_afterwards(&mut rx).await;

        let turn = client.store().get(&turn_id).cloned().unwrap();
        assert_eq!(turn.text, "Hel");
        assert!(!turn.is_streaming);
        assert_eq!(client.store().streaming_id(), None);
        assert!(!client.is_streaming());
        assert_eq!(mode.current(), Mode::Idle);
        assert_eq!(source.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_retry_is_dropped_after_stop() {
        let scripts = vec![
            Script::Fail(StreamError::timeout("slow")),
            Script::Frames(vec![delta("never", 0), done()]),
        ];
        let (client, source, _mode) = spawn(config(), scripts);
        let (callbacks, mut rx) = ChannelCallbacks::new();

        client.start_stream("hi", callbacks, StreamOptions::default()).await.unwrap();
        assert!(matches!(rx.recv().await, Some(CallbackEvent::Retry { attempt: 1, .. })));
        assert!(client.is_retrying());
        assert_eq!(client.retry_count(), 1);

        client.stop_stream().await;
        assert_eq!(rx.recv().await, Some(CallbackEvent::Cancelled));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(source.open_count(), 1, "cancelled retry never reconnects");
        assert!(!client.is_retrying());
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_turn_supersedes_running_stream() {
        let scripts = vec![
            Script::Hang(vec![Frame::Delta(DeltaFrame::new("partial").for_turn("t1"))]),
            Script::Hang(vec![]),
        ];
        let (client, source, _mode) = spawn(config(), scripts);
        let (first, mut first_rx) = ChannelCallbacks::new();
        let (second, mut second_rx) = ChannelCallbacks::new();

        client.start_stream("one", first, StreamOptions::for_turn("t1")).await.unwrap();
        assert!(matches!(first_rx.recv().await, Some(CallbackEvent::FirstFragment { .. })));

        client.start_stream("two", second, StreamOptions::for_turn("t2")).await.unwrap();
        assert_eq!(first_rx.recv().await, Some(CallbackEvent::Cancelled));
        tokio::time::sleep(Duration::from_millis(1)).await;

        let store = client.store();
        assert_eq!(store.get("t1").unwrap().text, "partial");
        assert!(store.get("t1").unwrap().is_final());
        assert_eq!(store.streaming_id(), Some("t2"));
        assert_eq!(store.streaming_count(), 1);
        assert_eq!(source.open_count(), 2);

        client.stop_stream().await;
        assert_eq!(second_rx.recv().await, Some(CallbackEvent::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_turn_is_not_started_twice() {
        let (client, source, _mode) = spawn(config(), vec![Script::Hang(vec![])]);

        client.start_stream("hi", (), StreamOptions::for_turn("m1")).await.unwrap();
        let err = client
            .start_stream("hi", (), StreamOptions::for_turn("m1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, StreamErrorKind::InvalidRequest);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(source.open_count(), 1);
        client.stop_stream().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_uid_is_fatal_before_connecting() {
        let (client, source, mode) = spawn(StreamConfig::default(), vec![]);
        let (callbacks, mut rx) = ChannelCallbacks::new();

        let err = client
            .start_stream("hi", callbacks, StreamOptions::for_turn("m1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, StreamErrorKind::Auth);
        assert!(matches!(
            rx.recv().await,
            Some(CallbackEvent::Error(e)) if e.kind == StreamErrorKind::Auth
        ));

        assert_eq!(source.open_count(), 0);
        assert!(client.store().get("m1").unwrap().is_failed());
        assert_eq!(mode.current(), Mode::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_frame_is_not_retried() {
        let frames = vec![Frame::Error(Some(json!({
            "code": "unauthenticated",
            "message": "log in again"
        })))];
        let (client, source, _mode) = spawn(config(), vec![Script::Frames(frames)]);
        let (callbacks, mut rx) = ChannelCallbacks::new();

        client.start_stream("hi", callbacks, StreamOptions::default()).await.unwrap();
        let events = until_terminal(&mut rx).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], CallbackEvent::Error(e) if e.kind == StreamErrorKind::Auth));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(source.open_count(), 1);
        assert!(!client.is_streaming());
    }

    #[tokio::test(start_paused = true)]
    async fn test_meta_evidence_is_attached_at_completion() {
        let frames = vec![
            Frame::Meta(json!({"evidence": [{"source": "ledger", "id": 7}]})),
            Frame::Limit(json!({"remaining": 2})),
            delta("x", 0),
            done(),
        ];
        let (client, _source, _mode) = spawn(config(), vec![Script::Frames(frames)]);
        let (callbacks, mut rx) = ChannelCallbacks::new();

        client.start_stream("hi", callbacks, StreamOptions::default()).await.unwrap();
        let events = until_terminal(&mut rx).await;

        assert!(events.contains(&CallbackEvent::Limit(json!({"remaining": 2}))));
        let Some(CallbackEvent::Complete(turn)) = events.last() else {
            panic!("expected completion, got {events:?}");
        };
        assert_eq!(turn.evidence, Some(json!([{"source": "ledger", "id": 7}])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_stream_is_reported_degraded() {
        let (client, _source, _mode) = spawn(config(), vec![Script::Hang(vec![Frame::Open])]);
        let mut status = client.subscribe_status();

        client.start_stream("hi", (), StreamOptions::default()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(client.is_streaming());
        assert!(!client.is_connecting());
        assert_eq!(client.connection_health(), ConnectionHealth::Healthy);

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(client.connection_health(), ConnectionHealth::Degraded);
        assert!(status.has_changed().unwrap());
        assert_eq!(status.borrow_and_update().connection_health, ConnectionHealth::Degraded);

        client.stop_stream().await;
        assert_eq!(client.connection_health(), ConnectionHealth::Healthy);
    }

    #[tokio::test]
    async fn test_store_edits_through_the_handle() {
        let (client, _source, _mode) = spawn(config(), vec![]);
        let mut messages = client.subscribe_messages();
        messages.changed().await.unwrap();
        assert!(messages.borrow_and_update().is_empty());

        assert_eq!(client.add_user_message("u1", "hello").await.unwrap(), Outcome::Normal);
        assert_eq!(client.add_user_message("u1", "again").await.unwrap(), Outcome::NoOp);
        assert_eq!(client.add_ai_placeholder("a1").await.unwrap(), Outcome::Normal);
        assert_eq!(client.clear_streaming().await.unwrap(), Outcome::Normal);
        assert_eq!(
            client.finalize_message("a1", Some("done".to_string())).await.unwrap(),
            Outcome::Normal
        );
        assert_eq!(client.set_error("a1", "too late").await.unwrap(), Outcome::NoOp);
        assert_eq!(client.set_error("a2", "lost").await.unwrap(), Outcome::Recovered);

        messages.changed().await.unwrap();
        let ids: Vec<String> = client.messages().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["u1", "a1", "a2"]);
        assert_eq!(client.store().get("a1").unwrap().text, "done");
        assert_eq!(client.store().get("a2").unwrap().text, FAILED_TURN_TEXT);
    }
}
