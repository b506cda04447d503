use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use super::*;
use crate::config::MatchPolicy;
use crate::events::AbortReason;
use crate::modules::{Journal, ModuleStage, RecordingModule};
use crate::transport::mock::{MockTransport, OpenBehavior, Sent};

struct Fixture {
    orch: Arc<Orchestrator>,
    transport: Arc<MockTransport>,
    playback: Arc<PlaybackQueue>,
    journal: Journal,
}

impl Fixture {
    fn entries(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }

    fn recorded(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }

    /// Wait for every spawned unit to finish
    async fn settle(&self) {
        tokio::time::timeout(Duration::from_secs(60), self.orch.tasks().wait_idle())
            .await
            .expect("units still running");
    }

    async fn json(&self, value: serde_json::Value) {
        self.orch
            .dispatch_event(TransportEvent::IncomingJson(value))
            .await;
    }

    /// Put the session into `state` with the channel open
    async fn enter(&self, state: DeviceState) {
        self.transport.force_open();
        self.orch.update_session(|s| s.channel_open = true).await;
        self.orch.set_device_state(state).await;
        self.journal.lock().unwrap().clear();
    }
}

fn wake_config(enabled: bool) -> WakeWordConfig {
    WakeWordConfig {
        enabled,
        phrases: vec!["hey murmur".to_string()],
        policy: MatchPolicy::Token,
        ..WakeWordConfig::default()
    }
}

fn build(wake_word: WakeWordConfig, extra: Vec<Arc<dyn CapabilityModule>>) -> Fixture {
    let journal: Journal = Arc::new(StdMutex::new(Vec::new()));
    let transport = Arc::new(MockTransport::new());
    let playback = Arc::new(PlaybackQueue::new(32));

    let mut modules: Vec<Arc<dyn CapabilityModule>> = vec![Arc::new(RecordingModule::new(
        "rec",
        ModuleStage::Presentation,
        &journal,
    ))];
    modules.extend(extra);

    let orch = Orchestrator::new(
        SessionConfig::default(),
        &wake_word,
        transport.clone(),
        modules,
        Arc::clone(&playback),
    );
    Fixture {
        orch,
        transport,
        playback,
        journal,
    }
}

/// Fixture with modules set up but no run loop
async fn fixture_with(wake_word: WakeWordConfig) -> Fixture {
    let fx = build(wake_word, Vec::new());
    fx.orch.modules.setup_all(&fx.orch.handle).await;
    fx
}

async fn fixture() -> Fixture {
    fixture_with(wake_config(false)).await
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(60), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

// Channel lifecycle

#[tokio::test(start_paused = true)]
async fn test_concurrent_connects_share_one_attempt() {
    let fx = fixture().await;
    fx.transport.set_open_delay(Duration::from_millis(200));

    let (a, b, c) = tokio::join!(fx.orch.connect(), fx.orch.connect(), fx.orch.connect());
    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(fx.transport.open_attempts(), 1);
    assert_eq!(fx.transport.max_in_flight(), 1);
    assert!(fx.orch.session().channel_open);
    assert_eq!(fx.recorded("rec:state=Idle"), 0);

    // Already open
    fx.orch.connect().await.unwrap();
    assert_eq!(fx.transport.open_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_connect_failure_is_shared() {
    let fx = fixture().await;
    fx.transport.set_open_delay(Duration::from_millis(200));
    fx.transport.set_behavior(OpenBehavior::Fail);

    let (a, b) = tokio::join!(fx.orch.connect(), fx.orch.connect());
    assert!(matches!(a, Err(ConnectError::Transport(_))));
    assert!(matches!(b, Err(ConnectError::Transport(_))));
    assert_eq!(fx.transport.open_attempts(), 1);

    // A later caller is not concurrent and tries again
    fx.transport.set_behavior(OpenBehavior::Succeed);
    fx.orch.connect().await.unwrap();
    assert_eq!(fx.transport.open_attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_leaves_state_unchanged() {
    let fx = fixture().await;
    fx.transport.set_behavior(OpenBehavior::Hang);
    let before = fx.orch.session();

    let err = fx.orch.connect().await.unwrap_err();
    assert!(matches!(err, ConnectError::Timeout(d) if d == Duration::from_secs(12)));
    assert_eq!(fx.orch.session(), before);
    assert_eq!(fx.transport.max_in_flight(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_refused_channel_keeps_idle() {
    let fx = fixture().await;
    fx.transport.set_behavior(OpenBehavior::Refuse);

    let err = fx.orch.start_auto_conversation().await.unwrap_err();
    assert!(matches!(err, SessionError::Connect(ConnectError::Refused)));
    assert_eq!(fx.orch.device_state(), DeviceState::Idle);
    assert!(!fx.orch.session().keep_listening);
    assert!(fx.transport.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_channel_closed_reconnects_once() {
    let fx = fixture().await;
    fx.enter(DeviceState::Speaking).await;
    fx.orch.running.store(true, Ordering::SeqCst);

    fx.transport.drop_channel();
    fx.orch
        .dispatch_event(TransportEvent::AudioChannelClosed)
        .await;
    assert!(!fx.orch.session().channel_open);
    fx.settle().await;

    assert_eq!(fx.orch.device_state(), DeviceState::Idle);
    assert_eq!(fx.transport.open_attempts(), 1);
    assert!(fx.orch.session().channel_open);
}

#[tokio::test(start_paused = true)]
async fn test_failed_reconnect_degrades_to_idle() {
    let fx = fixture().await;
    fx.enter(DeviceState::Listening).await;
    fx.orch.running.store(true, Ordering::SeqCst);
    fx.transport.set_behavior(OpenBehavior::Fail);

    fx.transport.drop_channel();
    fx.orch
        .dispatch_event(TransportEvent::AudioChannelClosed)
        .await;
    fx.settle().await;

    assert_eq!(fx.orch.device_state(), DeviceState::Idle);
    assert_eq!(fx.transport.open_attempts(), 1);
    assert!(!fx.orch.is_audio_channel_opened());
}

#[tokio::test(start_paused = true)]
async fn test_no_reconnect_when_channel_was_not_open() {
    let fx = fixture().await;
    fx.orch.running.store(true, Ordering::SeqCst);

    fx.orch
        .dispatch_event(TransportEvent::AudioChannelClosed)
        .await;
    fx.settle().await;
    assert_eq!(fx.transport.open_attempts(), 0);
}

// Transitions

#[tokio::test(start_paused = true)]
async fn test_duplicate_transition_is_skipped() {
    let fx = fixture().await;

    let (a, b) = tokio::join!(
        fx.orch.set_device_state(DeviceState::Speaking),
        fx.orch.set_device_state(DeviceState::Speaking)
    );
    assert!(a ^ b);
    assert_eq!(fx.recorded("rec:state=Speaking"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_double_abort_sends_one_frame() {
    let fx = fixture().await;
    fx.enter(DeviceState::Speaking).await;
    fx.transport.set_send_delay(Duration::from_millis(50));

    tokio::join!(
        fx.orch.abort_speaking(AbortReason::None),
        fx.orch.abort_speaking(AbortReason::None)
    );

    assert_eq!(fx.transport.sent(), vec![Sent::Abort(AbortReason::None)]);
    assert_eq!(fx.recorded("rec:state=Idle"), 1);
    assert_eq!(fx.orch.device_state(), DeviceState::Idle);
    // Settled, so the next abort goes through again
    assert!(!fx.orch.session().aborted);
}

#[tokio::test(start_paused = true)]
async fn test_listen_settle_keeps_abort_in_progress() {
    let fx = fixture().await;
    fx.transport.force_open();
    fx.orch.update_session(|s| s.channel_open = true).await;
    fx.transport.set_send_delay(Duration::from_millis(200));

    // Both aborts land inside the 500ms settle that follows Listening
    tokio::join!(
        fx.orch.set_device_state(DeviceState::Listening),
        async {
            tokio::time::sleep(Duration::from_millis(400)).await;
            fx.orch.abort_speaking(AbortReason::None).await;
        },
        async {
            tokio::time::sleep(Duration::from_millis(550)).await;
            fx.orch.abort_speaking(AbortReason::None).await;
        }
    );

    assert_eq!(fx.transport.sent(), vec![Sent::Abort(AbortReason::None)]);
    assert_eq!(fx.orch.device_state(), DeviceState::Idle);
    assert!(!fx.orch.session().aborted);
}

#[tokio::test(start_paused = true)]
async fn test_abort_without_channel_sends_nothing() {
    let fx = fixture().await;
    fx.orch.set_device_state(DeviceState::Speaking).await;

    fx.orch.abort_speaking(AbortReason::UserInterruption).await;
    assert!(fx.transport.sent().is_empty());
    assert_eq!(fx.orch.device_state(), DeviceState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_manual_listen_interrupts_speech() {
    let fx = fixture().await;
    fx.enter(DeviceState::Speaking).await;
    fx.orch.update_session(|s| s.keep_listening = true).await;

    fx.orch.start_listening_manual().await.unwrap();
    assert_eq!(
        fx.transport.sent(),
        vec![
            Sent::Abort(AbortReason::None),
            Sent::StartListening(ListeningMode::Manual),
        ]
    );
    assert_eq!(fx.orch.device_state(), DeviceState::Listening);
    assert!(!fx.orch.session().keep_listening);

    fx.orch.stop_listening_manual().await.unwrap();
    assert_eq!(fx.transport.sent().last(), Some(&Sent::StopListening));
    assert_eq!(fx.orch.device_state(), DeviceState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_auto_conversation_mode_follows_aec() {
    let fx = fixture().await;
    fx.orch.start_auto_conversation().await.unwrap();
    assert_eq!(
        fx.transport.sent(),
        vec![Sent::StartListening(ListeningMode::Realtime)]
    );

    let session = fx.orch.session();
    assert_eq!(session.state, DeviceState::Listening);
    assert!(session.keep_listening);
    assert!(session.should_capture_audio());
}

// Server events

#[tokio::test(start_paused = true)]
async fn test_tts_start_enters_speaking() {
    let fx = fixture().await;
    fx.enter(DeviceState::Listening).await;

    fx.json(json!({"type": "tts", "state": "start"})).await;
    fx.settle().await;
    assert_eq!(fx.orch.device_state(), DeviceState::Speaking);
    assert_eq!(fx.recorded("rec:json=tts"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_realtime_tts_stays_listening_without_duplicate_start() {
    let fx = fixture().await;
    fx.enter(DeviceState::Listening).await;
    fx.orch
        .update_session(|s| {
            s.keep_listening = true;
            s.mode = ListeningMode::Realtime;
        })
        .await;

    fx.json(json!({"type": "tts", "state": "start"})).await;
    fx.settle().await;
    assert_eq!(fx.orch.device_state(), DeviceState::Listening);

    fx.json(json!({"type": "tts", "state": "stop"})).await;
    fx.settle().await;
    assert_eq!(fx.orch.device_state(), DeviceState::Listening);
    assert!(fx.transport.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_tts_stop_without_keep_listening_goes_idle() {
    let fx = fixture().await;
    fx.enter(DeviceState::Speaking).await;

    fx.json(json!({"type": "tts", "state": "stop"})).await;
    fx.settle().await;
    assert_eq!(fx.orch.device_state(), DeviceState::Idle);
    assert!(fx.transport.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_tts_stop_resumes_after_playback_drains() {
    let fx = fixture().await;
    fx.enter(DeviceState::Speaking).await;
    fx.orch
        .update_session(|s| {
            s.keep_listening = true;
            s.mode = ListeningMode::AutoStop;
        })
        .await;
    fx.playback.enqueue(vec![0; 64]);

    fx.json(json!({"type": "tts", "state": "stop"})).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    // Still waiting on the queued frame
    assert_eq!(fx.orch.device_state(), DeviceState::Speaking);

    let frame = fx.playback.next_frame().await;
    assert_eq!(frame.len(), 64);
    fx.playback.finish_frame();
    fx.settle().await;

    assert_eq!(fx.orch.device_state(), DeviceState::Listening);
    assert_eq!(
        fx.transport.sent(),
        vec![Sent::StartListening(ListeningMode::AutoStop)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_goodbye_always_returns_to_idle_unforwarded() {
    for state in [
        DeviceState::Idle,
        DeviceState::Listening,
        DeviceState::Speaking,
    ] {
        let fx = fixture().await;
        fx.enter(state).await;
        fx.orch.update_session(|s| s.keep_listening = true).await;

        fx.json(json!({"type": "goodbye", "session_id": "abc"})).await;
        fx.settle().await;

        let session = fx.orch.session();
        assert_eq!(session.state, DeviceState::Idle, "from {state}");
        assert!(!session.keep_listening);
        assert!(fx.orch.is_audio_channel_opened());
        assert_eq!(fx.recorded("rec:json=goodbye"), 0);
        assert!(fx.transport.sent().is_empty());
    }
}

#[tokio::test(start_paused = true)]
async fn test_unknown_messages_are_forwarded() {
    let fx = fixture().await;
    fx.json(json!({"type": "llm", "emotion": "happy"})).await;
    fx.json(json!({"type": "iot", "commands": []})).await;
    fx.settle().await;

    assert_eq!(fx.recorded("rec:json=llm"), 1);
    assert_eq!(fx.recorded("rec:json=iot"), 1);
    assert_eq!(fx.orch.device_state(), DeviceState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_network_error_ends_keep_listening() {
    let fx = fixture().await;
    fx.orch.update_session(|s| s.keep_listening = true).await;

    fx.orch
        .dispatch_event(TransportEvent::NetworkError("reset by peer".into()))
        .await;
    assert!(!fx.orch.session().keep_listening);
}

// Wake phrases

#[tokio::test(start_paused = true)]
async fn test_wake_from_idle_connects_greets_and_listens() {
    let fx = fixture().await;

    fx.orch.handle_wake_word("hey murmur", "hey murmur").await;

    assert_eq!(fx.transport.open_attempts(), 1);
    assert_eq!(
        fx.transport.sent(),
        vec![
            Sent::WakeWordDetected("Hello".to_string()),
            Sent::StartListening(ListeningMode::Realtime),
        ]
    );
    let session = fx.orch.session();
    assert_eq!(session.state, DeviceState::Listening);
    assert!(session.keep_listening);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_wakes_start_one_conversation() {
    let fx = fixture().await;
    fx.transport.set_send_delay(Duration::from_millis(50));

    tokio::join!(
        fx.orch.handle_wake_word("hey murmur", "hey murmur"),
        fx.orch.handle_wake_word("hey murmur", "hey murmur")
    );

    assert_eq!(
        fx.transport.sent(),
        vec![
            Sent::WakeWordDetected("Hello".to_string()),
            Sent::StartListening(ListeningMode::Realtime),
        ]
    );
    assert_eq!(fx.recorded("rec:state=Listening"), 1);
    assert_eq!(fx.orch.device_state(), DeviceState::Listening);
}

#[tokio::test(start_paused = true)]
async fn test_wake_while_speaking_interrupts() {
    let fx = fixture().await;
    fx.enter(DeviceState::Speaking).await;
    fx.playback.enqueue(vec![1; 10]);
    fx.playback.enqueue(vec![2; 10]);

    fx.orch.handle_wake_word("hey murmur", "hey murmur").await;

    assert_eq!(
        fx.transport.sent(),
        vec![
            Sent::Abort(AbortReason::WakeWordDetected),
            Sent::StartListening(ListeningMode::Realtime),
        ]
    );
    assert!(fx.playback.is_drained());
    assert_eq!(
        fx.entries(),
        vec!["rec:state=Idle", "rec:state=Listening"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_wake_while_listening_is_ignored() {
    let fx = fixture().await;
    fx.enter(DeviceState::Listening).await;

    fx.orch.handle_wake_word("hey murmur", "hey murmur").await;
    assert!(fx.transport.sent().is_empty());
    assert!(fx.entries().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_wake_connect_stays_idle() {
    let fx = fixture().await;
    fx.transport.set_behavior(OpenBehavior::Refuse);

    fx.orch.handle_wake_word("hey murmur", "hey murmur").await;
    assert_eq!(fx.orch.device_state(), DeviceState::Idle);
    assert!(fx.transport.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_transcript_wake_phrase_starts_conversation() {
    let fx = fixture_with(wake_config(true)).await;
    fx.enter(DeviceState::Idle).await;

    fx.json(json!({"type": "stt", "text": "Hey, Murmur! what's the weather"}))
        .await;
    fx.settle().await;

    assert_eq!(fx.orch.device_state(), DeviceState::Listening);
    assert_eq!(
        fx.transport.sent(),
        vec![
            Sent::WakeWordDetected("Hello".to_string()),
            Sent::StartListening(ListeningMode::Realtime),
        ]
    );
    // Transcripts still reach the modules
    assert_eq!(fx.recorded("rec:json=stt"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transcript_outside_idle_is_not_a_wake() {
    let fx = fixture_with(wake_config(true)).await;
    fx.enter(DeviceState::Speaking).await;

    fx.json(json!({"type": "stt", "text": "hey murmur"})).await;
    fx.settle().await;
    assert_eq!(fx.orch.device_state(), DeviceState::Speaking);
    assert!(fx.transport.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_transcript_ignored_when_wake_disabled() {
    let fx = fixture().await;
    fx.enter(DeviceState::Idle).await;

    fx.json(json!({"type": "stt", "text": "hey murmur"})).await;
    fx.settle().await;
    assert_eq!(fx.orch.device_state(), DeviceState::Idle);
}

// Run loop and shutdown

/// Starts a unit that only ends when cancelled
struct StuckModule;

#[async_trait]
impl CapabilityModule for StuckModule {
    fn name(&self) -> &'static str {
        "stuck"
    }

    fn stage(&self) -> ModuleStage {
        ModuleStage::Detection
    }

    async fn setup(&self, session: SessionHandle) -> Result<()> {
        session.tasks().spawn("stuck:forever", async {
            std::future::pending::<()>().await;
            Ok(())
        });
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_run_serves_commands_until_shutdown() {
    let fx = build(wake_config(false), vec![Arc::new(StuckModule)]);
    let runner = {
        let orch = Arc::clone(&fx.orch);
        tokio::spawn(async move { orch.run().await })
    };

    eventually(|| fx.orch.is_audio_channel_opened()).await;
    let handle = fx.orch.handle.clone();

    handle.send(Command::StartConversation).await.unwrap();
    eventually(|| handle.device_state() == DeviceState::Listening).await;

    // Capture flows upstream while listening
    assert!(handle.capture().push_frame(&[0; 4], vec![7; 12]));
    eventually(|| fx.transport.sent().contains(&Sent::Audio(12))).await;

    // Transport events take the same path as in production
    fx.transport
        .sink()
        .incoming_json(json!({"type": "tts", "state": "start"}));
    eventually(|| handle.device_state() == DeviceState::Listening).await;

    handle.send(Command::Shutdown).await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(30), runner)
        .await
        .expect("run did not return")
        .unwrap();
    assert!(result.is_ok());

    assert!(fx.orch.tasks().is_empty());
    assert!(!fx.transport.is_audio_channel_opened());
    assert_eq!(fx.recorded("rec:stop"), 1);
    assert_eq!(fx.recorded("rec:shutdown"), 1);
    assert!(matches!(
        handle.send(Command::StartListening).await,
        Err(SessionError::Closed)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_run_twice_is_rejected() {
    let fx = build(wake_config(false), Vec::new());
    fx.orch.request_shutdown();
    fx.orch.run().await.unwrap();
    assert!(matches!(
        fx.orch.run().await,
        Err(SessionError::AlreadyRunning)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_run_fails_when_no_module_sets_up() {
    let journal: Journal = Arc::new(StdMutex::new(Vec::new()));
    let mut broken = RecordingModule::new("broken", ModuleStage::Audio, &journal);
    broken.fail_on = Some("setup");
    let transport = Arc::new(MockTransport::new());
    let orch = Orchestrator::new(
        SessionConfig::default(),
        &wake_config(false),
        transport.clone(),
        vec![Arc::new(broken)],
        Arc::new(PlaybackQueue::new(4)),
    );

    let err = orch.run().await.unwrap_err();
    assert!(matches!(err, SessionError::Startup(_)));
    assert_eq!(transport.open_attempts(), 0);
    assert!(journal
        .lock()
        .unwrap()
        .contains(&"broken:shutdown".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_initial_connect_failure_is_not_fatal() {
    let fx = build(wake_config(false), Vec::new());
    fx.transport.set_behavior(OpenBehavior::Fail);
    let runner = {
        let orch = Arc::clone(&fx.orch);
        tokio::spawn(async move { orch.run().await })
    };

    eventually(|| fx.recorded("rec:start") == 1).await;
    assert_eq!(fx.orch.device_state(), DeviceState::Idle);

    fx.orch.request_shutdown();
    assert!(runner.await.unwrap().is_ok());
}
