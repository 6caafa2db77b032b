use crate::config::Config;
use crate::events::{EventSink, PanelEvent};
use crate::llm::{Completer, CompletionRequest};
use crate::memory::ConversationMemory;
use crate::model::Turn;
use crate::prompt::PromptSource;
use crate::transport::{ConnectionCell, InboundEnvelope, InboundText, Presence};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub debounce: Duration,
    pub min_reply_delay: Duration,
    pub completion_timeout: Duration,
    pub model: String,
    pub temperature: f32,
    pub greeting: String,
    pub fallback_reply: String,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        let responder = &config.responder;
        let min_reply_delay_ms = rand::thread_rng()
            .gen_range(responder.min_reply_delay_ms..=responder.max_reply_delay_ms);
        Self {
            debounce: responder.debounce(),
            min_reply_delay: Duration::from_millis(min_reply_delay_ms),
            completion_timeout: Duration::from_millis(config.llm.timeout_ms),
            model: config.llm.model.clone(),
            temperature: config.llm.temperature,
            greeting: responder.greeting.clone(),
            fallback_reply: responder.fallback_reply.clone(),
        }
    }
}

#[derive(Default)]
struct DebounceSlot {
    generation: u64,
    timer: Option<JoinHandle<()>>,
    cycle_lock: Arc<tokio::sync::Mutex<()>>,
}

struct Inner {
    settings: PipelineSettings,
    memory: Arc<ConversationMemory>,
    completer: Arc<dyn Completer>,
    prompts: Arc<dyn PromptSource>,
    events: EventSink,
    connection: ConnectionCell,
    slots: Mutex<HashMap<String, DebounceSlot>>,
}

#[derive(Clone)]
pub struct ResponsePipeline {
    inner: Arc<Inner>,
}

impl ResponsePipeline {
    pub fn new(
        settings: PipelineSettings,
        memory: Arc<ConversationMemory>,
        completer: Arc<dyn Completer>,
        prompts: Arc<dyn PromptSource>,
        events: EventSink,
        connection: ConnectionCell,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                memory,
                completer,
                prompts,
                events,
                connection,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn handle_envelopes(&self, envelopes: &[InboundEnvelope]) {
        for envelope in envelopes {
            if let Some(message) = envelope.text_message() {
                self.accept(message);
            }
        }
    }

    pub fn accept(&self, message: InboundText) {
        let InboundText { from, text } = message;
        tracing::info!(from = %from, text = %text, "inbound message");

        self.inner.memory.append(&from, Turn::user(&text));
        self.inner.events.emit(PanelEvent::Incoming {
            from: from.clone(),
            message: text,
        });

        let mut slots = self.inner.lock_slots();
        let slot = slots.entry(from.clone()).or_default();
        slot.generation += 1;
        if let Some(timer) = slot.timer.take() {
            timer.abort();
        }

        let inner = self.inner.clone();
        let generation = slot.generation;
        let cycle_lock = slot.cycle_lock.clone();
        slot.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.settings.debounce).await;
            if !inner.fire(&from, generation) {
                return;
            }
            let _cycle = cycle_lock.lock().await;
            inner.respond(&from).await;
        }));
    }

    #[cfg(test)]
    pub fn has_pending_timer(&self, identity: &str) -> bool {
        self.inner
            .lock_slots()
            .get(identity)
            .is_some_and(|slot| slot.timer.is_some())
    }
}

impl Inner {
    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, DebounceSlot>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claims the slot for a timer that survived its quiet period. Once
    /// claimed, later messages can no longer abort the cycle.
    fn fire(&self, identity: &str, generation: u64) -> bool {
        let mut slots = self.lock_slots();
        match slots.get_mut(identity) {
            Some(slot) if slot.generation == generation => {
                slot.timer = None;
                true
            }
            _ => false,
        }
    }

    async fn respond(&self, identity: &str) {
        let messages = self.build_input(identity);
        let started = Instant::now();

        self.presence(identity, Presence::Composing).await;
        let reply = self.complete(messages).await;

        let elapsed = started.elapsed();
        if elapsed < self.settings.min_reply_delay {
            tokio::time::sleep(self.settings.min_reply_delay - elapsed).await;
        }
        self.presence(identity, Presence::Paused).await;

        self.memory.append(identity, Turn::assistant(&reply));

        let Some(connection) = self.connection.current() else {
            tracing::warn!(to = %identity, "no live connection, reply not sent");
            return;
        };
        match connection.send_message(identity, &reply).await {
            Ok(()) => {
                tracing::info!(to = %identity, reply = %reply, "reply sent");
                self.events.emit(PanelEvent::Outgoing {
                    to: identity.to_string(),
                    message: reply,
                });
            }
            Err(err) => {
                tracing::warn!(to = %identity, error = %err, "reply send failed");
            }
        }
    }

    fn build_input(&self, identity: &str) -> Vec<Turn> {
        let transcript = self.memory.get(identity);
        let first_contact = self.memory.user_turns_seen(identity) == 1;

        let mut messages = Vec::with_capacity(transcript.len() + 2);
        messages.push(Turn::system(self.prompts.load()));
        if first_contact && !self.settings.greeting.trim().is_empty() {
            messages.push(Turn::assistant(&self.settings.greeting));
        }
        messages.extend(transcript);
        messages
    }

    async fn complete(&self, messages: Vec<Turn>) -> String {
        let request = CompletionRequest {
            model: self.settings.model.clone(),
            messages,
            temperature: self.settings.temperature,
        };

        let outcome = tokio::time::timeout(
            self.settings.completion_timeout,
            self.completer.complete(&request),
        )
        .await;

        match outcome {
            Ok(Ok(reply)) if !reply.trim().is_empty() => reply.trim().to_string(),
            Ok(Ok(_)) => {
                tracing::warn!("completion returned empty text, using fallback reply");
                self.settings.fallback_reply.clone()
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "completion failed, using fallback reply");
                self.settings.fallback_reply.clone()
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.settings.completion_timeout.as_millis() as u64,
                    "completion timed out, using fallback reply"
                );
                self.settings.fallback_reply.clone()
            }
        }
    }

    async fn presence(&self, identity: &str, presence: Presence) {
        let Some(connection) = self.connection.current() else {
            return;
        };
        if let Err(err) = connection.send_presence(identity, presence).await {
            tracing::debug!(to = %identity, ?presence, error = %err, "presence update failed");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::llm::LlmError;
    use crate::model::Role;
    use crate::transport::{Connection, TransportError};
    use async_trait::async_trait;

    const X: &str = "15550001111@s.whatsapp.net";
    const Y: &str = "15550002222@s.whatsapp.net";

    #[derive(Default)]
    pub(crate) struct RecordingConnection {
        pub sent: Mutex<Vec<(String, String)>>,
        pub presence: Mutex<Vec<(String, Presence)>>,
        pub fail_presence: bool,
        pub logouts: Mutex<u32>,
        pub ended: Mutex<bool>,
    }

    #[async_trait]
    impl Connection for RecordingConnection {
        async fn send_message(&self, to: &str, text: &str) -> Result<(), TransportError> {
            self.sent
                .lock()
                .unwrap()
                .push((to.to_string(), text.to_string()));
            Ok(())
        }

        async fn send_presence(&self, to: &str, presence: Presence) -> Result<(), TransportError> {
            if self.fail_presence {
                return Err(TransportError::Closed);
            }
            self.presence.lock().unwrap().push((to.to_string(), presence));
            Ok(())
        }

        async fn logout(&self) -> Result<(), TransportError> {
            *self.logouts.lock().unwrap() += 1;
            Ok(())
        }

        fn end(&self) {
            *self.ended.lock().unwrap() = true;
        }
    }

    enum Behavior {
        Reply(&'static str),
        Fail,
        Hang,
    }

    struct ScriptedCompleter {
        behavior: Behavior,
        calls: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedCompleter {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<CompletionRequest> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Completer for ScriptedCompleter {
        async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
            self.calls.lock().unwrap().push(request.clone());
            match self.behavior {
                Behavior::Reply(text) => Ok(text.to_string()),
                Behavior::Fail => Err(LlmError::Empty),
                Behavior::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }

    struct StaticPrompt;

    impl PromptSource for StaticPrompt {
        fn load(&self) -> String {
            "system prompt".to_string()
        }
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            debounce: Duration::from_secs(9),
            min_reply_delay: Duration::from_secs(12),
            completion_timeout: Duration::from_secs(45),
            model: "test-model".to_string(),
            temperature: 0.2,
            greeting: "Hi there".to_string(),
            fallback_reply: "fallback".to_string(),
        }
    }

    struct Harness {
        pipeline: ResponsePipeline,
        memory: Arc<ConversationMemory>,
        completer: Arc<ScriptedCompleter>,
        connection: Arc<RecordingConnection>,
        events: tokio::sync::broadcast::Receiver<PanelEvent>,
    }

    fn harness(behavior: Behavior) -> Harness {
        harness_with(behavior, RecordingConnection::default())
    }

    fn harness_with(behavior: Behavior, connection: RecordingConnection) -> Harness {
        let memory = Arc::new(ConversationMemory::new());
        let completer = ScriptedCompleter::new(behavior);
        let connection = Arc::new(connection);
        let cell = ConnectionCell::new();
        cell.replace(connection.clone());
        let sink = EventSink::new();
        let events = sink.subscribe();
        let pipeline = ResponsePipeline::new(
            settings(),
            memory.clone(),
            completer.clone(),
            Arc::new(StaticPrompt),
            sink,
            cell,
        );
        Harness {
            pipeline,
            memory,
            completer,
            connection,
            events,
        }
    }

    fn text(from: &str, text: &str) -> InboundText {
        InboundText {
            from: from.to_string(),
            text: text.to_string(),
        }
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<PanelEvent>) -> Vec<PanelEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn first_message_gets_greeting_and_reply() {
        let mut h = harness(Behavior::Reply("Hola, ¿en qué te ayudo?"));
        h.pipeline.accept(text(X, "Hola"));

        tokio::time::sleep(Duration::from_secs(60)).await;

        let calls = h.completer.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].messages,
            vec![
                Turn::system("system prompt"),
                Turn::assistant("Hi there"),
                Turn::user("Hola"),
            ]
        );
        assert_eq!(calls[0].model, "test-model");
        assert_eq!(
            h.memory.get(X),
            vec![Turn::user("Hola"), Turn::assistant("Hola, ¿en qué te ayudo?")]
        );
        assert_eq!(
            *h.connection.sent.lock().unwrap(),
            vec![(X.to_string(), "Hola, ¿en qué te ayudo?".to_string())]
        );
        assert_eq!(
            drain(&mut h.events),
            vec![
                PanelEvent::Incoming {
                    from: X.to_string(),
                    message: "Hola".to_string()
                },
                PanelEvent::Outgoing {
                    to: X.to_string(),
                    message: "Hola, ¿en qué te ayudo?".to_string()
                },
            ]
        );
        assert!(!h.pipeline.has_pending_timer(X));
    }

    #[tokio::test(start_paused = true)]
    async fn burst_within_quiet_period_yields_one_cycle() {
        let h = harness(Behavior::Reply("ok"));
        h.pipeline.accept(text(X, "a"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.pipeline.accept(text(X, "b"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.pipeline.accept(text(X, "c"));

        tokio::time::sleep(Duration::from_secs(8)).await;
        assert!(h.completer.calls().is_empty(), "fired before the quiet period ended");

        tokio::time::sleep(Duration::from_secs(60)).await;
        let calls = h.completer.calls();
        assert_eq!(calls.len(), 1);
        let transcript: Vec<Turn> = calls[0]
            .messages
            .iter()
            .filter(|t| t.role != Role::System)
            .cloned()
            .collect();
        assert_eq!(transcript, vec![Turn::user("a"), Turn::user("b"), Turn::user("c")]);
        assert_eq!(h.connection.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_failure_sends_fallback() {
        let h = harness(Behavior::Fail);
        h.pipeline.accept(text(X, "hello?"));
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(
            *h.connection.sent.lock().unwrap(),
            vec![(X.to_string(), "fallback".to_string())]
        );
        assert_eq!(h.memory.get(X).last(), Some(&Turn::assistant("fallback")));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_completion_times_out_to_fallback() {
        let h = harness(Behavior::Hang);
        let started = Instant::now();
        h.pipeline.accept(text(X, "hello?"));
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(
            *h.connection.sent.lock().unwrap(),
            vec![(X.to_string(), "fallback".to_string())]
        );
        assert!(started.elapsed() >= Duration::from_secs(9 + 45));
    }

    #[tokio::test(start_paused = true)]
    async fn reply_waits_for_minimum_delay() {
        let h = harness(Behavior::Reply("ok"));
        h.pipeline.accept(text(X, "hi"));

        // debounce 9s + minimum reply delay 12s
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(h.connection.sent.lock().unwrap().is_empty());
        assert_eq!(h.completer.calls().len(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.connection.sent.lock().unwrap().len(), 1);
        assert_eq!(
            *h.connection.presence.lock().unwrap(),
            vec![
                (X.to_string(), Presence::Composing),
                (X.to_string(), Presence::Paused)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn presence_failures_do_not_block_reply() {
        let h = harness_with(
            Behavior::Reply("ok"),
            RecordingConnection {
                fail_presence: true,
                ..Default::default()
            },
        );
        h.pipeline.accept(text(X, "hi"));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.connection.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn message_during_cycle_runs_a_second_serialized_cycle() {
        let h = harness(Behavior::Reply("ok"));
        h.pipeline.accept(text(X, "first"));

        // cycle for "first" is in flight (waiting out the reply delay)
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.completer.calls().len(), 1);
        h.pipeline.accept(text(X, "second"));

        tokio::time::sleep(Duration::from_secs(60)).await;
        let calls = h.completer.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(h.connection.sent.lock().unwrap().len(), 2);

        // the second cycle sees the first reply and no greeting
        assert_eq!(
            calls[1].messages[1..].to_vec(),
            vec![Turn::user("first"), Turn::user("second"), Turn::assistant("ok")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn conversations_run_independently() {
        let h = harness(Behavior::Reply("ok"));
        h.pipeline.accept(text(X, "from x"));
        tokio::time::sleep(Duration::from_secs(5)).await;
        h.pipeline.accept(text(Y, "from y"));

        tokio::time::sleep(Duration::from_secs(60)).await;
        let sent = h.connection.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, X);
        assert_eq!(sent[1].0, Y);
        assert_eq!(h.memory.get(Y), vec![Turn::user("from y"), Turn::assistant("ok")]);
    }

    #[tokio::test(start_paused = true)]
    async fn envelopes_are_filtered_before_the_transcript() {
        let h = harness(Behavior::Reply("ok"));
        let envelopes: Vec<InboundEnvelope> = serde_json::from_value(serde_json::json!([
            { "key": { "remote_jid": X, "from_me": true }, "message": { "conversation": "echo" } },
            { "key": { "remote_jid": X }, "message": { "conversation": "  " } },
            { "key": { "remote_jid": X } },
            { "key": { "remote_jid": X }, "message": { "conversation": "real" } }
        ]))
        .unwrap();

        h.pipeline.handle_envelopes(&envelopes);
        assert_eq!(h.memory.get(X), vec![Turn::user("real")]);
        assert!(h.pipeline.has_pending_timer(X));
    }

    #[tokio::test(start_paused = true)]
    async fn no_live_connection_keeps_transcript_but_skips_outgoing_event() {
        let mut h = harness(Behavior::Reply("ok"));
        h.pipeline.inner.connection.take();
        h.pipeline.accept(text(X, "hi"));
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(h.memory.get(X).len(), 2);
        let events = drain(&mut h.events);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], PanelEvent::Incoming { .. }));
    }
}
