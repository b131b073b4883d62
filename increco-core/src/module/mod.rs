//! The module framework: lifecycle, worker loop, event bus, and I/O
//! validation shared by every concrete module.

pub mod events;
pub mod registry;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{Result, RuntimeError};
use crate::ids::ModuleId;
use crate::iu::{Iu, IuKind, IuPayload, IuRef};
use crate::meta::MetaValue;
use crate::queue::{make_queue, InputBuffer, OutputBuffer, QUEUE_TIMEOUT};

pub use events::{EventCallback, EventPayload};
use events::EventBus;

/// How a module's worker loop drives `process_iu`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    /// Consumes from left buffers and (optionally) produces to right
    /// buffers. A `Consuming` module (no declared output) is just a
    /// `General` module whose `output_kind()` is `None`.
    General,
    /// No inputs; `process_iu(None)` is invoked continuously and is expected
    /// to self-rate-limit.
    Producing,
    /// Worker idles; `trigger(data)` constructs and publishes synchronously.
    Trigger,
}

/// Free-form data handed to a `Trigger` module's `handle_trigger`.
pub type TriggerData = BTreeMap<String, MetaValue>;

/// The capability interface every concrete module implements. Lifecycle
/// hooks have no-op defaults; `process_iu`/`handle_trigger` are the module's
/// actual behavior.
pub trait Module: Send {
    fn kind(&self) -> ModuleKind;
    fn input_kinds(&self) -> &'static [IuKind];
    fn output_kind(&self) -> Option<IuKind>;

    /// Class tag used by graph persistence (§4.6). Must be stable across
    /// versions of the crate that still understand the same constructor
    /// arguments.
    fn class_tag(&self) -> &'static str;

    /// Constructor arguments as primitives, for graph persistence. Must be
    /// sufficient, together with `class_tag`, to reconstruct an equivalent
    /// module via the registry.
    fn init_args(&self) -> BTreeMap<String, MetaValue> {
        BTreeMap::new()
    }

    /// Called before any module in the graph starts, so that downstream
    /// state a producer might immediately depend on already exists.
    fn setup(&mut self, _ctx: &Arc<ModuleContext>) -> Result<()> {
        Ok(())
    }

    /// Called immediately before the worker starts; used by modules that
    /// need the surrounding network to be fully wired (e.g. to count
    /// subscribers), or that need to spawn an auxiliary thread of their own
    /// (the audio dispatcher's pacing loop, the turn-taking scheduler) —
    /// `ctx` is handed as an `Arc` precisely so such a thread can hold its
    /// own clone and call [`ModuleContext::publish`] independently of the
    /// main worker loop's `process_iu` return value.
    fn prepare_run(&mut self, _ctx: &Arc<ModuleContext>) -> Result<()> {
        Ok(())
    }

    fn shutdown(&mut self, _ctx: &Arc<ModuleContext>) -> Result<()> {
        Ok(())
    }

    /// The module's core transform. `input` is `Some` for `General` modules,
    /// always `None` for `Producing` modules. Returning `Ok(Some(iu))`
    /// publishes `iu` to every right buffer.
    fn process_iu(&mut self, ctx: &Arc<ModuleContext>, input: Option<IuRef>) -> Result<Option<IuRef>>;

    /// Handles an external `trigger(data)` call. Only `Trigger` modules need
    /// to override this.
    fn handle_trigger(
        &mut self,
        _ctx: &Arc<ModuleContext>,
        _data: TriggerData,
    ) -> Result<Option<IuRef>> {
        Err(RuntimeError::Other(anyhow::anyhow!(
            "module does not support triggering"
        )))
    }
}

/// Per-module state shared between the worker loop and the user's `Module`
/// impl: identity, the IU counter, the module's most recently produced IU,
/// and the event bus.
pub struct ModuleContext {
    pub id: ModuleId,
    pub name: String,
    iu_counter: AtomicU64,
    previous_iu: Mutex<Option<IuRef>>,
    events: EventBus,
    running: Arc<AtomicBool>,
    handle: OnceLock<Weak<ModuleHandle>>,
}

impl ModuleContext {
    fn new(name: impl Into<String>, running: Arc<AtomicBool>) -> Self {
        ModuleContext {
            id: ModuleId::next(),
            name: name.into(),
            iu_counter: AtomicU64::new(0),
            previous_iu: Mutex::new(None),
            events: EventBus::default(),
            running,
            handle: OnceLock::new(),
        }
    }

    /// Whether the owning module's worker is still supposed to be running.
    /// Auxiliary threads a module spawns in `prepare_run` (a pacing loop, a
    /// scheduler) poll this instead of looping forever.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Publishes `iu` as if returned from `process_iu`, validating it
    /// against the module's declared output kind and fanning it out to every
    /// right buffer. Lets a module's auxiliary thread publish independently
    /// of the worker loop's `process_iu` return value.
    pub fn publish(&self, iu: IuRef) -> Result<()> {
        match self.handle.get().and_then(Weak::upgrade) {
            Some(handle) => handle.publish(iu),
            None => Err(RuntimeError::QueueClosed),
        }
    }

    /// Constructs a new IU attributed to this module, chaining it onto the
    /// module's previously produced IU and truncating both link chains.
    pub fn create_iu(&self, payload: IuPayload, grounded_in: Option<&IuRef>) -> IuRef {
        let iuid = self.iu_counter.fetch_add(1, Ordering::SeqCst);
        let previous = self.previous_iu.lock().clone();
        let iu = Iu::new(
            self.id,
            self.name.clone(),
            iuid,
            previous.as_ref(),
            grounded_in,
            payload,
        );
        *self.previous_iu.lock() = Some(iu.clone());
        iu
    }

    pub fn latest_iu(&self) -> Option<IuRef> {
        self.previous_iu.lock().clone()
    }

    pub fn event_subscribe(&self, name: impl Into<String>, callback: EventCallback) {
        self.events.subscribe(name, callback);
    }

    pub fn event_call(&self, name: &str, data: EventPayload) {
        self.events.call(self.id, name, data);
    }
}

/// A running node in the module graph: a boxed [`Module`] plus its queues,
/// running flag, and worker thread.
pub struct ModuleHandle {
    pub ctx: Arc<ModuleContext>,
    module: Mutex<Box<dyn Module>>,
    left_buffers: Mutex<Vec<InputBuffer>>,
    right_buffers: Mutex<Vec<OutputBuffer>>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl ModuleHandle {
    pub fn new(name: impl Into<String>, module: Box<dyn Module>) -> Arc<Self> {
        let running = Arc::new(AtomicBool::new(false));
        let handle = Arc::new(ModuleHandle {
            ctx: Arc::new(ModuleContext::new(name, Arc::clone(&running))),
            module: Mutex::new(module),
            left_buffers: Mutex::new(Vec::new()),
            right_buffers: Mutex::new(Vec::new()),
            running,
            worker: Mutex::new(None),
        });
        let _ = handle.ctx.handle.set(Arc::downgrade(&handle));
        handle
    }

    pub fn id(&self) -> ModuleId {
        self.ctx.id
    }

    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    pub fn kind(&self) -> ModuleKind {
        self.module.lock().kind()
    }

    pub fn output_kind(&self) -> Option<IuKind> {
        self.module.lock().output_kind()
    }

    pub fn input_kinds(&self) -> &'static [IuKind] {
        self.module.lock().input_kinds()
    }

    pub fn class_tag(&self) -> &'static str {
        self.module.lock().class_tag()
    }

    pub fn init_args(&self) -> BTreeMap<String, MetaValue> {
        self.module.lock().init_args()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of right buffers currently wired, used by graph persistence
    /// round-trip checks and tests.
    pub fn right_buffer_count(&self) -> usize {
        self.right_buffers.lock().len()
    }

    pub fn left_buffer_count(&self) -> usize {
        self.left_buffers.lock().len()
    }

    pub fn right_buffer_consumers(&self) -> Vec<ModuleId> {
        self.right_buffers.lock().iter().map(|b| b.consumer).collect()
    }

    /// Producers feeding this module's left buffers, used by graph
    /// persistence's bidirectional BFS (§4.6).
    pub fn left_buffer_producers(&self) -> Vec<ModuleId> {
        self.left_buffers.lock().iter().map(|b| b.producer).collect()
    }

    /// Wires `self` as producer and `consumer` as consumer of a new queue.
    /// Per the invariant that adding a queue to a running module first stops
    /// it, both endpoints are stopped (if running) before the queue is
    /// created and left stopped — callers re-`run()` the graph afterward.
    pub fn subscribe(self: &Arc<Self>, consumer: &Arc<ModuleHandle>, maxsize: Option<usize>) -> Result<()> {
        if self.module.lock().output_kind().is_none() {
            return Err(RuntimeError::Other(anyhow::anyhow!(
                "module {} declares no output kind and cannot be subscribed to",
                self.name()
            )));
        }
        if self.is_running() {
            self.stop(true);
        }
        if consumer.is_running() {
            consumer.stop(true);
        }

        let (out, inp) = make_queue(self.id(), consumer.id(), maxsize);
        self.right_buffers.lock().push(out);
        consumer.left_buffers.lock().push(inp);

        self.ctx.event_call("subscribe", EventPayload::None);
        Ok(())
    }

    /// Tears down every queue between `self` and `consumer`, stopping both
    /// endpoints first.
    pub fn remove_subscriber(self: &Arc<Self>, consumer: &Arc<ModuleHandle>) {
        if self.is_running() {
            self.stop(true);
        }
        if consumer.is_running() {
            consumer.stop(true);
        }
        self.right_buffers.lock().retain(|b| b.consumer != consumer.id());
        consumer.left_buffers.lock().retain(|b| b.producer != self.id());
    }

    /// Starts the worker thread. `run_setup` controls whether `setup()` runs
    /// first (skipped on a restart where setup already ran once).
    pub fn run(self: &Arc<Self>, run_setup: bool) -> Result<()> {
        if run_setup {
            self.module.lock().setup(&self.ctx)?;
        }
        for rb in self.right_buffers.lock().iter() {
            rb.drain();
        }
        self.running.store(true, Ordering::SeqCst);

        let this = Arc::clone(self);
        let handle = std::thread::spawn(move || this.worker_loop());
        *self.worker.lock() = Some(handle);
        self.ctx.event_call("start", EventPayload::None);
        Ok(())
    }

    /// Flips the running flag; the worker observes it within one queue
    /// timeout or sleep and exits. `clear_buffer` drains right buffers so a
    /// later run doesn't deliver stale IUs.
    pub fn stop(&self, clear_buffer: bool) {
        self.running.store(false, Ordering::SeqCst);
        if clear_buffer {
            for rb in self.right_buffers.lock().iter() {
                rb.drain();
            }
        }
        self.ctx.event_call("stop", EventPayload::None);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    /// Synchronously constructs and publishes an IU for a `Trigger` module.
    pub fn trigger(&self, data: TriggerData) -> Result<()> {
        let produced = self.module.lock().handle_trigger(&self.ctx, data)?;
        if let Some(iu) = produced {
            self.publish(iu)?;
        }
        Ok(())
    }

    fn worker_loop(self: Arc<Self>) {
        if let Err(e) = self.module.lock().prepare_run(&self.ctx) {
            error!(module = %self.name(), error = %e, "prepare_run failed");
            self.running.store(false, Ordering::SeqCst);
            return;
        }

        match self.kind() {
            ModuleKind::General => self.run_general(),
            ModuleKind::Producing => self.run_producing(),
            ModuleKind::Trigger => self.run_trigger_idle(),
        }

        if let Err(e) = self.module.lock().shutdown(&self.ctx) {
            error!(module = %self.name(), error = %e, "shutdown failed");
        }
    }

    fn run_general(&self) {
        while self.running.load(Ordering::Relaxed) {
            let buffer_count = self.left_buffers.lock().len();
            if buffer_count == 0 {
                std::thread::sleep(QUEUE_TIMEOUT);
                continue;
            }
            for idx in 0..buffer_count {
                if !self.running.load(Ordering::Relaxed) {
                    return;
                }
                let popped = {
                    let buffers = self.left_buffers.lock();
                    match buffers.get(idx) {
                        Some(buf) => buf.pop_timeout(QUEUE_TIMEOUT),
                        None => Ok(None),
                    }
                };
                match popped {
                    Ok(Some(iu)) => {
                        if !self.validate_input(&iu) {
                            error!(
                                module = %self.name(),
                                kind = ?iu.payload.kind(),
                                "received IU of undeclared kind, stopping module"
                            );
                            self.running.store(false, Ordering::SeqCst);
                            return;
                        }
                        self.ctx.event_call("process_iu", EventPayload::Iu(iu.clone()));
                        let result = self.module.lock().process_iu(&self.ctx, Some(iu.clone()));
                        iu.set_processed(self.id());
                        if let Err(stop) = self.handle_process_result(result) {
                            debug!(module = %self.name(), %stop, "worker stopping");
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(RuntimeError::QueueClosed) => {
                        debug!(module = %self.name(), buffer = idx, "left buffer closed");
                    }
                    Err(e) => {
                        warn!(module = %self.name(), error = %e, "error popping left buffer");
                    }
                }
            }
        }
    }

    fn run_producing(&self) {
        while self.running.load(Ordering::Relaxed) {
            let result = self.module.lock().process_iu(&self.ctx, None);
            if self.handle_process_result(result).is_err() {
                return;
            }
        }
    }

    fn run_trigger_idle(&self) {
        while self.running.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    /// Publishes a produced IU (if any) and maps a hard error to a stop
    /// signal for the caller's loop.
    fn handle_process_result(&self, result: Result<Option<IuRef>>) -> std::result::Result<(), String> {
        match result {
            Ok(Some(output)) => match self.publish(output) {
                Ok(()) => Ok(()),
                Err(e) => {
                    error!(module = %self.name(), error = %e, "publish failed, stopping module");
                    self.running.store(false, Ordering::SeqCst);
                    Err(e.to_string())
                }
            },
            Ok(None) => Ok(()),
            Err(e) => {
                error!(module = %self.name(), error = %e, "process_iu failed, stopping module");
                self.running.store(false, Ordering::SeqCst);
                Err(e.to_string())
            }
        }
    }

    fn validate_input(&self, iu: &IuRef) -> bool {
        let kind = iu.payload.kind();
        self.module
            .lock()
            .input_kinds()
            .iter()
            .any(|declared| kind.is_subtype_of(*declared))
    }

    pub(crate) fn publish(&self, iu: IuRef) -> Result<()> {
        let declared = self.module.lock().output_kind();
        match declared {
            None => Err(RuntimeError::InvalidIuKind {
                expected: "none (module declares no output)".to_string(),
                got: format!("{:?}", iu.payload.kind()),
            }),
            Some(expected) => {
                if !iu.payload.kind().is_subtype_of(expected) {
                    return Err(RuntimeError::InvalidIuKind {
                        expected: format!("{expected:?}"),
                        got: format!("{:?}", iu.payload.kind()),
                    });
                }
                for rb in self.right_buffers.lock().iter() {
                    rb.publish(iu.clone())?;
                }
                info!(module = %self.name(), kind = ?expected, "published IU");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// A trivial General module: echoes Text IUs back out unmodified.
    struct Echo {
        seen: Arc<AtomicUsize>,
    }

    impl Module for Echo {
        fn kind(&self) -> ModuleKind {
            ModuleKind::General
        }
        fn input_kinds(&self) -> &'static [IuKind] {
            &[IuKind::Text]
        }
        fn output_kind(&self) -> Option<IuKind> {
            Some(IuKind::Text)
        }
        fn class_tag(&self) -> &'static str {
            "test.Echo"
        }
        fn process_iu(&mut self, ctx: &Arc<ModuleContext>, input: Option<IuRef>) -> Result<Option<IuRef>> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            let input = input.expect("general module always receives input");
            let text = input.payload.text().unwrap_or_default().to_string();
            Ok(Some(ctx.create_iu(IuPayload::Text { text }, Some(&input))))
        }
    }

    struct Producer {
        remaining: usize,
    }

    impl Module for Producer {
        fn kind(&self) -> ModuleKind {
            ModuleKind::Producing
        }
        fn input_kinds(&self) -> &'static [IuKind] {
            &[]
        }
        fn output_kind(&self) -> Option<IuKind> {
            Some(IuKind::Text)
        }
        fn class_tag(&self) -> &'static str {
            "test.Producer"
        }
        fn process_iu(&mut self, ctx: &Arc<ModuleContext>, _input: Option<IuRef>) -> Result<Option<IuRef>> {
            if self.remaining == 0 {
                std::thread::sleep(Duration::from_millis(5));
                return Ok(None);
            }
            self.remaining -= 1;
            Ok(Some(ctx.create_iu(
                IuPayload::Text {
                    text: "tick".to_string(),
                },
                None,
            )))
        }
    }

    #[test]
    fn general_module_echoes_and_marks_processed() {
        let producer = ModuleHandle::new("producer", Box::new(Producer { remaining: 3 }));
        let seen = Arc::new(AtomicUsize::new(0));
        let echo = ModuleHandle::new("echo", Box::new(Echo { seen: seen.clone() }));

        producer.subscribe(&echo, None).unwrap();
        let (consumer_out, consumer_in) = make_queue(echo.id(), ModuleId::next(), None);
        echo.right_buffers.lock().push(consumer_out);

        producer.run(true).unwrap();
        echo.run(true).unwrap();

        let mut received = 0;
        for _ in 0..3 {
            if consumer_in.pop_timeout(Duration::from_millis(200)).unwrap().is_some() {
                received += 1;
            }
        }
        assert_eq!(received, 3);

        producer.stop(true);
        echo.stop(true);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn subscribing_to_consuming_module_is_rejected() {
        struct Sink;
        impl Module for Sink {
            fn kind(&self) -> ModuleKind {
                ModuleKind::General
            }
            fn input_kinds(&self) -> &'static [IuKind] {
                &[IuKind::Text]
            }
            fn output_kind(&self) -> Option<IuKind> {
                None
            }
            fn class_tag(&self) -> &'static str {
                "test.Sink"
            }
            fn process_iu(&mut self, _ctx: &Arc<ModuleContext>, _input: Option<IuRef>) -> Result<Option<IuRef>> {
                Ok(None)
            }
        }

        let sink = ModuleHandle::new("sink", Box::new(Sink));
        let other = ModuleHandle::new("other", Box::new(Sink));
        assert!(sink.subscribe(&other, None).is_err());
    }

    #[test]
    fn invalid_output_kind_stops_the_producer() {
        struct BadProducer;
        impl Module for BadProducer {
            fn kind(&self) -> ModuleKind {
                ModuleKind::Producing
            }
            fn input_kinds(&self) -> &'static [IuKind] {
                &[]
            }
            fn output_kind(&self) -> Option<IuKind> {
                Some(IuKind::Text)
            }
            fn class_tag(&self) -> &'static str {
                "test.BadProducer"
            }
            fn process_iu(&mut self, ctx: &Arc<ModuleContext>, _input: Option<IuRef>) -> Result<Option<IuRef>> {
                Ok(Some(ctx.create_iu(
                    IuPayload::EndOfTurn {
                        probability: 0.0,
                        is_speaking: false,
                    },
                    None,
                )))
            }
        }

        let producer = ModuleHandle::new("bad", Box::new(BadProducer));
        producer.run(true).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_running());
    }

    #[test]
    fn trigger_module_only_emits_on_demand() {
        struct Button {
            count: u64,
        }
        impl Module for Button {
            fn kind(&self) -> ModuleKind {
                ModuleKind::Trigger
            }
            fn input_kinds(&self) -> &'static [IuKind] {
                &[]
            }
            fn output_kind(&self) -> Option<IuKind> {
                Some(IuKind::Text)
            }
            fn class_tag(&self) -> &'static str {
                "test.Button"
            }
            fn process_iu(&mut self, _ctx: &Arc<ModuleContext>, _input: Option<IuRef>) -> Result<Option<IuRef>> {
                Ok(None)
            }
            fn handle_trigger(&mut self, ctx: &Arc<ModuleContext>, _data: TriggerData) -> Result<Option<IuRef>> {
                self.count += 1;
                Ok(Some(ctx.create_iu(
                    IuPayload::Text {
                        text: format!("press-{}", self.count),
                    },
                    None,
                )))
            }
        }

        let button = ModuleHandle::new("button", Box::new(Button { count: 0 }));
        let (out, inp) = make_queue(button.id(), ModuleId::next(), None);
        button.right_buffers.lock().push(out);
        button.run(true).unwrap();

        assert!(inp.pop_timeout(Duration::from_millis(80)).unwrap().is_none());
        button.trigger(TriggerData::new()).unwrap();
        let iu = inp.pop_timeout(Duration::from_millis(200)).unwrap().unwrap();
        assert_eq!(iu.payload.text(), Some("press-1"));

        button.stop(true);
    }
}
