//! The turn-taking dialogue manager (§4.5): the largest single module in the
//! crate. Tracks a `DialogueState` for each side, runs a dedicated ~50ms
//! scheduler thread that decides when to speak using the `gando`/`pause`
//! timing models, and drives an inner [`crate::dm::DialogueManagerAdapter`]
//! for act content. Grounded in the original source's turn-taking DM
//! (`retico.modules.simulation.dm`), with the exact SCT11-revision formulas
//! this specification calls for rather than that module's older constants.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tracing::info;

use crate::dm::DialogueManagerAdapter;
use crate::error::Result;
use crate::iu::{IuKind, IuPayload, IuRef};
use crate::module::events::EventPayload;
use crate::module::{Module, ModuleContext, ModuleKind};

/// The heard-act processing floor (§4.5): an act is only forwarded to the
/// inner DM once the other side's predicted completion exceeds this.
const P_PROCESS: f64 = 0.30;

const SCHEDULER_TICK: Duration = Duration::from_millis(50);

/// One side's turn-taking bookkeeping (§4.5).
#[derive(Debug, Clone, Default)]
struct DialogueState {
    utter_start: Option<Instant>,
    utter_end: Option<Instant>,
    is_speaking: bool,
    completion: f32,
    current_act: Option<String>,
    last_act: Option<String>,
}

struct SchedulerState {
    me: DialogueState,
    other: DialogueState,
    r: f64,
    suspended: bool,
    dialogue_started: bool,
}

impl SchedulerState {
    fn new() -> Self {
        SchedulerState {
            me: DialogueState::default(),
            other: DialogueState::default(),
            r: redraw(),
            suspended: false,
            dialogue_started: false,
        }
    }
}

fn redraw() -> f64 {
    rand::thread_rng().gen_range(1e-6..=1.0)
}

/// `gando(r) = -0.322581 * ln(0.433008 * (1/r - 1))`, or the alternate form
/// halved when positive if the other's current act is one of
/// `provide_partial`/`provide_info`/`confirm` (§4.5).
fn gando(r: f64, other_current_act: Option<&str>) -> f64 {
    let alt = matches!(
        other_current_act,
        Some("provide_partial") | Some("provide_info") | Some("confirm")
    );
    let mut v = if alt {
        -0.159767 * (0.169563 * (1.0 / r - 1.0)).ln()
    } else {
        -0.322581 * (0.433008 * (1.0 / r - 1.0)).ln()
    };
    if alt && v > 0.0 {
        v /= 2.0;
    }
    v
}

/// `pause(r) = 0.925071 * (0.843217 + 2.92309 * r^2)` with the additive
/// adjustments from §4.5, clamped to a 0.2s floor.
fn pause(r: f64, speaker_last_act: Option<&str>, other_last_act: Option<&str>) -> f64 {
    let mut v = 0.925071 * (0.843217 + 2.92309 * r * r);
    if speaker_last_act == Some("request_info") {
        v += 1.5;
    }
    if speaker_last_act == Some("confirm") && other_last_act == Some("provide_partial") {
        v += 0.5;
    }
    if speaker_last_act == Some("greeting") && other_last_act == Some("greeting") {
        v = 0.2;
    } else if speaker_last_act == Some("greeting") && other_last_act.is_none() {
        v += 0.5;
    }
    if v < 0.0 {
        v = 0.2;
    }
    v
}

fn in_middle_of_turn(completion: f32) -> bool {
    0.3 < completion && completion < 0.7
}

/// `i_spoke_last = is_speaking_self OR (utter_end_self > utter_end_other)`.
fn i_spoke_last(me: &DialogueState, other: &DialogueState) -> bool {
    if me.is_speaking {
        return true;
    }
    match (me.utter_end, other.utter_end) {
        (Some(mine), Some(theirs)) => mine > theirs,
        (Some(_), None) => true,
        _ => false,
    }
}

/// Elapsed time since the other's last end-of-turn, positive once silent and
/// growing; a negative estimate of time remaining in their turn while they
/// are still speaking (§4.5). Silence that has never been observed is
/// treated as infinitely old so the very first decision isn't blocked.
fn time_since_eot(other: &DialogueState) -> f64 {
    if !other.is_speaking {
        match other.utter_end {
            Some(t) => t.elapsed().as_secs_f64(),
            None => f64::INFINITY,
        }
    } else {
        let utter_len = other.utter_start.map(|s| s.elapsed().as_secs_f64()).unwrap_or(0.0);
        let completion = (other.completion as f64).max(1e-3);
        -(utter_len / completion - utter_len)
    }
}

#[derive(Debug, PartialEq)]
enum Decision {
    None,
    Speak,
    /// Both sides mid-turn: suppress our own output and fire `doubletalk`.
    Doubletalk,
}

fn decide(state: &SchedulerState, is_first_speaker: bool) -> Decision {
    if !state.dialogue_started {
        return if is_first_speaker { Decision::Speak } else { Decision::None };
    }

    let i_speak = state.me.is_speaking;
    let they_speak = state.other.is_speaking;

    match (i_speak, they_speak) {
        (true, false) => Decision::None,
        (false, true) => {
            let they_spoke_for = state.other.utter_start.map(|s| s.elapsed().as_secs_f64()).unwrap_or(0.0);
            let g = gando(state.r, state.other.current_act.as_deref());
            if time_since_eot(&state.other) > g && they_spoke_for > 1.0 {
                Decision::Speak
            } else {
                Decision::None
            }
        }
        (false, false) => {
            if !i_spoke_last(&state.me, &state.other) {
                let g = gando(state.r, state.other.current_act.as_deref());
                if time_since_eot(&state.other) > g {
                    Decision::Speak
                } else {
                    Decision::None
                }
            } else {
                let p = pause(state.r, state.me.last_act.as_deref(), state.other.last_act.as_deref());
                let since_self_end = state.me.utter_end.map(|t| t.elapsed().as_secs_f64()).unwrap_or(f64::INFINITY);
                if since_self_end > p {
                    Decision::Speak
                } else {
                    Decision::None
                }
            }
        }
        (true, true) => {
            let mid = in_middle_of_turn(state.me.completion) || in_middle_of_turn(state.other.completion);
            if mid && rand::thread_rng().gen::<f64>() < 0.1 {
                Decision::Doubletalk
            } else {
                Decision::None
            }
        }
    }
}

/// Whether this agent speaks first when no dialogue has started yet.
#[derive(Debug, Clone, Copy)]
pub struct TurnTakingConfig {
    pub is_first_speaker: bool,
}

/// Coordinates both sides' `DialogueState` and drives an inner
/// [`DialogueManagerAdapter`] for act content (§4.5). Grounded in the
/// original source's turn-taking DM module.
pub struct TurnTakingDm {
    config: TurnTakingConfig,
    inner: Arc<Mutex<Box<dyn DialogueManagerAdapter>>>,
    state: Arc<Mutex<SchedulerState>>,
    loop_running: Arc<AtomicBool>,
}

impl TurnTakingDm {
    pub fn new(config: TurnTakingConfig, inner: Box<dyn DialogueManagerAdapter>) -> Self {
        TurnTakingDm {
            config,
            inner: Arc::new(Mutex::new(inner)),
            state: Arc::new(Mutex::new(SchedulerState::new())),
            loop_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The most recent act this side has spoken, for tests and external
    /// observers that don't want to subscribe to `said`.
    pub fn last_spoken_act(&self) -> Option<String> {
        self.state.lock().me.current_act.clone()
    }
}

impl Module for TurnTakingDm {
    fn kind(&self) -> ModuleKind {
        ModuleKind::General
    }
    fn input_kinds(&self) -> &'static [IuKind] {
        &[IuKind::DialogueAct, IuKind::DispatchedAudio, IuKind::EndOfTurn]
    }
    fn output_kind(&self) -> Option<IuKind> {
        Some(IuKind::DispatchableAct)
    }
    fn class_tag(&self) -> &'static str {
        "turntaking.TurnTakingDm"
    }
    fn init_args(&self) -> BTreeMap<String, crate::meta::MetaValue> {
        let mut args = BTreeMap::new();
        args.insert("is_first_speaker".to_string(), self.config.is_first_speaker.into());
        args
    }

    fn prepare_run(&mut self, ctx: &Arc<ModuleContext>) -> Result<()> {
        self.loop_running.store(true, Ordering::SeqCst);
        let state = Arc::clone(&self.state);
        let inner = Arc::clone(&self.inner);
        let loop_running = Arc::clone(&self.loop_running);
        let ctx = Arc::clone(ctx);
        let is_first_speaker = self.config.is_first_speaker;

        std::thread::spawn(move || {
            while loop_running.load(Ordering::Relaxed) && ctx.is_running() {
                std::thread::sleep(SCHEDULER_TICK);
                let mut guard = state.lock();
                if guard.suspended {
                    continue;
                }

                match decide(&guard, is_first_speaker) {
                    Decision::None => {}
                    Decision::Doubletalk => {
                        drop(guard);
                        ctx.event_call("doubletalk", EventPayload::None);
                    }
                    Decision::Speak => {
                        let (act, concepts) = inner.lock().next_act();
                        let is_goodbye = act == "goodbye";
                        guard.me.last_act = guard.me.current_act.take();
                        guard.me.current_act = Some(act.clone());
                        guard.me.utter_start = Some(Instant::now());
                        guard.dialogue_started = true;
                        guard.suspended = true;
                        guard.r = redraw();
                        drop(guard);

                        let iu = ctx.create_iu(
                            IuPayload::DispatchableAct {
                                act: act.clone(),
                                concepts,
                                confidence: 1.0,
                                dispatch: true,
                            },
                            None,
                        );
                        if ctx.publish(iu).is_ok() {
                            info!(act = %act, "turn-taking DM spoke");
                            ctx.event_call("said", EventPayload::None);
                            if is_goodbye {
                                ctx.event_call("dialogue_end", EventPayload::None);
                            }
                        }
                    }
                }
            }
        });
        Ok(())
    }

    fn shutdown(&mut self, _ctx: &Arc<ModuleContext>) -> Result<()> {
        self.loop_running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn process_iu(&mut self, ctx: &Arc<ModuleContext>, input: Option<IuRef>) -> Result<Option<IuRef>> {
        let input = input.expect("general module always receives input");
        match &input.payload {
            IuPayload::DialogueAct { act, concepts, .. } => {
                let mut state = self.state.lock();
                let should_process =
                    state.other.completion as f64 > P_PROCESS && state.other.current_act.as_deref() != Some(act.as_str());
                if should_process {
                    self.inner.lock().process_act(act, concepts);
                    state.other.current_act = Some(act.clone());
                    drop(state);
                    ctx.event_call("heard", EventPayload::Iu(input.clone()));
                }
            }
            IuPayload::DispatchedAudio {
                completion,
                is_dispatching,
                ..
            } => {
                let mut state = self.state.lock();
                let was_speaking = state.me.is_speaking;
                state.me.is_speaking = *is_dispatching;
                state.me.completion = *completion;
                let now = Instant::now();
                if *is_dispatching && !was_speaking {
                    state.me.utter_start = Some(now);
                }
                if !*is_dispatching && was_speaking {
                    state.me.utter_end = Some(now);
                }
                if was_speaking != *is_dispatching {
                    state.suspended = false;
                    state.r = redraw();
                }
            }
            IuPayload::EndOfTurn { probability, is_speaking } => {
                let mut state = self.state.lock();
                let was_speaking = state.other.is_speaking;
                state.other.is_speaking = *is_speaking;
                state.other.completion = *probability;
                let now = Instant::now();
                if *is_speaking && !was_speaking {
                    state.other.utter_start = Some(now);
                }
                if !*is_speaking && was_speaking {
                    state.other.utter_end = Some(now);
                }
                if *probability >= 1.0 {
                    state.other.last_act = state.other.current_act.take();
                }
            }
            _ => {}
        }
        Ok(None)
    }
}
