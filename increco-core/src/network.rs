//! The network degradation layer (§4.4): an ordered list of degradations
//! applied to each incoming `DispatchedAudio` IU before republishing a copy.
//! Grounded in the original source's `retico.modules.net.degradations` and
//! `retico.modules.net.network` modules.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::error::Result;
use crate::iu::{AudioPayload, IuKind, IuPayload, IuRef};
use crate::meta::MetaMap;
use crate::module::{Module, ModuleContext, ModuleKind};

/// One degradation applied, in order, to a `DispatchedAudio` copy. `age` is
/// the incoming IU's age at the moment degradation started, so a `Delay`
/// degradation can account for time already spent upstream.
pub trait Degradation: Send {
    fn degrade(&mut self, audio: &mut AudioPayload, age: Duration, meta: &mut MetaMap);
}

/// Waits `max(0, delay - iu.age())` before the caller republishes, so the
/// original inter-arrival distribution is preserved while the stream is
/// shifted by a fixed amount (§4.4).
pub struct Delay {
    pub delay: Duration,
}

impl Delay {
    pub fn new(delay: Duration) -> Self {
        Delay { delay }
    }
}

impl Degradation for Delay {
    fn degrade(&mut self, _audio: &mut AudioPayload, age: Duration, meta: &mut MetaMap) {
        let wait = self.delay.saturating_sub(age);
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
        meta.insert("delay".to_string(), self.delay.as_secs_f64().into());
    }
}

/// A two-state Markov packet-loss model (§4.4). States: `found` (0),
/// `lost` (1). `q = (1 - p_pl) / burst_r` is the lost→found transition
/// probability; `p = p_pl * q / (1 - p_pl)` is the found→lost transition
/// probability.
pub struct PacketLoss {
    p_pl: f64,
    burst_r: f64,
    p: f64,
    q: f64,
    state: PlState,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum PlState {
    Found,
    Lost,
}

impl PacketLoss {
    pub fn new(p_pl: f64, burst_r: f64) -> Self {
        let q = (1.0 - p_pl) / burst_r;
        let p = if (1.0 - p_pl).abs() < f64::EPSILON {
            0.0
        } else {
            p_pl * q / (1.0 - p_pl)
        };
        PacketLoss {
            p_pl,
            burst_r,
            p,
            q,
            state: PlState::Found,
        }
    }

    fn step(&mut self, sample: f64) -> PlState {
        self.state = match self.state {
            PlState::Found if sample < self.p => PlState::Lost,
            PlState::Found => PlState::Found,
            PlState::Lost if sample < self.q => PlState::Found,
            PlState::Lost => PlState::Lost,
        };
        self.state
    }
}

impl Degradation for PacketLoss {
    fn degrade(&mut self, audio: &mut AudioPayload, _age: Duration, meta: &mut MetaMap) {
        let sample: f64 = rand::thread_rng().gen();
        let new_state = self.step(sample);
        if new_state == PlState::Lost {
            audio.raw_bytes = vec![0u8; audio.raw_bytes.len()];
            meta.insert("packet-loss".to_string(), true.into());
        } else {
            meta.insert("packet-loss".to_string(), false.into());
        }
        meta.insert("ppl".to_string(), self.p_pl.into());
        meta.insert("burstr".to_string(), self.burst_r.into());
    }
}

/// Applies its ordered degradations (loss before delay, so delayed arrivals
/// reflect their degraded content, §4.4) to a copy of each incoming
/// `DispatchedAudio` IU and republishes it.
pub struct NetworkDegrader {
    degradations: Vec<Box<dyn Degradation>>,
}

impl NetworkDegrader {
    pub fn new() -> Self {
        NetworkDegrader { degradations: Vec::new() }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.degradations.push(Box::new(Delay::new(delay)));
        self
    }

    pub fn with_packet_loss(mut self, p_pl: f64, burst_r: f64) -> Self {
        self.degradations.insert(0, Box::new(PacketLoss::new(p_pl, burst_r)));
        self
    }
}

impl Default for NetworkDegrader {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for NetworkDegrader {
    fn kind(&self) -> ModuleKind {
        ModuleKind::General
    }
    fn input_kinds(&self) -> &'static [IuKind] {
        &[IuKind::DispatchedAudio]
    }
    fn output_kind(&self) -> Option<IuKind> {
        Some(IuKind::DispatchedAudio)
    }
    fn class_tag(&self) -> &'static str {
        "network.NetworkDegrader"
    }

    fn process_iu(&mut self, ctx: &Arc<ModuleContext>, input: Option<IuRef>) -> Result<Option<IuRef>> {
        let input = input.expect("general module always receives input");
        let (mut audio, completion, is_dispatching) = match &input.payload {
            IuPayload::DispatchedAudio {
                audio,
                completion,
                is_dispatching,
            } => (audio.clone(), *completion, *is_dispatching),
            _ => return Ok(None),
        };

        let age = input.age();
        let mut meta = MetaMap::new();
        for degradation in &mut self.degradations {
            degradation.degrade(&mut audio, age, &mut meta);
        }

        let output = ctx.create_iu(
            IuPayload::DispatchedAudio {
                audio,
                completion,
                is_dispatching,
            },
            Some(&input),
        );
        for (k, v) in meta {
            output.meta_set(k, v);
        }
        debug!(iuid = output.iuid, "network degrader republished IU");
        Ok(Some(output))
    }
}
