//! Simulation-grade end-of-turn prediction (§4.9): republishes the *other*
//! side's `DispatchedAudio` stream as `EndOfTurn` IUs, copying `completion`
//! → `probability` and `is_dispatching` → `is_speaking`. Grounded in the
//! original source's `SimulatedEoTModule` — stands in for a real prosodic
//! end-of-turn classifier, which would be an external backend (out of
//! scope).

use std::sync::Arc;

use crate::error::Result;
use crate::iu::{IuKind, IuPayload, IuRef};
use crate::module::{Module, ModuleContext, ModuleKind};

#[derive(Default)]
pub struct SimulatedEot;

impl Module for SimulatedEot {
    fn kind(&self) -> ModuleKind {
        ModuleKind::General
    }
    fn input_kinds(&self) -> &'static [IuKind] {
        &[IuKind::DispatchedAudio]
    }
    fn output_kind(&self) -> Option<IuKind> {
        Some(IuKind::EndOfTurn)
    }
    fn class_tag(&self) -> &'static str {
        "eot.SimulatedEot"
    }

    fn process_iu(&mut self, ctx: &Arc<ModuleContext>, input: Option<IuRef>) -> Result<Option<IuRef>> {
        let input = input.expect("general module always receives input");
        let (completion, is_dispatching) = match &input.payload {
            IuPayload::DispatchedAudio {
                completion,
                is_dispatching,
                ..
            } => (*completion, *is_dispatching),
            _ => return Ok(None),
        };
        Ok(Some(ctx.create_iu(
            IuPayload::EndOfTurn {
                probability: completion,
                is_speaking: is_dispatching,
            },
            Some(&input),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iu::AudioPayload;
    use crate::module::ModuleHandle;

    #[test]
    fn copies_completion_and_is_dispatching_through() {
        let mut eot = SimulatedEot;
        let handle = ModuleHandle::new("eot", Box::new(SimulatedEot));
        let input = handle.ctx.create_iu(
            IuPayload::DispatchedAudio {
                audio: AudioPayload::silence(10, 44_100, 2),
                completion: 0.73,
                is_dispatching: true,
            },
            None,
        );
        let out = eot.process_iu(&handle.ctx, Some(input)).unwrap().unwrap();
        match out.payload {
            IuPayload::EndOfTurn { probability, is_speaking } => {
                assert_eq!(probability, 0.73);
                assert!(is_speaking);
            }
            _ => panic!("expected EndOfTurn"),
        }
    }
}
