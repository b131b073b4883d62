//! Consumer-only debug modules (§4.7): a console-style logger for every
//! incoming IU, and a generic callback sink used throughout tests and ad hoc
//! wiring instead of a one-off recorder.

use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::iu::{IuKind, IuRef};
use crate::module::{Module, ModuleContext, ModuleKind};

/// Logs every incoming IU's kind, creator, previous/grounded links, and age
/// at `debug!` level. Accepts any IU kind, grounded in the original source's
/// `DebugModule`.
#[derive(Default)]
pub struct DebugModule;

impl Module for DebugModule {
    fn kind(&self) -> ModuleKind {
        ModuleKind::General
    }
    fn input_kinds(&self) -> &'static [IuKind] {
        &[
            IuKind::Audio,
            IuKind::Speech,
            IuKind::DispatchedAudio,
            IuKind::Text,
            IuKind::GeneratedText,
            IuKind::SpeechRecognition,
            IuKind::DialogueAct,
            IuKind::DispatchableAct,
            IuKind::EndOfTurn,
        ]
    }
    fn output_kind(&self) -> Option<IuKind> {
        None
    }
    fn class_tag(&self) -> &'static str {
        "debug.DebugModule"
    }

    fn process_iu(&mut self, _ctx: &Arc<ModuleContext>, input: Option<IuRef>) -> Result<Option<IuRef>> {
        let iu = input.expect("general module always receives input");
        debug!(
            kind = ?iu.payload.kind(),
            creator = %iu.creator,
            iuid = iu.iuid,
            has_previous = iu.previous_iu().is_some(),
            has_grounded_in = iu.grounded_in().is_some(),
            age_ms = iu.age().as_millis() as u64,
            "debug module received IU"
        );
        Ok(None)
    }
}

/// A generic consuming module that forwards every incoming IU to a
/// user-supplied closure, grounded in the original source's
/// `CallbackModule`. Used for ad hoc recording/assertion needs in place of a
/// dedicated consumer module (§4.10).
pub struct CallbackModule {
    callback: Box<dyn FnMut(&IuRef) + Send>,
}

impl CallbackModule {
    pub fn new(callback: impl FnMut(&IuRef) + Send + 'static) -> Self {
        CallbackModule {
            callback: Box::new(callback),
        }
    }
}

impl Module for CallbackModule {
    fn kind(&self) -> ModuleKind {
        ModuleKind::General
    }
    fn input_kinds(&self) -> &'static [IuKind] {
        &[
            IuKind::Audio,
            IuKind::Speech,
            IuKind::DispatchedAudio,
            IuKind::Text,
            IuKind::GeneratedText,
            IuKind::SpeechRecognition,
            IuKind::DialogueAct,
            IuKind::DispatchableAct,
            IuKind::EndOfTurn,
        ]
    }
    fn output_kind(&self) -> Option<IuKind> {
        None
    }
    fn class_tag(&self) -> &'static str {
        "debug.CallbackModule"
    }

    fn process_iu(&mut self, _ctx: &Arc<ModuleContext>, input: Option<IuRef>) -> Result<Option<IuRef>> {
        let iu = input.expect("general module always receives input");
        (self.callback)(&iu);
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iu::IuPayload;
    use crate::module::ModuleHandle;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    #[test]
    fn callback_module_invokes_closure_per_iu() {
        let count = StdArc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let handle = ModuleHandle::new("source", Box::new(DebugModule));
        let iu = handle.ctx.create_iu(IuPayload::Text { text: "hi".into() }, None);
        let mut module = CallbackModule::new(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        module.process_iu(&handle.ctx, Some(iu)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn debug_module_never_produces_output() {
        let handle = ModuleHandle::new("debug", Box::new(DebugModule));
        let iu = handle
            .ctx
            .create_iu(IuPayload::Text { text: "hi".into() }, None);
        let mut module = DebugModule;
        let out = module.process_iu(&handle.ctx, Some(iu)).unwrap();
        assert!(out.is_none());
    }
}
