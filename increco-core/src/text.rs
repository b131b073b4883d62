//! Dataflow-shaping text modules: turning ASR hypothesis streams into true
//! increments, and turning text-bearing IUs into dispatchable `GeneratedText`
//! IUs for NLG/TTS (§4.8).

use std::sync::Arc;

use crate::error::Result;
use crate::iu::{IuKind, IuPayload, IuRef};
use crate::module::{Module, ModuleContext, ModuleKind};

/// Diffs each new ASR hypothesis against the text of previously emitted
/// (non-revoked) IUs from this stage and emits only the novel suffix,
/// revoking earlier IUs whose text is no longer a prefix of the new one.
/// Hypotheses below `threshold` stability (and zero confidence) are dropped,
/// grounded in the original source's `IncrementalizeASRModule`.
pub struct IncrementalizeAsr {
    threshold: f32,
    last_ius: Vec<IuRef>,
}

impl IncrementalizeAsr {
    pub fn new(threshold: f32) -> Self {
        IncrementalizeAsr {
            threshold,
            last_ius: Vec::new(),
        }
    }

    fn get_increment(&mut self, new_text: &str) -> String {
        let mut remainder = new_text.to_string();
        for iu in &self.last_ius {
            let prefix = iu.payload.text().unwrap_or_default();
            if let Some(rest) = remainder.strip_prefix(prefix) {
                remainder = rest.to_string();
            } else {
                iu.revoke();
            }
        }
        self.last_ius.retain(|iu| !iu.is_revoked());
        remainder
    }
}

impl Default for IncrementalizeAsr {
    fn default() -> Self {
        Self::new(0.8)
    }
}

impl Module for IncrementalizeAsr {
    fn kind(&self) -> ModuleKind {
        ModuleKind::General
    }
    fn input_kinds(&self) -> &'static [IuKind] {
        &[IuKind::SpeechRecognition]
    }
    fn output_kind(&self) -> Option<IuKind> {
        Some(IuKind::SpeechRecognition)
    }
    fn class_tag(&self) -> &'static str {
        "text.IncrementalizeAsr"
    }

    fn process_iu(&mut self, ctx: &Arc<ModuleContext>, input: Option<IuRef>) -> Result<Option<IuRef>> {
        let input = input.expect("general module always receives input");
        let (predictions, stability, confidence, final_, text) = match &input.payload {
            IuPayload::SpeechRecognition {
                predictions,
                stability,
                confidence,
                final_,
                text,
            } => (predictions.clone(), *stability, *confidence, *final_, text.clone()),
            _ => return Ok(None),
        };

        if stability < self.threshold && confidence == 0.0 {
            return Ok(None);
        }

        let current_text = if self.last_ius.is_empty() {
            text
        } else {
            self.get_increment(&text)
        };
        if current_text.trim().is_empty() {
            return Ok(None);
        }

        let output = ctx.create_iu(
            IuPayload::SpeechRecognition {
                predictions,
                stability,
                confidence,
                final_,
                text: current_text,
            },
            Some(&input),
        );
        self.last_ius.push(output.clone());
        if final_ {
            self.last_ius.clear();
            output.commit();
        }
        Ok(Some(output))
    }
}

/// Turns `SpeechRecognition`/`Text` IUs into dispatchable `GeneratedText` IUs,
/// optionally gated to only forward `final` ASR hypotheses, grounded in the
/// original source's `TextDispatcherModule`.
pub struct TextToDispatchableText {
    forward_after_final: bool,
}

impl TextToDispatchableText {
    pub fn new(forward_after_final: bool) -> Self {
        TextToDispatchableText { forward_after_final }
    }
}

impl Default for TextToDispatchableText {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Module for TextToDispatchableText {
    fn kind(&self) -> ModuleKind {
        ModuleKind::General
    }
    fn input_kinds(&self) -> &'static [IuKind] {
        &[IuKind::Text, IuKind::SpeechRecognition]
    }
    fn output_kind(&self) -> Option<IuKind> {
        Some(IuKind::GeneratedText)
    }
    fn class_tag(&self) -> &'static str {
        "text.TextToDispatchableText"
    }

    fn process_iu(&mut self, ctx: &Arc<ModuleContext>, input: Option<IuRef>) -> Result<Option<IuRef>> {
        let input = input.expect("general module always receives input");
        if let IuPayload::SpeechRecognition { final_, .. } = &input.payload {
            if self.forward_after_final && !final_ {
                return Ok(None);
            }
        }
        let text = input.payload.text().unwrap_or_default().to_string();
        Ok(Some(ctx.create_iu(
            IuPayload::GeneratedText { text, dispatch: true },
            Some(&input),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleHandle;

    fn sr_iu(predictions: &str, stability: f32, confidence: f32, final_: bool) -> IuPayload {
        IuPayload::SpeechRecognition {
            predictions: vec![predictions.to_string()],
            stability,
            confidence,
            final_,
            text: predictions.to_string(),
        }
    }

    #[test]
    fn low_stability_zero_confidence_is_dropped() {
        let mut stage = IncrementalizeAsr::new(0.8);
        let ctx_handle = ModuleHandle::new("asr", Box::new(NoopGeneral));
        let input = ctx_handle.ctx.create_iu(sr_iu("hello", 0.1, 0.0, false), None);
        let out = stage.process_iu(&ctx_handle.ctx, Some(input)).unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn successive_hypotheses_emit_only_the_novel_suffix() {
        let mut stage = IncrementalizeAsr::new(0.5);
        let ctx_handle = ModuleHandle::new("asr", Box::new(NoopGeneral));

        let first = ctx_handle.ctx.create_iu(sr_iu("hello", 0.9, 0.9, false), None);
        let out1 = stage.process_iu(&ctx_handle.ctx, Some(first)).unwrap().unwrap();
        assert_eq!(out1.payload.text(), Some("hello"));

        let second = ctx_handle.ctx.create_iu(sr_iu("hello world", 0.9, 0.9, false), None);
        let out2 = stage.process_iu(&ctx_handle.ctx, Some(second)).unwrap().unwrap();
        assert_eq!(out2.payload.text(), Some(" world"));
    }

    #[test]
    fn mismatched_hypothesis_revokes_previous_increment() {
        let mut stage = IncrementalizeAsr::new(0.5);
        let ctx_handle = ModuleHandle::new("asr", Box::new(NoopGeneral));

        let first = ctx_handle.ctx.create_iu(sr_iu("hello", 0.9, 0.9, false), None);
        let out1 = stage.process_iu(&ctx_handle.ctx, Some(first)).unwrap().unwrap();
        assert!(!out1.is_revoked());

        let second = ctx_handle.ctx.create_iu(sr_iu("goodbye", 0.9, 0.9, false), None);
        stage.process_iu(&ctx_handle.ctx, Some(second)).unwrap();
        assert!(out1.is_revoked());
    }

    #[test]
    fn final_hypothesis_commits_and_clears_history() {
        let mut stage = IncrementalizeAsr::new(0.5);
        let ctx_handle = ModuleHandle::new("asr", Box::new(NoopGeneral));

        let iu = ctx_handle.ctx.create_iu(sr_iu("done", 0.9, 0.9, true), None);
        let out = stage.process_iu(&ctx_handle.ctx, Some(iu)).unwrap().unwrap();
        assert!(out.is_committed());
        assert!(stage.last_ius.is_empty());
    }

    #[test]
    fn non_final_asr_result_is_gated_when_forward_after_final() {
        let mut stage = TextToDispatchableText::new(true);
        let ctx_handle = ModuleHandle::new("dispatcher-text", Box::new(NoopGeneral));
        let iu = ctx_handle
            .ctx
            .create_iu(sr_iu("partial", 0.9, 0.9, false), None);
        assert!(stage.process_iu(&ctx_handle.ctx, Some(iu)).unwrap().is_none());
    }

    #[test]
    fn final_asr_result_becomes_generated_text() {
        let mut stage = TextToDispatchableText::new(true);
        let ctx_handle = ModuleHandle::new("dispatcher-text", Box::new(NoopGeneral));
        let iu = ctx_handle.ctx.create_iu(sr_iu("final answer", 0.9, 0.9, true), None);
        let out = stage.process_iu(&ctx_handle.ctx, Some(iu)).unwrap().unwrap();
        assert_eq!(out.payload.text(), Some("final answer"));
    }

    struct NoopGeneral;
    impl Module for NoopGeneral {
        fn kind(&self) -> ModuleKind {
            ModuleKind::General
        }
        fn input_kinds(&self) -> &'static [IuKind] {
            &[IuKind::SpeechRecognition, IuKind::Text]
        }
        fn output_kind(&self) -> Option<IuKind> {
            Some(IuKind::SpeechRecognition)
        }
        fn class_tag(&self) -> &'static str {
            "test.NoopGeneral"
        }
        fn process_iu(&mut self, _ctx: &Arc<ModuleContext>, _input: Option<IuRef>) -> Result<Option<IuRef>> {
            Ok(None)
        }
    }
}
