//! File-backed recorder modules (§4.10, §6): `Consuming` modules with a file
//! handle opened in `setup()` and closed in `shutdown()`. Grounded in the
//! original source's `AudioRecorderModule`, `TextRecorderModule`, and
//! `DialogueActRecorderModule`.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::error::{Result, RuntimeError};
use crate::iu::{IuKind, IuPayload, IuRef};
use crate::module::{Module, ModuleContext, ModuleKind};

/// Mono PCM WAV recorder: one contiguous stream per recording (§6).
pub struct AudioRecorder {
    path: PathBuf,
    rate: u32,
    sample_width: u16,
    writer: Option<hound::WavWriter<BufWriter<File>>>,
}

impl AudioRecorder {
    pub fn new(path: impl Into<PathBuf>, rate: u32, sample_width: u16) -> Self {
        AudioRecorder {
            path: path.into(),
            rate,
            sample_width,
            writer: None,
        }
    }
}

impl Module for AudioRecorder {
    fn kind(&self) -> ModuleKind {
        ModuleKind::General
    }
    fn input_kinds(&self) -> &'static [IuKind] {
        &[IuKind::Audio]
    }
    fn output_kind(&self) -> Option<IuKind> {
        None
    }
    fn class_tag(&self) -> &'static str {
        "recorder.AudioRecorder"
    }

    fn setup(&mut self, _ctx: &Arc<ModuleContext>) -> Result<()> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.rate,
            bits_per_sample: self.sample_width * 8,
            sample_format: hound::SampleFormat::Int,
        };
        self.writer = Some(hound::WavWriter::create(&self.path, spec).map_err(|e| RuntimeError::Other(e.into()))?);
        Ok(())
    }

    fn shutdown(&mut self, _ctx: &Arc<ModuleContext>) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.finalize().map_err(|e| RuntimeError::Other(e.into()))?;
        }
        Ok(())
    }

    fn process_iu(&mut self, _ctx: &Arc<ModuleContext>, input: Option<IuRef>) -> Result<Option<IuRef>> {
        let input = input.expect("general module always receives input");
        let audio = match &input.payload {
            IuPayload::Audio(audio) => audio,
            IuPayload::Speech { audio, .. } => audio,
            IuPayload::DispatchedAudio { audio, .. } => audio,
            _ => return Ok(None),
        };
        if let Some(writer) = self.writer.as_mut() {
            for chunk in audio.raw_bytes.chunks_exact(self.sample_width as usize) {
                let sample = match self.sample_width {
                    2 => i16::from_le_bytes([chunk[0], chunk[1]]) as i32,
                    1 => chunk[0] as i32 - 128,
                    _ => i32::from_le_bytes([chunk[0], chunk[1], chunk.get(2).copied().unwrap_or(0), chunk.get(3).copied().unwrap_or(0)]),
                };
                writer.write_sample(sample).map_err(|e| RuntimeError::Other(e.into()))?;
            }
        }
        Ok(None)
    }
}

/// Tab-separated text recorder: `creator_of_grounded_in TAB created_at TAB
/// text [TAB dispatch] [TAB predictions TAB stability TAB confidence TAB
/// final]` (§6).
pub struct TextRecorder {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl TextRecorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        TextRecorder {
            path: path.into(),
            writer: None,
        }
    }
}

impl Module for TextRecorder {
    fn kind(&self) -> ModuleKind {
        ModuleKind::General
    }
    fn input_kinds(&self) -> &'static [IuKind] {
        &[IuKind::Text, IuKind::GeneratedText, IuKind::SpeechRecognition]
    }
    fn output_kind(&self) -> Option<IuKind> {
        None
    }
    fn class_tag(&self) -> &'static str {
        "recorder.TextRecorder"
    }

    fn setup(&mut self, _ctx: &Arc<ModuleContext>) -> Result<()> {
        self.writer = Some(BufWriter::new(File::create(&self.path)?));
        Ok(())
    }

    fn shutdown(&mut self, _ctx: &Arc<ModuleContext>) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }

    fn process_iu(&mut self, _ctx: &Arc<ModuleContext>, input: Option<IuRef>) -> Result<Option<IuRef>> {
        let input = input.expect("general module always receives input");
        let text = match input.payload.text() {
            Some(t) => t,
            None => return Ok(None),
        };

        let mut line = format!(
            "{}\t{}\t{}",
            input.creator_of_grounded_in(),
            input.created_at.elapsed().as_secs_f64(),
            text
        );
        if let IuPayload::GeneratedText { dispatch, .. } = &input.payload {
            line.push_str(&format!("\t{dispatch}"));
        }
        if let IuPayload::SpeechRecognition {
            predictions,
            stability,
            confidence,
            final_,
            ..
        } = &input.payload
        {
            line.push_str(&format!(
                "\t{}\t{stability}\t{confidence}\t{final_}",
                predictions.join(",")
            ));
        }
        line.push('\n');

        if let Some(writer) = self.writer.as_mut() {
            writer.write_all(line.as_bytes())?;
        }
        Ok(None)
    }
}

/// Tab-separated dialogue-act recorder: `"dialogue_act" TAB creator_suffix
/// TAB elapsed_ms TAB "-1" TAB act[":"concept1,concept2,...] [TAB dispatch]`
/// (§6). `recording_start` is reset downward if an out-of-order early IU
/// arrives, so elapsed times never go negative, matching the original
/// source's bookkeeping.
pub struct DialogueActRecorder {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    recording_start: Option<Instant>,
}

impl DialogueActRecorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DialogueActRecorder {
            path: path.into(),
            writer: None,
            recording_start: None,
        }
    }
}

impl Module for DialogueActRecorder {
    fn kind(&self) -> ModuleKind {
        ModuleKind::General
    }
    fn input_kinds(&self) -> &'static [IuKind] {
        &[IuKind::DialogueAct, IuKind::DispatchableAct]
    }
    fn output_kind(&self) -> Option<IuKind> {
        None
    }
    fn class_tag(&self) -> &'static str {
        "recorder.DialogueActRecorder"
    }

    fn setup(&mut self, _ctx: &Arc<ModuleContext>) -> Result<()> {
        self.writer = Some(BufWriter::new(File::create(&self.path)?));
        Ok(())
    }

    fn prepare_run(&mut self, _ctx: &Arc<ModuleContext>) -> Result<()> {
        self.recording_start = Some(Instant::now());
        Ok(())
    }

    fn shutdown(&mut self, _ctx: &Arc<ModuleContext>) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }

    fn process_iu(&mut self, _ctx: &Arc<ModuleContext>, input: Option<IuRef>) -> Result<Option<IuRef>> {
        let input = input.expect("general module always receives input");
        let (act, concepts, dispatch) = match &input.payload {
            IuPayload::DialogueAct { act, concepts, .. } => (act.clone(), concepts.clone(), None),
            IuPayload::DispatchableAct {
                act,
                concepts,
                dispatch,
                ..
            } => (act.clone(), concepts.clone(), Some(*dispatch)),
            _ => return Ok(None),
        };

        let start = *self
            .recording_start
            .get_or_insert_with(|| input.created_at);
        if input.created_at < start {
            self.recording_start = Some(input.created_at);
        }
        let start = self.recording_start.unwrap();
        let elapsed_ms = input.created_at.saturating_duration_since(start).as_millis();

        let act_field = if concepts.is_empty() {
            act
        } else {
            let keys: Vec<_> = concepts.keys().cloned().collect();
            format!("{act}:{}", keys.join(","))
        };

        let mut line = format!("dialogue_act\t{}\t{elapsed_ms}\t-1\t{act_field}", input.creator);
        if let Some(dispatch) = dispatch {
            line.push_str(&format!("\t{dispatch}"));
        }
        line.push('\n');

        if let Some(writer) = self.writer.as_mut() {
            writer.write_all(line.as_bytes())?;
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleHandle;
    use std::collections::BTreeMap;

    fn tmp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("increco-test-{name}-{}", std::process::id()))
    }

    #[test]
    fn text_recorder_writes_tab_separated_line() {
        let path = tmp_path("text");
        let mut recorder = TextRecorder::new(&path);
        let handle = ModuleHandle::new("rec", Box::new(TextRecorder::new(&path)));
        recorder.setup(&handle.ctx).unwrap();
        let iu = handle.ctx.create_iu(
            IuPayload::GeneratedText {
                text: "hello".to_string(),
                dispatch: true,
            },
            None,
        );
        recorder.process_iu(&handle.ctx, Some(iu)).unwrap();
        recorder.shutdown(&handle.ctx).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("hello"));
        assert!(contents.ends_with("true\n"));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn dialogue_act_recorder_formats_concepts_and_dispatch() {
        let path = tmp_path("da");
        let mut recorder = DialogueActRecorder::new(&path);
        let handle = ModuleHandle::new("rec", Box::new(DialogueActRecorder::new(&path)));
        recorder.setup(&handle.ctx).unwrap();
        recorder.prepare_run(&handle.ctx).unwrap();

        let mut concepts = BTreeMap::new();
        concepts.insert("food".to_string(), "pizza".to_string());
        let iu = handle.ctx.create_iu(
            IuPayload::DispatchableAct {
                act: "provide_info".to_string(),
                concepts,
                confidence: 1.0,
                dispatch: true,
            },
            None,
        );
        recorder.process_iu(&handle.ctx, Some(iu)).unwrap();
        recorder.shutdown(&handle.ctx).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("dialogue_act\t"));
        assert!(contents.contains("provide_info:food"));
        assert!(contents.ends_with("true\n"));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn dialogue_act_recorder_resets_start_down_for_out_of_order_iu() {
        let path = tmp_path("da-ooo");
        let mut recorder = DialogueActRecorder::new(&path);
        let handle = ModuleHandle::new("rec", Box::new(DialogueActRecorder::new(&path)));
        recorder.setup(&handle.ctx).unwrap();
        recorder.recording_start = Some(Instant::now());
        std::thread::sleep(std::time::Duration::from_millis(5));

        let iu = handle.ctx.create_iu(
            IuPayload::DialogueAct {
                act: "greeting".to_string(),
                concepts: BTreeMap::new(),
                confidence: 1.0,
            },
            None,
        );
        // Force the IU to look earlier than recording_start.
        recorder.recording_start = Some(Instant::now());
        recorder.process_iu(&handle.ctx, Some(iu)).unwrap();
        recorder.shutdown(&handle.ctx).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("\t0\t-1\tgreeting"));
        std::fs::remove_file(&path).ok();
    }
}
