//! Contracts for external collaborators that sit outside this crate's scope:
//! concrete ASR, TTS, and translation backends. Only the narrow interface
//! each one is accessed through lives here — no recognizer, synthesizer, or
//! translation model ships in this crate.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::error::Result;

/// One incremental ASR result. `final_` mirrors `SpeechRecognition::final_`
/// on the IU this becomes: once set, the producing module commits the IU.
#[derive(Debug, Clone, PartialEq)]
pub struct AsrHypothesis {
    pub predictions: Vec<String>,
    pub text: String,
    pub stability: f32,
    pub confidence: f32,
    pub final_: bool,
}

/// `ASR: accepts a lazy sequence of audio chunks, yields a sequence of
/// (predictions, best_text, stability, confidence, final) tuples` (§6).
/// Concrete recognizers push audio incrementally via `push_chunk` and get
/// back whatever hypotheses that chunk produced, if any — a recognizer is
/// free to buffer internally and yield nothing until it has enough audio.
pub trait AsrBackend: Send {
    fn push_chunk(&mut self, raw_bytes: &[u8], frame_rate: u32, sample_width: u16)
        -> Result<Vec<AsrHypothesis>>;

    fn reset(&mut self) {}
}

/// `TTS: synthesize(text) -> pcm_bytes at a declared sample rate and width`
/// (§6).
pub trait TtsBackend: Send {
    fn sample_rate(&self) -> u32;
    fn sample_width(&self) -> u16;
    fn synthesize(&mut self, text: &str) -> Result<Vec<u8>>;
}

/// `Translator: translate(text, src, dst) -> text` (§6).
pub trait Translator: Send {
    fn translate(&mut self, text: &str, src: &str, dst: &str) -> Result<String>;
}

/// Content-addressed cache in front of a [`TtsBackend`], keyed by a digest of
/// `(text, voice, language, codec, rate, speaking_rate)` so repeated
/// synthesis requests for the same utterance never re-run the backend.
pub struct CachingTts<T: TtsBackend> {
    inner: T,
    voice: String,
    language: String,
    codec: String,
    speaking_rate: u32,
    cache: BTreeMap<String, Vec<u8>>,
}

impl<T: TtsBackend> CachingTts<T> {
    pub fn new(inner: T, voice: impl Into<String>, language: impl Into<String>, codec: impl Into<String>, speaking_rate: u32) -> Self {
        CachingTts {
            inner,
            voice: voice.into(),
            language: language.into(),
            codec: codec.into(),
            speaking_rate,
            cache: BTreeMap::new(),
        }
    }

    fn key(&self, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.update(self.voice.as_bytes());
        hasher.update(self.language.as_bytes());
        hasher.update(self.codec.as_bytes());
        hasher.update(self.inner.sample_rate().to_le_bytes());
        hasher.update(self.speaking_rate.to_le_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn synthesize(&mut self, text: &str) -> Result<Vec<u8>> {
        let key = self.key(text);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached.clone());
        }
        let bytes = self.inner.synthesize(text)?;
        self.cache.insert(key, bytes.clone());
        Ok(bytes)
    }

    pub fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }

    pub fn sample_width(&self) -> u16 {
        self.inner.sample_width()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingTts {
        calls: Arc<AtomicUsize>,
    }

    impl TtsBackend for CountingTts {
        fn sample_rate(&self) -> u32 {
            16_000
        }
        fn sample_width(&self) -> u16 {
            2
        }
        fn synthesize(&mut self, text: &str) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(text.as_bytes().to_vec())
        }
    }

    #[test]
    fn repeated_synthesis_hits_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut tts = CachingTts::new(
            CountingTts { calls: calls.clone() },
            "default",
            "en-US",
            "pcm16",
            1,
        );
        tts.synthesize("hello").unwrap();
        tts.synthesize("hello").unwrap();
        tts.synthesize("world").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(tts.cache_len(), 2);
    }

    #[test]
    fn different_voice_misses_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut a = CachingTts::new(
            CountingTts { calls: calls.clone() },
            "voice-a",
            "en-US",
            "pcm16",
            1,
        );
        let mut b = CachingTts::new(
            CountingTts { calls: calls.clone() },
            "voice-b",
            "en-US",
            "pcm16",
            1,
        );
        a.synthesize("hi").unwrap();
        b.synthesize("hi").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
