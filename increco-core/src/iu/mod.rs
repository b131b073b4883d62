//! Incremental Units: the typed fragments of information modules exchange.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;

use crate::ids::ModuleId;
use crate::meta::{MetaMap, MetaValue};

/// Maximum depth kept in a `previous_iu`/`grounded_in` chain. The tenth
/// ancestor's own link is severed at construction time so the chain a
/// garbage collector can see is always finite, regardless of how long the
/// conversation has run.
const MAX_CHAIN_DEPTH: usize = 10;

/// Discriminant for an IU's payload kind, used for declared-input/output kind
/// checks without needing `dyn Any` downcasting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IuKind {
    Audio,
    Speech,
    DispatchedAudio,
    Text,
    GeneratedText,
    SpeechRecognition,
    DialogueAct,
    DispatchableAct,
    EndOfTurn,
}

impl IuKind {
    /// Mirrors the original source's class hierarchy (`SpeechIU(AudioIU)`,
    /// `GeneratedTextIU(TextIU)`, `DispatchableActIU(DialogueActIU)`, ...) so
    /// that a module declaring `input_kinds = [Audio]` also accepts `Speech`
    /// and `DispatchedAudio`, the way `isinstance(iu, AudioIU)` would.
    /// Reflexive: every kind is a subtype of itself.
    pub fn is_subtype_of(self, other: IuKind) -> bool {
        if self == other {
            return true;
        }
        matches!(
            (self, other),
            (IuKind::Speech, IuKind::Audio)
                | (IuKind::DispatchedAudio, IuKind::Audio)
                | (IuKind::GeneratedText, IuKind::Text)
                | (IuKind::SpeechRecognition, IuKind::Text)
                | (IuKind::DispatchableAct, IuKind::DialogueAct)
        )
    }
}

/// The common fields of every audio-carrying payload.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioPayload {
    pub raw_bytes: Vec<u8>,
    pub frame_rate: u32,
    pub n_frames: u32,
    pub sample_width: u16,
}

impl AudioPayload {
    pub fn silence(n_frames: u32, frame_rate: u32, sample_width: u16) -> Self {
        AudioPayload {
            raw_bytes: vec![0u8; n_frames as usize * sample_width as usize],
            frame_rate,
            n_frames,
            sample_width,
        }
    }
}

/// Typed IU content, one variant per IU kind from the data model.
#[derive(Debug, Clone, PartialEq)]
pub enum IuPayload {
    Audio(AudioPayload),
    Speech {
        audio: AudioPayload,
        dispatch: bool,
    },
    DispatchedAudio {
        audio: AudioPayload,
        completion: f32,
        is_dispatching: bool,
    },
    Text {
        text: String,
    },
    GeneratedText {
        text: String,
        dispatch: bool,
    },
    SpeechRecognition {
        predictions: Vec<String>,
        stability: f32,
        confidence: f32,
        final_: bool,
        text: String,
    },
    DialogueAct {
        act: String,
        concepts: std::collections::BTreeMap<String, String>,
        confidence: f32,
    },
    DispatchableAct {
        act: String,
        concepts: std::collections::BTreeMap<String, String>,
        confidence: f32,
        dispatch: bool,
    },
    EndOfTurn {
        probability: f32,
        is_speaking: bool,
    },
}

impl IuPayload {
    pub fn kind(&self) -> IuKind {
        match self {
            IuPayload::Audio(_) => IuKind::Audio,
            IuPayload::Speech { .. } => IuKind::Speech,
            IuPayload::DispatchedAudio { .. } => IuKind::DispatchedAudio,
            IuPayload::Text { .. } => IuKind::Text,
            IuPayload::GeneratedText { .. } => IuKind::GeneratedText,
            IuPayload::SpeechRecognition { .. } => IuKind::SpeechRecognition,
            IuPayload::DialogueAct { .. } => IuKind::DialogueAct,
            IuPayload::DispatchableAct { .. } => IuKind::DispatchableAct,
            IuPayload::EndOfTurn { .. } => IuKind::EndOfTurn,
        }
    }

    /// The `get_text()`-equivalent accessor: `SpeechRecognition` exposes its
    /// `text` field directly rather than forcing callers to match on the
    /// payload, since ASR segments are incrementalized (see
    /// `text::IncrementalizeAsr`) by diffing this field against previously
    /// emitted text.
    pub fn text(&self) -> Option<&str> {
        match self {
            IuPayload::Text { text } => Some(text),
            IuPayload::GeneratedText { text, .. } => Some(text),
            IuPayload::SpeechRecognition { text, .. } => Some(text),
            _ => None,
        }
    }
}

/// A single fragment of information produced by one module.
pub struct Iu {
    pub creator: ModuleId,
    pub creator_name: String,
    pub iuid: u64,
    previous_iu: Mutex<Option<Weak<Iu>>>,
    grounded_in: Mutex<Option<Weak<Iu>>>,
    pub created_at: Instant,
    pub payload: IuPayload,
    meta: Mutex<MetaMap>,
    committed: std::sync::atomic::AtomicBool,
    revoked: std::sync::atomic::AtomicBool,
    processed_by: Mutex<HashSet<ModuleId>>,
}

pub type IuRef = Arc<Iu>;

impl Iu {
    /// Constructs a new IU, truncating the `previous_iu` and `grounded_in`
    /// chains it inherits so neither exceeds [`MAX_CHAIN_DEPTH`]. Called
    /// exclusively through `ModuleContext::create_iu` so every IU's `creator`
    /// and `iuid` come from the one place that owns the per-module counter.
    pub(crate) fn new(
        creator: ModuleId,
        creator_name: String,
        iuid: u64,
        previous_iu: Option<&IuRef>,
        grounded_in: Option<&IuRef>,
        payload: IuPayload,
    ) -> IuRef {
        let inherited_meta = grounded_in
            .map(|g| g.meta.lock().clone())
            .unwrap_or_default();

        let iu = Arc::new(Iu {
            creator,
            creator_name,
            iuid,
            previous_iu: Mutex::new(previous_iu.map(Arc::downgrade)),
            grounded_in: Mutex::new(grounded_in.map(Arc::downgrade)),
            created_at: Instant::now(),
            payload,
            meta: Mutex::new(inherited_meta),
            committed: std::sync::atomic::AtomicBool::new(false),
            revoked: std::sync::atomic::AtomicBool::new(false),
            processed_by: Mutex::new(HashSet::new()),
        });

        Self::truncate_chain(previous_iu.cloned(), |iu| &iu.previous_iu);
        Self::truncate_chain(grounded_in.cloned(), |iu| &iu.grounded_in);

        iu
    }

    /// Walks the ancestor chain reachable through `field`, severing the tenth
    /// ancestor's own link (not `self`'s) once reached. Matches the source's
    /// exact semantics: only the tenth ancestor is severed, intermediate
    /// links are left untouched, and re-running this on an already-truncated
    /// chain is a no-op (the walk simply terminates earlier).
    fn truncate_chain(start: Option<IuRef>, field: impl Fn(&Iu) -> &Mutex<Option<Weak<Iu>>>) {
        let mut depth = 0usize;
        let mut current = start;
        while let Some(node) = current {
            if depth == MAX_CHAIN_DEPTH {
                *field(&node).lock() = None;
            }
            current = field(&node).lock().as_ref().and_then(Weak::upgrade);
            depth += 1;
        }
    }

    pub fn previous_iu(&self) -> Option<IuRef> {
        self.previous_iu.lock().as_ref().and_then(Weak::upgrade)
    }

    pub fn grounded_in(&self) -> Option<IuRef> {
        self.grounded_in.lock().as_ref().and_then(Weak::upgrade)
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    pub fn meta(&self) -> MetaMap {
        self.meta.lock().clone()
    }

    pub fn meta_get(&self, key: &str) -> Option<MetaValue> {
        self.meta.lock().get(key).cloned()
    }

    pub fn meta_set(&self, key: impl Into<String>, value: impl Into<MetaValue>) {
        self.meta.lock().insert(key.into(), value.into());
    }

    pub fn is_committed(&self) -> bool {
        self.committed.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn commit(&self) {
        self.committed
            .store(true, std::sync::atomic::Ordering::Release);
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn revoke(&self) {
        self.revoked
            .store(true, std::sync::atomic::Ordering::Release);
    }

    pub fn set_processed(&self, module: ModuleId) {
        self.processed_by.lock().insert(module);
    }

    pub fn is_processed_by(&self, module: ModuleId) -> bool {
        self.processed_by.lock().contains(&module)
    }

    /// The creator-or-grounded-in-creator suffix used by the text/dialogue-act
    /// recorders' first column.
    pub fn creator_of_grounded_in(&self) -> String {
        match self.grounded_in() {
            Some(g) => g.creator_name.clone(),
            None => self.creator_name.clone(),
        }
    }
}

impl std::fmt::Debug for Iu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Iu")
            .field("creator", &self.creator)
            .field("iuid", &self.iuid)
            .field("kind", &self.payload.kind())
            .field("committed", &self.is_committed())
            .field("revoked", &self.is_revoked())
            .finish()
    }
}
