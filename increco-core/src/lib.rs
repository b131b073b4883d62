//! # increco-core
//!
//! Incremental, real-time dialogue-processing dataflow runtime: autonomous
//! modules exchange typed Incremental Units (IUs) over per-subscriber queues
//! while a conversation is underway.
//!
//! ## Architecture
//!
//! ```text
//! TurnTakingDm → NLG(DialogueManagerAdapter) → Tts → AudioDispatcher
//!                                                          │
//!                                                   NetworkDegrader
//!                                                          │
//!                                    ┌──────────┬──────────┼───────────┐
//!                                Asr/text     Speaker   Recorder   SimulatedEot
//! ```
//!
//! Two such pipelines, one per interlocutor, compose end-to-end via their
//! `TurnTakingDm`'s `DialogueAct` and `EndOfTurn` exchange to simulate a full
//! spoken dialogue. Modules are arena-like nodes (`Arc<ModuleHandle>`) joined
//! by jointly-owned queues; IUs carry only weak back-references to their
//! creator and to the IU they are grounded in, so the natural dual-agent
//! cycle (A → B → A) never becomes an ownership cycle.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod backend;
pub mod debug;
pub mod dispatch;
pub mod dm;
pub mod eot;
pub mod error;
pub mod graph;
pub mod ids;
pub mod iu;
#[cfg(feature = "audio-capture")]
pub mod microphone;
pub mod meta;
pub mod module;
pub mod network;
pub mod queue;
pub mod recorder;
pub mod text;
pub mod turntaking;

pub use error::{Result, RuntimeError};
pub use ids::ModuleId;
pub use iu::{AudioPayload, Iu, IuKind, IuPayload, IuRef};
pub use meta::{MetaMap, MetaValue};
pub use module::{Module, ModuleContext, ModuleHandle, ModuleKind};
