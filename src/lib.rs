//! Agent Lee: voice orchestration core for a voice-first personal agent.
//!
//! One turn controller owns the conversation:
//! speech input → guards → model (streamed) → action parsing → speech output → effects
//!
//! # Architecture
//!
//! - **Turn controller** ([`pipeline`]): the single writer of [`AgentState`];
//!   runs one turn at a time and services interrupts mid-turn
//! - **Speech input** ([`speech::input`]): continuous listening, silence
//!   finalization, wake phrase, restart and backoff
//! - **Speech output** ([`speech::output`]): text cleaning, chunking,
//!   voice selection, cancellation and the keep-alive heartbeat
//! - **Actions** ([`actions`]): `[ACTION: name, {json}]` tags parsed out of
//!   replies and mapped onto ordered UI effects
//! - **Model** ([`model`]): streamed replies, image generation, visual
//!   classification and memory retrieval over HTTP
//!
//! UI collaborators observe [`RuntimeEvent`]s and drive the controller
//! through a [`ControllerHandle`].

pub mod actions;
pub mod config;
pub mod contacts;
pub mod error;
pub mod model;
pub mod notes;
pub mod pipeline;
pub mod rate_limit;
pub mod runtime;
pub mod security;
pub mod speech;
pub mod state;
pub mod transcript;
pub mod visual;

pub use config::AssistantConfig;
pub use error::{AssistantError, Result};
pub use pipeline::{Collaborators, ControllerHandle, SubmitOutcome, TurnController};
pub use runtime::RuntimeEvent;
pub use state::{AgentState, Feature, Speaker};
