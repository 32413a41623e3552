//! deckhand: run coordination for AI agents working a markdown kanban
//! board.
//!
//! The crate is organized around four seams:
//! - [`card`] parses and persists card files losslessly, with optimistic
//!   concurrency on save.
//! - [`scheduler`] admits, dispatches, retries and cancels runs from a
//!   single-owner actor.
//! - [`executor`] is the pluggable run backend: a supervised agent CLI
//!   subprocess in production, an in-process simulator in tests.
//! - [`lifecycle`] mirrors every transition into card frontmatter, History
//!   entries, and crash-recoverable lock records.

pub mod board;
pub mod card;
pub mod cmd;
pub mod config;
pub mod errors;
pub mod executor;
pub mod lifecycle;
pub mod run;
pub mod scheduler;
