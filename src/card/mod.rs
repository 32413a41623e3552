//! Card document model and filesystem-backed store.

pub mod document;
pub mod store;

pub use document::{AcceptanceItem, CardDocument, CardDraft, KNOWN_FIELDS};
pub use store::{CardSnapshot, CardStore};
