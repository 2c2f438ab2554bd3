//! The rule engine's data model and supporting passes (SPEC_FULL §3, §4.1-§4.3):
//! atoms and rules (`atom`, `rule`), the matcher (`matcher`), action shapes
//! (`action`), hit bookkeeping (`hit`), and the directory loader (`loader`).
//! Orchestrating these against a live flow is [`crate::engine`]'s job.

pub mod action;
pub mod atom;
pub mod hit;
pub mod loader;
pub mod matcher;
pub mod rule;
