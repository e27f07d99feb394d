//! Persistence for projects, messages, fragments, runs, and the step log.
//!
//! | Table            | Written by                                         |
//! |------------------|----------------------------------------------------|
//! | `projects`       | `sandsmith run`, API callers                       |
//! | `messages`       | USER messages on intake, one terminal per run      |
//! | `fragments`      | child of a RESULT message, never updated           |
//! | `workflow_runs`  | `WorkflowRunner` status bookkeeping                |
//! | `workflow_steps` | `StepRunner`, one row per completed durable step   |
//!
//! Messages and fragments are append-only.

pub mod db;
pub mod models;

pub use db::{DbHandle, StoreDb};
pub use models::*;
