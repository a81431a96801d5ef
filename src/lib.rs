//! leadflow: rule-driven contact routing and lead lifecycle scoring.
//!
//! Contacts and owners live in the host CRM; this crate decides who owns a
//! lead, scores it, and moves it through its lifecycle, keeping an audit
//! trail of every decision.

pub mod audit;
pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod routing;
pub mod rules;
pub mod settings;

pub use engine::Leadflow;
pub use error::{Error, Result};
