//! Autoreply: mailbox auto-replier core.

pub mod config;
pub mod error;
pub mod gateway;
pub mod pipeline;
pub mod store;
pub mod templates;
