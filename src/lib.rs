//! Vidra - Telegram bot that downloads videos and audio via yt-dlp
//!
//! This library provides all the core functionality for the Vidra bot,
//! including format probing, the per-chat job state machine, the
//! download/convert/upload pipeline, and Telegram bot integration.
//!
//! # Module Structure
//!
//! - `core`: Core utilities, configuration, errors, and logging
//! - `download`: Probe, job registry, pipeline, and progress reporting
//! - `telegram`: Telegram bot integration and handlers

#![allow(clippy::too_many_arguments)]

pub mod cli;
pub mod core;
pub mod download;
pub mod telegram;

// Re-export commonly used types for convenience
pub use core::{config, AppError, AppResult};
pub use download::{probe_formats, FormatOption, Job, JobEvent, JobRegistry, JobState, ProbeResult};
pub use telegram::{create_bot, schema, setup_bot_commands, HandlerDeps};
