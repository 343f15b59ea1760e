#![forbid(unsafe_code)]

//! Library crate behind the vidgrab server binary.
//!
//! The interesting logic lives here so it can be unit tested without a
//! running HTTP server: the format-selection policy table, the yt-dlp
//! invoker with its on-disk result verification, and the error translator
//! that turns raw engine output into user-facing messages.

pub mod config;
pub mod downloader;
pub mod policy;
pub mod translate;
