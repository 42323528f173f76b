//! # Audio Pipeline
//!
//! Everything between a binary WebSocket frame and the recognizer.
//!
//! ## Key Components:
//! - **processor**: audio formats, µ-law/linear16 decoding and silence detection
//! - **segmenter**: splits the connection's audio into bounded recognition windows
//! - **session**: per-connection owner of the segmenter and the control envelope
//!
//! ## Audio Format:
//! Encoding, sample rate and channel count are connection-wide configuration
//! (`[audio]` in config.toml). Frames carry raw samples with no header.

pub mod processor;
pub mod segmenter;
pub mod session;
