//! Turnstile - In-process Rate Limiting
//!
//! This crate implements fixed-window, sliding-window and token-bucket rate
//! limiters over an injected in-memory store, a periodic cleanup task that
//! bounds their memory, and axum guards that wrap handlers with a named
//! policy chosen per route.

pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
