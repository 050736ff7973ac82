//! gator: a command-line RSS aggregator.
//!
//! Feeds registered by users are polled one at a time on a fixed cadence.
//! Each poll takes the feed that has waited longest, fetches its RSS
//! document, normalizes publication dates and stores posts whose link has
//! not been seen before.

pub mod commands;
pub mod config;
pub mod feed;
pub mod storage;
