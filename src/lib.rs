//! Real-time synchronization and impression deduplication engine for feature flag SDKs.
//!
//! # Overview
//!
//! A feature flag SDK evaluates flags locally against a replica of the server-side definitions.
//! This crate keeps that replica fresh and deduplicates the impressions produced by evaluations.
//!
//! - [`sync::SyncManager`] combines a push stream with periodic polling. It streams whenever it
//!   can and falls back to polling when the stream is down, paused, disabled, or has no
//!   publishers.
//! - Push notifications are parsed into typed [`notification::Notification`]s and routed by
//!   [`notification::NotificationDispatcher`]: flag changes go to a flag updates worker,
//!   membership changes go to the [`membership::UpdateStrategyExecutor`] of every registered user
//!   key addressed by the notification.
//! - [`membership::UpdateStrategyExecutor`] applies membership changes differentially (bitmaps,
//!   hashed key lists, direct removal) and refetches only when needed, after a deterministic
//!   per-key delay (see [`jitter`]).
//! - [`impressions::ImpressionsObserver`] remembers when each impression was last seen, in an LRU
//!   cache backed by SQLite.
//!
//! Networking and storage of flags and memberships are left to the embedding SDK, through the
//! [`sync::FlagsSynchronizer`], [`membership::MembershipSynchronizer`] and
//! [`sync::StreamTransport`] traits.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Background components never surface errors to the evaluation path: malformed notifications
//! degrade to a full refetch, failed synchronizations are retried, and storage failures degrade
//! deduplication to memory only. All of these are logged.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages, with
//! the `flagsync` target. Consider integrating a `log`-compatible logger implementation for better
//! visibility into synchronization.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

pub mod codec;
mod config;
mod error;
pub mod executor;
pub mod impressions;
pub mod jitter;
pub mod membership;
pub mod notification;
pub mod sync;

pub use config::{ObserverCacheConfig, SyncConfig};
pub use error::{Error, Result};
