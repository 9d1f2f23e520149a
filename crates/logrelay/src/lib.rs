// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # logrelay
//!
//! Rotates registered log files and ships their new bytes, incrementally and
//! at-least-once, to a remote HTTPS collector.
//!
//! - [`registry`]: log inputs declared in descriptor files
//! - [`rotate`]: size/age rotation, forced rotation and timestamp cuts
//! - [`store`]: persistent per-log checkpoints
//! - [`shipper`]: bounded chunks, gzip'd JSON envelopes, offset advancement
//! - [`scheduler`]: cancelable rotate and ship triggers
//! - [`agent`]: the dispatcher tying them together

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod agent;
pub mod config;
pub mod identity;
pub mod licensing;
pub mod logger;
pub mod notify;
pub mod policy;
pub mod registry;
pub mod rotate;
pub mod scheduler;
pub mod shipper;
pub mod status;
pub mod store;
