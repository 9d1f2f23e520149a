// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Point-in-time view of every registered input and its checkpoint.

use chrono::{DateTime, TimeZone};
use serde::Serialize;
use tracing::warn;

use crate::config::Config;
use crate::registry::LogInput;
use crate::scheduler::next_daily_fire;
use crate::store::{Checkpoint, CheckpointStore};

pub const STORE_OK: &str = "ok";
pub const STORE_UNKNOWN: &str = "unknown";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InputStatus {
    pub package: String,
    pub log_id: String,
    pub path: String,
    pub exists: bool,
    pub size: u64,
    pub dev: u64,
    pub inode: u64,
    pub last_offset: u64,
    /// Bytes on disk not shipped yet, never negative.
    pub backlog: u64,
    pub ship_enabled: bool,
    pub last_sent_at: i64,
    pub last_attempt_at: i64,
    pub last_status_code: u16,
    pub last_error: String,
    pub last_bytes_sent: u64,
    pub last_lines_sent: u64,
    pub last_duration_ms: u64,
    pub last_rotate_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub inputs: usize,
    pub backlog: u64,
    pub last_sent_at: i64,
    pub last_attempt_at: i64,
    pub last_rotate_at: i64,
}

/// Point-in-time view of the agent, printed by `logrelay-agent status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub generated_at: i64,
    pub enabled: bool,
    pub dry_run: bool,
    pub endpoint: Option<String>,
    pub store: &'static str,
    pub ship_interval_secs: u64,
    pub rotate_schedule: String,
    /// Unix time of the next daily rotation, when rotation is daily.
    pub next_rotate_at: Option<i64>,
    pub first_error: Option<String>,
    pub totals: Totals,
    pub inputs: Vec<InputStatus>,
}

/// Builds the snapshot. `store` is `None` when the checkpoint database could
/// not be opened, in which case the per-input checkpoint fields stay zero and
/// the store is reported as unknown.
pub fn build<Tz: TimeZone>(
    config: &Config,
    inputs: &[LogInput],
    store: Option<&CheckpointStore>,
    now: &DateTime<Tz>,
) -> Status {
    let mut store_status = if store.is_some() {
        STORE_OK
    } else {
        STORE_UNKNOWN
    };
    let mut totals = Totals {
        inputs: inputs.len(),
        ..Totals::default()
    };
    let mut first_error = None;
    let mut entries = Vec::with_capacity(inputs.len());

    for input in inputs {
        let checkpoint = match store.map(|s| s.get(&input.package, &input.log_id, &input.path)) {
            Some(Ok(found)) => found,
            Some(Err(e)) => {
                warn!("Failed to read checkpoint of {}: {e}", input.path.display());
                store_status = STORE_UNKNOWN;
                None
            }
            None => None,
        }
        .unwrap_or_else(|| Checkpoint::new(&input.package, &input.log_id, &input.path));

        let size = std::fs::metadata(&input.path).map(|m| m.len()).ok();
        let entry = InputStatus {
            package: input.package.clone(),
            log_id: input.log_id.clone(),
            path: input.path.to_string_lossy().into_owned(),
            exists: size.is_some(),
            size: size.unwrap_or(0),
            dev: checkpoint.identity.dev,
            inode: checkpoint.identity.inode,
            last_offset: checkpoint.last_offset,
            backlog: size.unwrap_or(0).saturating_sub(checkpoint.last_offset),
            ship_enabled: input.ship_enabled(),
            last_sent_at: checkpoint.last_sent_at,
            last_attempt_at: checkpoint.last_attempt_at,
            last_status_code: checkpoint.last_status_code,
            last_error: checkpoint.last_error,
            last_bytes_sent: checkpoint.last_bytes_sent,
            last_lines_sent: checkpoint.last_lines_sent,
            last_duration_ms: checkpoint.last_duration_ms,
            last_rotate_at: checkpoint.last_rotate_at,
        };

        totals.backlog += entry.backlog;
        totals.last_sent_at = totals.last_sent_at.max(entry.last_sent_at);
        totals.last_attempt_at = totals.last_attempt_at.max(entry.last_attempt_at);
        totals.last_rotate_at = totals.last_rotate_at.max(entry.last_rotate_at);
        if first_error.is_none() && !entry.last_error.is_empty() {
            first_error = Some(format!("{}/{}: {}", entry.package, entry.log_id, entry.last_error));
        }
        entries.push(entry);
    }

    let (rotate_schedule, next_rotate_at) = match config.rotate_schedule() {
        Ok(schedule) => {
            let next = config
                .daily_rotate_at()
                .ok()
                .flatten()
                .map(|at| next_daily_fire(now, at).timestamp());
            (schedule.to_string(), next)
        }
        Err(e) => (e.to_string(), None),
    };

    Status {
        generated_at: now.timestamp(),
        enabled: config.enabled,
        dry_run: config.dry_run,
        endpoint: config.endpoint.clone(),
        store: store_status,
        ship_interval_secs: config.ship_interval().as_secs(),
        rotate_schedule,
        next_rotate_at,
        first_error,
        totals,
        inputs: entries,
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_backlog_and_totals() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("app.log");
        std::fs::write(&log, "0123456789").unwrap();
        let store = CheckpointStore::open(tmp.path().join("state.db")).unwrap();

        let mut checkpoint = Checkpoint::new("web", "app", &log);
        checkpoint.last_offset = 4;
        checkpoint.last_sent_at = 100;
        checkpoint.last_error = "status 500: boom".to_string();
        store.save(&checkpoint).unwrap();

        let inputs = vec![
            LogInput::new("web", "app", &log),
            LogInput::new("web", "gone", tmp.path().join("gone.log")),
        ];
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let status = build(&Config::default(), &inputs, Some(&store), &now);

        assert_eq!(status.store, STORE_OK);
        assert_eq!(status.inputs[0].size, 10);
        assert_eq!(status.inputs[0].backlog, 6);
        assert!(!status.inputs[1].exists);
        assert_eq!(status.totals.inputs, 2);
        assert_eq!(status.totals.backlog, 6);
        assert_eq!(status.totals.last_sent_at, 100);
        assert_eq!(status.first_error.as_deref(), Some("web/app: status 500: boom"));
        assert_eq!(status.ship_interval_secs, 3600);
        assert_eq!(status.next_rotate_at, None);
    }

    #[test]
    fn test_backlog_never_negative() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("app.log");
        std::fs::write(&log, "abc").unwrap();
        let store = CheckpointStore::open(tmp.path().join("state.db")).unwrap();
        let mut checkpoint = Checkpoint::new("p", "l", &log);
        checkpoint.last_offset = 50;
        store.save(&checkpoint).unwrap();

        let status = build(
            &Config::default(),
            &[LogInput::new("p", "l", &log)],
            Some(&store),
            &Utc::now(),
        );
        assert_eq!(status.inputs[0].backlog, 0);
    }

    #[test]
    fn test_without_store_and_daily_rotation() {
        let config = Config {
            rotate_at: Some("04:00".to_string()),
            ..Config::default()
        };
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let status = build(&config, &[], None, &now);
        assert_eq!(status.store, STORE_UNKNOWN);
        assert_eq!(status.rotate_schedule, "daily at 04:00");
        assert_eq!(
            status.next_rotate_at,
            Some(Utc.with_ymd_and_hms(2024, 5, 2, 4, 0, 0).unwrap().timestamp())
        );
    }
}
