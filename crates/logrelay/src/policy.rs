// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::config::DefaultPolicy;
use crate::registry::InputPolicy;

/// Effective rotation policy of one input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotatePolicy {
    /// Size threshold in MiB, 0 disables the size check.
    pub max_size_mb: u64,
    /// Number of generations kept. Rotation needs at least one.
    pub keep: u32,
    /// Gzip generations 2 and above.
    pub compress: bool,
    /// Age threshold in days, 0 disables the age check.
    pub max_age_days: u64,
}

impl RotatePolicy {
    /// Merges the global defaults with an input's overrides. An override only
    /// applies when it is non-zero or set.
    #[must_use]
    pub fn resolve(defaults: &DefaultPolicy, overrides: &InputPolicy) -> Self {
        let mut policy = Self {
            max_size_mb: defaults.max_size_mb,
            keep: defaults.keep,
            compress: defaults.compress.unwrap_or(true),
            max_age_days: defaults.max_age_days,
        };
        if overrides.max_size_mb > 0 {
            policy.max_size_mb = overrides.max_size_mb;
        }
        if overrides.keep > 0 {
            policy.keep = overrides.keep;
        }
        if let Some(compress) = overrides.compress {
            policy.compress = compress;
        }
        if overrides.max_age_days > 0 {
            policy.max_age_days = overrides.max_age_days;
        }
        policy
    }

    #[must_use]
    pub fn max_size_bytes(&self) -> Option<u64> {
        (self.max_size_mb > 0).then(|| self.max_size_mb.saturating_mul(1024 * 1024))
    }
}
