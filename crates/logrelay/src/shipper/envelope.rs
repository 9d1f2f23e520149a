// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire format of one shipment: a JSON envelope, gzip-compressed.

use std::io::{self, Write};

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

/// How a chunk is carried in the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShipFormat {
    /// One entry per `\n`-terminated line.
    Lines,
    /// The chunk as a single string.
    Raw,
}

impl ShipFormat {
    /// `""` and `"lines"` select [`ShipFormat::Lines`], `"raw"` selects
    /// [`ShipFormat::Raw`]. Matching ignores case.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "lines" => Some(Self::Lines),
            "raw" => Some(Self::Raw),
            _ => None,
        }
    }
}

/// The JSON document posted for every shipped chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub device_id: String,
    pub hostname: String,
    pub package: String,
    pub log_id: String,
    pub path: String,
    pub dev: u64,
    pub inode: u64,
    pub offset_start: u64,
    pub offset_end: u64,
    pub sent_at: i64,
    pub line_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lines: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_start: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_end: Option<i64>,
}

/// Splits a chunk on `\n`, dropping the empty element after a trailing newline.
#[must_use]
pub fn split_lines(text: &str) -> Vec<String> {
    let mut lines: Vec<String> = text.split('\n').map(str::to_string).collect();
    if lines.last().is_some_and(String::is_empty) {
        lines.pop();
    }
    lines
}

impl Envelope {
    /// Fills the payload fields from `text` according to `format`.
    pub fn set_payload(&mut self, text: &str, format: ShipFormat) {
        match format {
            ShipFormat::Lines => {
                let lines = split_lines(text);
                self.line_count = lines.len() as u64;
                self.lines = Some(lines);
                self.raw = None;
            }
            ShipFormat::Raw => {
                self.line_count = split_lines(text).len() as u64;
                self.raw = Some(text.to_string());
                self.lines = None;
            }
        }
    }

    /// JSON-encodes and gzips the envelope.
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 4), Compression::default());
        encoder.write_all(&json)?;
        encoder.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn envelope() -> Envelope {
        Envelope {
            device_id: "dev-1".to_string(),
            hostname: "host".to_string(),
            package: "web".to_string(),
            log_id: "access".to_string(),
            path: "/var/log/access.log".to_string(),
            dev: 1,
            inode: 2,
            offset_start: 0,
            offset_end: 12,
            sent_at: 1_700_000_000,
            line_count: 0,
            lines: None,
            raw: None,
            window_start: None,
            window_end: None,
        }
    }

    #[test]
    fn test_parse_format() {
        assert_eq!(ShipFormat::parse(""), Some(ShipFormat::Lines));
        assert_eq!(ShipFormat::parse("LINES"), Some(ShipFormat::Lines));
        assert_eq!(ShipFormat::parse("raw"), Some(ShipFormat::Raw));
        assert_eq!(ShipFormat::parse("ndjson"), None);
    }

    #[test]
    fn test_split_lines() {
        assert_eq!(split_lines("line1\nline2\n"), vec!["line1", "line2"]);
        assert_eq!(split_lines("line1\npartial"), vec!["line1", "partial"]);
        assert_eq!(split_lines("\n\n"), vec!["", ""]);
        assert!(split_lines("").is_empty());
    }

    #[test]
    fn test_lines_payload_omits_raw() {
        let mut env = envelope();
        env.set_payload("line1\nline2\n", ShipFormat::Lines);
        let json: serde_json::Value = serde_json::to_value(&env).unwrap();
        assert_eq!(json["lines"], serde_json::json!(["line1", "line2"]));
        assert_eq!(json["line_count"], 2);
        assert!(json.get("raw").is_none());
        assert!(json.get("window_start").is_none());
    }

    #[test]
    fn test_raw_payload_omits_lines() {
        let mut env = envelope();
        env.set_payload("line1\nline2\n", ShipFormat::Raw);
        let json: serde_json::Value = serde_json::to_value(&env).unwrap();
        assert_eq!(json["raw"], "line1\nline2\n");
        assert!(json.get("lines").is_none());
    }

    #[test]
    fn test_encode_is_gzipped_json() {
        let mut env = envelope();
        env.set_payload("hello\n", ShipFormat::Lines);
        let body = env.encode().unwrap();
        assert_eq!(&body[..2], &[0x1f, 0x8b]);
        let mut json = String::new();
        GzDecoder::new(body.as_slice()).read_to_string(&mut json).unwrap();
        let decoded: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, env);
    }
}
