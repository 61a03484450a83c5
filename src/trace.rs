//! Packet trace files
//!
//! One network PDU per line, either as a hex string or as a JSON object
//! `{"data": "<base64>", "bearer": "advertising" | "proxy"}`. Blank lines and
//! lines starting with `#` are skipped.

use anyhow::Context;
use base64::Engine;
use serde::Deserialize;
use std::path::Path;

use crate::mesh::Bearer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    /// 1-based line number in the trace file
    pub line: usize,
    pub data: Vec<u8>,
    pub bearer: Bearer,
}

#[derive(Debug, Deserialize)]
struct JsonRecord {
    data: String,
    #[serde(default)]
    bearer: Option<Bearer>,
}

/// Parse one trace line. Returns `None` for blank and comment lines.
pub fn parse_line(line: &str, default_bearer: Bearer) -> anyhow::Result<Option<(Vec<u8>, Bearer)>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    if line.starts_with('{') {
        let record: JsonRecord = serde_json::from_str(line).context("Invalid JSON trace record")?;
        let data = base64::engine::general_purpose::STANDARD
            .decode(record.data.trim())
            .map_err(|e| anyhow::anyhow!("Base64 decode error: {}", e))?;
        return Ok(Some((data, record.bearer.unwrap_or(default_bearer))));
    }

    let digits = line
        .strip_prefix("0x")
        .or_else(|| line.strip_prefix("0X"))
        .unwrap_or(line);
    let data = hex::decode(digits).context("Invalid hex trace record")?;
    Ok(Some((data, default_bearer)))
}

pub fn parse(content: &str, default_bearer: Bearer) -> anyhow::Result<Vec<TraceRecord>> {
    let mut records = Vec::new();
    for (i, line) in content.lines().enumerate() {
        if let Some((data, bearer)) =
            parse_line(line, default_bearer).with_context(|| format!("Trace line {}", i + 1))?
        {
            records.push(TraceRecord {
                line: i + 1,
                data,
                bearer,
            });
        }
    }
    Ok(records)
}

pub fn load(path: &Path, default_bearer: Bearer) -> anyhow::Result<Vec<TraceRecord>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read trace file {:?}", path))?;
    parse(&content, default_bearer)
}
