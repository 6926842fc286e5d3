//! Bandwidth measurement tool and output parsing
//!
//! Tool output is untrusted text. Known error markers are checked before any
//! number is extracted, and a result is only valid when both directions parse
//! to a positive integer.

use crate::config::AutotuneConfig;
use crate::{exec, RatePair, Result, ShaperError};
use async_trait::async_trait;
use thiserror::Error;
use std::time::Duration;

/// Why tool output was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidMeasurement {
    /// A known error substring was found
    #[error("output contains error marker {0:?}")]
    ErrorMarker(String),
    /// A direction was not reported
    #[error("no {0} line in output")]
    Missing(&'static str),
    /// A direction's value did not parse
    #[error("{field} value {value:?} is not numeric")]
    NotNumeric {
        /// `Download` or `Upload`
        field: &'static str,
        /// Offending token
        value: String,
    },
    /// A direction rounded below 1
    #[error("{0} rounds to zero or less")]
    NotPositive(&'static str),
}

/// Parse tool output into a measured pair
pub fn parse_result(output: &str, error_markers: &[String]) -> std::result::Result<RatePair, InvalidMeasurement> {
    let lowered = output.to_lowercase();
    if let Some(marker) = error_markers
        .iter()
        .find(|m| !m.is_empty() && lowered.contains(&m.to_lowercase()))
    {
        return Err(InvalidMeasurement::ErrorMarker(marker.clone()));
    }

    Ok(RatePair {
        download_mbit: field(output, "Download")?,
        upload_mbit: field(output, "Upload")?,
    })
}

fn field(output: &str, name: &'static str) -> std::result::Result<u32, InvalidMeasurement> {
    let prefix = format!("{}:", name);
    let rest = output
        .lines()
        .find_map(|line| line.trim_start().strip_prefix(prefix.as_str()))
        .ok_or(InvalidMeasurement::Missing(name))?;

    let token = rest.split_whitespace().next().unwrap_or("");
    let value: f64 = token.parse().map_err(|_| InvalidMeasurement::NotNumeric {
        field: name,
        value: token.to_string(),
    })?;
    if !value.is_finite() {
        return Err(InvalidMeasurement::NotNumeric { field: name, value: token.to_string() });
    }

    let rounded = value.round();
    if rounded < 1.0 || rounded > f64::from(u32::MAX) {
        return Err(InvalidMeasurement::NotPositive(name));
    }
    Ok(rounded as u32)
}

/// External bandwidth measurement
#[async_trait]
pub trait MeasurementTool: Send + Sync {
    /// Run the tool and return its raw output
    async fn run(&self) -> Result<String>;
}

/// netperf-based speed test script
pub struct NetperfTool {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl NetperfTool {
    /// Build from autotune settings
    pub fn new(cfg: &AutotuneConfig) -> Self {
        Self {
            program: cfg.tool.clone(),
            args: vec![cfg.ip_version.flag().to_string()],
            timeout: Duration::from_secs(cfg.timeout_secs),
        }
    }
}

#[async_trait]
impl MeasurementTool for NetperfTool {
    async fn run(&self) -> Result<String> {
        tracing::info!("Running {} {}", self.program, self.args.join(" "));
        let args: Vec<&str> = self.args.iter().map(String::as_str).collect();
        let out = exec::run(&self.program, &args, None, self.timeout).await?;
        if !out.success {
            return Err(ShaperError::Command {
                program: self.program.clone(),
                detail: format!("exited non-zero: {}", out.stderr.trim()),
            });
        }
        // Some scripts report progress and errors on stderr
        Ok(format!("{}\n{}", out.stdout, out.stderr))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Tool returning canned output
    pub struct FakeTool {
        pub output: Mutex<Result<String>>,
        pub runs: Mutex<u32>,
        pub delay: Duration,
    }

    impl FakeTool {
        pub fn ok(output: &str) -> Self {
            Self::slow(output, Duration::ZERO)
        }

        /// Takes `delay` before answering
        pub fn slow(output: &str, delay: Duration) -> Self {
            Self { output: Mutex::new(Ok(output.to_string())), runs: Mutex::new(0), delay }
        }

        pub fn failing() -> Self {
            Self {
                output: Mutex::new(Err(ShaperError::Command {
                    program: "speedtest-netperf.sh".into(),
                    detail: "not installed".into(),
                })),
                runs: Mutex::new(0),
                delay: Duration::ZERO,
            }
        }

        pub fn runs(&self) -> u32 {
            *self.runs.lock()
        }
    }

    #[async_trait]
    impl MeasurementTool for FakeTool {
        async fn run(&self) -> Result<String> {
            *self.runs.lock() += 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match &*self.output.lock() {
                Ok(s) => Ok(s.clone()),
                Err(e) => Err(ShaperError::Command { program: "fake".into(), detail: e.to_string() }),
            }
        }
    }
}
