//! Environment driven configuration for [`setup`](crate::setup::setup).

use std::{env, str::FromStr};

pub const ENABLED_VAR: &str = "TRACE_ENABLED";
pub const SERVICE_NAME_VAR: &str = "SERVICE_NAME";
pub const ENDPOINT_VAR: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
pub const REPORTER_VAR: &str = "TRACE_REPORTER";

const DEFAULT_ENDPOINT: &str = "http://localhost:4317";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}, expected {expected}")]
    InvalidValue {
        key: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Where ended transactions are sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReporterKind {
    /// OpenTelemetry spans over OTLP/gRPC.
    #[default]
    Otlp,
    /// One `tracing` event per transaction.
    Log,
}

impl FromStr for ReporterKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "otlp" => Ok(ReporterKind::Otlp),
            "log" => Ok(ReporterKind::Log),
            _ => Err(ConfigError::InvalidValue {
                key: REPORTER_VAR,
                value: value.to_owned(),
                expected: "`otlp` or `log`",
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceConfig {
    /// When false, [`setup`](crate::setup::setup) hands out
    /// [`Engine::Disabled`](crate::tracer::Engine::Disabled).
    pub enabled: bool,
    pub service_name: String,
    pub endpoint: String,
    pub reporter: ReporterKind,
}

impl Default for TraceConfig {
    fn default() -> Self {
        TraceConfig {
            enabled: true,
            service_name: env!("CARGO_PKG_NAME").to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            reporter: ReporterKind::default(),
        }
    }
}

impl TraceConfig {
    /// Reads `TRACE_ENABLED`, `SERVICE_NAME`, `OTEL_EXPORTER_OTLP_ENDPOINT`
    /// and `TRACE_REPORTER`, defaulting whatever is unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = TraceConfig::default();

        let enabled = match lookup(ENABLED_VAR) {
            Some(value) => parse_bool(ENABLED_VAR, &value)?,
            None => defaults.enabled,
        };
        let reporter = match lookup(REPORTER_VAR) {
            Some(value) => value.parse()?,
            None => defaults.reporter,
        };

        Ok(TraceConfig {
            enabled,
            service_name: lookup(SERVICE_NAME_VAR).unwrap_or(defaults.service_name),
            endpoint: lookup(ENDPOINT_VAR).unwrap_or(defaults.endpoint),
            reporter,
        })
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_owned(),
            expected: "a boolean",
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<TraceConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        TraceConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        assert_eq!(config(&[]).unwrap(), TraceConfig::default());
    }

    #[test]
    fn reads_every_variable() {
        let config = config(&[
            (ENABLED_VAR, "false"),
            (SERVICE_NAME_VAR, "orders"),
            (ENDPOINT_VAR, "http://collector:4317"),
            (REPORTER_VAR, "LOG"),
        ])
        .unwrap();

        assert_eq!(
            config,
            TraceConfig {
                enabled: false,
                service_name: "orders".to_string(),
                endpoint: "http://collector:4317".to_string(),
                reporter: ReporterKind::Log,
            }
        );
    }

    #[test]
    fn rejects_bad_values() {
        assert_eq!(
            config(&[(ENABLED_VAR, "maybe")]),
            Err(ConfigError::InvalidValue {
                key: ENABLED_VAR,
                value: "maybe".to_string(),
                expected: "a boolean",
            })
        );
        assert!(config(&[(REPORTER_VAR, "zipkin")]).is_err());
    }
}
