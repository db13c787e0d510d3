//! Trace propagation between the test process and spawned services.
//!
//! Span emission itself is out of scope: services carry their own
//! instrumentation. This module only decides which environment variables a
//! spawned service sees ([`service_env`]) and which ambient context a test
//! body receives ([`TraceContext`]).

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Env var carrying the trace sink path or endpoint into a spawned service.
pub const TRACE_SINK_ENV: &str = "FIXTURES_TRACE_SINK";

/// Env var carrying the service name tag into a spawned service.
pub const TRACE_SERVICE_ENV: &str = "FIXTURES_TRACE_SERVICE";

/// Prefix of process env vars that form the ambient trace context.
pub const TRACE_CONTEXT_PREFIX: &str = "FIXTURES_TRACECTX_";

/// Where spawned services send their spans.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum TraceSink {
    /// Local file the service appends spans to.
    File(PathBuf),
    /// Collector endpoint (`http://`, `https://` or `grpc://`).
    Endpoint(String),
}

impl FromStr for TraceSink {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::Config("Empty trace sink".to_string()));
        }
        if let Some((scheme, _)) = s.split_once("://") {
            return match scheme {
                "http" | "https" | "grpc" => Ok(TraceSink::Endpoint(s.to_string())),
                other => Err(Error::Config(format!(
                    "Unsupported trace sink scheme '{}' in '{}'",
                    other, s
                ))),
            };
        }
        Ok(TraceSink::File(PathBuf::from(s)))
    }
}

impl TryFrom<String> for TraceSink {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl fmt::Display for TraceSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceSink::File(path) => write!(f, "{}", path.display()),
            TraceSink::Endpoint(url) => f.write_str(url),
        }
    }
}

/// Environment variables injected into a service's sandbox for trace correlation.
pub fn service_env(service_name: &str, sink: Option<&TraceSink>) -> Vec<(String, String)> {
    let mut env = vec![(TRACE_SERVICE_ENV.to_string(), service_name.to_string())];
    if let Some(sink) = sink {
        env.push((TRACE_SINK_ENV.to_string(), sink.to_string()));
    }
    env
}

/// Ambient trace context handed to a test body.
///
/// Opaque to the harness: keys are whatever the parent process exported
/// under [`TRACE_CONTEXT_PREFIX`], lower-cased with the prefix stripped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceContext {
    entries: BTreeMap<String, String>,
}

impl TraceContext {
    /// Collect the context from the current process environment.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let entries = vars
            .into_iter()
            .filter_map(|(key, value)| {
                let stripped = key.as_ref().strip_prefix(TRACE_CONTEXT_PREFIX)?;
                if stripped.is_empty() {
                    return None;
                }
                Some((stripped.to_ascii_lowercase(), value.into()))
            })
            .collect();
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// The `trace_id` entry, if the parent exported one.
    pub fn trace_id(&self) -> Option<&str> {
        self.get("trace_id")
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Re-export the context as env vars, e.g. to pass it to a child process.
    pub fn to_env(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .map(|(k, v)| {
                (
                    format!("{}{}", TRACE_CONTEXT_PREFIX, k.to_ascii_uppercase()),
                    v.clone(),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_parsing() {
        assert_eq!(
            "/tmp/trace.jsonl".parse::<TraceSink>().unwrap(),
            TraceSink::File(PathBuf::from("/tmp/trace.jsonl"))
        );
        assert_eq!(
            "http://collector:4318".parse::<TraceSink>().unwrap(),
            TraceSink::Endpoint("http://collector:4318".to_string())
        );
        assert!("ftp://nope".parse::<TraceSink>().is_err());
        assert!("   ".parse::<TraceSink>().is_err());
    }

    #[test]
    fn test_service_env_always_tags_service() {
        assert_eq!(
            service_env("redis", None),
            vec![(TRACE_SERVICE_ENV.to_string(), "redis".to_string())]
        );

        let sink = TraceSink::Endpoint("grpc://otel:4317".to_string());
        let env = service_env("redis", Some(&sink));
        assert!(env.contains(&(TRACE_SINK_ENV.to_string(), "grpc://otel:4317".to_string())));
    }

    #[test]
    fn test_context_from_prefixed_vars() {
        let ctx = TraceContext::from_vars(vec![
            ("FIXTURES_TRACECTX_TRACE_ID", "abc123"),
            ("FIXTURES_TRACECTX_SPAN_ID", "def456"),
            ("FIXTURES_TRACECTX_", "ignored"),
            ("PATH", "/usr/bin"),
        ]);
        assert_eq!(ctx.trace_id(), Some("abc123"));
        assert_eq!(ctx.get("span_id"), Some("def456"));
        assert_eq!(ctx.iter().count(), 2);
    }

    #[test]
    fn test_context_env_round_trip_keeps_prefix() {
        let ctx = TraceContext::from_vars(vec![("FIXTURES_TRACECTX_TRACE_ID", "abc")]);
        assert_eq!(
            ctx.to_env(),
            vec![("FIXTURES_TRACECTX_TRACE_ID".to_string(), "abc".to_string())]
        );
        assert!(TraceContext::default().is_empty());
    }
}
