//! Opaque proxy and upstream configuration.
//!
//! Both arrive as free-form maps on the proxy registration. Parsing never
//! fails outright: a malformed map yields a [`Diagnostic`] carrying every
//! field that did decode, with defaults in place of the rest, so the caller
//! can report the problem and carry on.

use crate::{duration::GoDuration, mesh::MeshGatewayConfig};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;

/// A configuration value that could not be parsed, along with the defaults
/// to use in its place.
#[derive(Debug)]
pub struct Diagnostic<T> {
    pub value: T,
    pub error: serde_json::Error,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    #[serde(deserialize_with = "weak::string")]
    pub protocol: String,
    #[serde(deserialize_with = "weak::u64")]
    pub local_connect_timeout_ms: u64,
    #[serde(deserialize_with = "weak::opt_u64")]
    pub local_request_timeout_ms: Option<u64>,
    #[serde(deserialize_with = "weak::opt_u64")]
    pub local_idle_timeout_ms: Option<u64>,
    #[serde(deserialize_with = "weak::string")]
    pub bind_address: String,
    #[serde(deserialize_with = "weak::u32")]
    pub bind_port: u32,
    #[serde(deserialize_with = "weak::u64")]
    pub max_inbound_connections: u64,
    #[serde(deserialize_with = "weak::string")]
    pub balance_inbound_connections: String,
    #[serde(deserialize_with = "weak::string")]
    pub envoy_public_listener_json: String,
    #[serde(deserialize_with = "weak::string")]
    pub envoy_local_cluster_json: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    #[serde(deserialize_with = "weak::string")]
    pub protocol: String,
    #[serde(deserialize_with = "weak::u64")]
    pub connect_timeout_ms: u64,
    #[serde(deserialize_with = "weak::string")]
    pub envoy_listener_json: String,
    #[serde(deserialize_with = "weak::string")]
    pub envoy_cluster_json: String,
    pub limits: Option<UpstreamLimits>,
    pub passive_health_check: Option<PassiveHealthCheck>,
    pub mesh_gateway: MeshGatewayConfig,
    #[serde(deserialize_with = "weak::string")]
    pub balance_outbound_connections: String,
}

/// Circuit-breaker thresholds. Unset values leave the data plane's defaults
/// in place.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UpstreamLimits {
    #[serde(deserialize_with = "weak::opt_u32")]
    pub max_connections: Option<u32>,
    #[serde(deserialize_with = "weak::opt_u32")]
    pub max_pending_requests: Option<u32>,
    #[serde(deserialize_with = "weak::opt_u32")]
    pub max_concurrent_requests: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PassiveHealthCheck {
    pub interval: GoDuration,
    #[serde(deserialize_with = "weak::u32")]
    pub max_failures: u32,
    #[serde(deserialize_with = "weak::opt_u32")]
    pub enforcing_consecutive_5xx: Option<u32>,
    #[serde(deserialize_with = "weak::opt_u32")]
    pub max_ejection_percent: Option<u32>,
    pub base_ejection_time: Option<GoDuration>,
}

const DEFAULT_PROTOCOL: &str = "tcp";
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

// === impl Diagnostic ===

impl<T> Diagnostic<T> {
    pub fn into_value(self) -> T {
        self.value
    }
}

fn decode<T: Default + for<'de> Deserialize<'de>>(
    m: &Map<String, Value>,
) -> Result<T, Diagnostic<T>> {
    let error = match serde_json::from_value(Value::Object(m.clone())) {
        Ok(value) => return Ok(value),
        Err(error) => error,
    };

    // Keep the keys that decode on their own; only the bad ones fall back to
    // their defaults.
    let valid = m
        .iter()
        .filter(|(key, value)| {
            let single = Map::from_iter([((*key).clone(), (*value).clone())]);
            serde_json::from_value::<T>(Value::Object(single)).is_ok()
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect::<Map<_, _>>();
    let value = serde_json::from_value(Value::Object(valid)).unwrap_or_default();
    Err(Diagnostic { value, error })
}

fn finish<T>(
    res: Result<T, Diagnostic<T>>,
    mut f: impl FnMut(&mut T),
) -> Result<T, Diagnostic<T>> {
    match res {
        Ok(mut value) => {
            f(&mut value);
            Ok(value)
        }
        Err(mut diag) => {
            f(&mut diag.value);
            Err(diag)
        }
    }
}

// === impl ProxyConfig ===

impl ProxyConfig {
    /// Parses a proxy's opaque configuration, applying defaults whether or
    /// not parsing succeeds.
    pub fn parse(m: &Map<String, Value>) -> Result<Self, Diagnostic<Self>> {
        finish(decode(m), |cfg: &mut Self| {
            if cfg.protocol.is_empty() {
                cfg.protocol = DEFAULT_PROTOCOL.to_string();
            } else {
                cfg.protocol = cfg.protocol.to_lowercase();
            }
            if cfg.local_connect_timeout_ms < 1 {
                cfg.local_connect_timeout_ms = DEFAULT_CONNECT_TIMEOUT_MS;
            }
        })
    }

    pub fn local_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.local_connect_timeout_ms)
    }
}

// === impl UpstreamConfig ===

impl UpstreamConfig {
    /// Parses an upstream's opaque configuration without filling in
    /// defaults, for use when a discovery chain supplies them.
    pub fn parse_no_defaults(m: &Map<String, Value>) -> Result<Self, Diagnostic<Self>> {
        finish(decode(m), |cfg: &mut Self| {
            cfg.protocol = cfg.protocol.to_lowercase();
        })
    }

    pub fn parse(m: &Map<String, Value>) -> Result<Self, Diagnostic<Self>> {
        finish(Self::parse_no_defaults(m), |cfg: &mut Self| {
            if cfg.protocol.is_empty() {
                cfg.protocol = DEFAULT_PROTOCOL.to_string();
            }
            if cfg.connect_timeout_ms == 0 {
                cfg.connect_timeout_ms = DEFAULT_CONNECT_TIMEOUT_MS;
            }
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Weakly typed decoding: numbers may be given as strings and strings as
/// numbers or booleans.
mod weak {
    use serde::{de::Error, Deserialize, Deserializer};
    use serde_json::Value;

    fn to_i64<E: Error>(v: Value) -> Result<i64, E> {
        match v {
            Value::Null => Ok(0),
            Value::Bool(b) => Ok(b as i64),
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .ok_or_else(|| E::custom(format!("number {n} is out of range"))),
            Value::String(s) if s.is_empty() => Ok(0),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map_err(|e| E::custom(format!("cannot parse {s:?} as a number: {e}"))),
            other => Err(E::custom(format!("expected a number, found {other}"))),
        }
    }

    fn to_unsigned<T: TryFrom<i64>, E: Error>(v: Value) -> Result<T, E> {
        let n = to_i64::<E>(v)?;
        T::try_from(n).map_err(|_| E::custom(format!("number {n} is out of range")))
    }

    pub(super) fn u32<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
        to_unsigned(Value::deserialize(d)?)
    }

    /// Negative values are clamped to zero.
    pub(super) fn u64<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        let n = to_i64::<D::Error>(Value::deserialize(d)?)?;
        Ok(n.max(0) as u64)
    }

    pub(super) fn opt_u32<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
        match Value::deserialize(d)? {
            Value::Null => Ok(None),
            v => to_unsigned(v).map(Some),
        }
    }

    pub(super) fn opt_u64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        match Value::deserialize(d)? {
            Value::Null => Ok(None),
            v => to_unsigned(v).map(Some),
        }
    }

    pub(super) fn string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        match Value::deserialize(d)? {
            Value::Null => Ok(String::new()),
            Value::String(s) => Ok(s),
            Value::Bool(b) => Ok(b.to_string()),
            Value::Number(n) => Ok(n.to_string()),
            other => Err(D::Error::custom(format!(
                "expected a string, found {other}"
            ))),
        }
    }
}
