//! Construction-time configuration, in the same plain-struct-plus-`serde` shape as this
//! lineage's `GameConfig`/`AuthenticatorConfig`: constructible directly by an embedder, or
//! loadable from a config file by the CLI harness.

use serde::{Deserialize, Serialize};

use crate::log::LogLevel;

#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum Role {
    Client,
    Server,
}

/// Whether a peer without matching authentication is tolerated.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum AuthPolicy {
    /// Accept a connection regardless of whether either side authenticated.
    Fallback,
    /// Require both sides to agree on authentication; a mismatch is dropped.
    Strict,
}

pub const MIN_THREAD_INTERVAL_MS: u64 = 4;
pub const MAX_THREAD_INTERVAL_MS: u64 = 333;
pub const DEFAULT_THREAD_INTERVAL_MS: u64 = 8;

/// Clamps a requested worker-thread tick interval into `[4, 333]` ms.
#[inline]
pub fn clamp_thread_interval(requested_ms: u64) -> u64 {
    requested_ms.clamp(MIN_THREAD_INTERVAL_MS, MAX_THREAD_INTERVAL_MS)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContextConfig {
    pub role: Role,
    pub auth_enabled: bool,
    #[serde(default = "default_auth_policy")]
    pub auth_policy: AuthPolicy,
    #[serde(default = "default_protocol_id")]
    pub protocol_id: u32,
    #[serde(default = "default_true")]
    pub accept_new_connections: bool,
    #[serde(default)]
    pub emit_events: bool,
    #[serde(default = "LogLevel::default_for_build", with = "log_level_serde")]
    pub log_level: LogLevel,
}

impl ContextConfig {
    pub fn new(role: Role, auth_enabled: bool) -> ContextConfig {
        ContextConfig {
            role,
            auth_enabled,
            auth_policy: default_auth_policy(),
            protocol_id: default_protocol_id(),
            accept_new_connections: true,
            emit_events: false,
            log_level: LogLevel::default_for_build(),
        }
    }
}

fn default_auth_policy() -> AuthPolicy {
    AuthPolicy::Fallback
}

/// `0x50f04948`, matching the reference implementation's default protocol id so conformance
/// fixtures captured against it remain interoperable unless the embedder overrides it.
fn default_protocol_id() -> u32 {
    0x50f0_4948
}

fn default_true() -> bool {
    true
}

mod log_level_serde {
    use super::LogLevel;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(level: &LogLevel, serializer: S) -> Result<S::Ok, S::Error> {
        let name = match level {
            LogLevel::Silent => "silent",
            LogLevel::Error => "error",
            LogLevel::Warning => "warning",
            LogLevel::Info => "info",
            LogLevel::Verbose => "verbose",
            LogLevel::Debug => "debug",
        };
        serializer.serialize_str(name)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<LogLevel, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(match text.to_ascii_lowercase().as_str() {
            "silent" => LogLevel::Silent,
            "error" => LogLevel::Error,
            "warning" => LogLevel::Warning,
            "info" => LogLevel::Info,
            "verbose" => LogLevel::Verbose,
            _ => LogLevel::Debug,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_clamps_to_documented_bounds() {
        assert_eq!(clamp_thread_interval(0), MIN_THREAD_INTERVAL_MS);
        assert_eq!(clamp_thread_interval(10_000), MAX_THREAD_INTERVAL_MS);
        assert_eq!(clamp_thread_interval(8), 8);
    }
}
