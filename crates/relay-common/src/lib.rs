use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
    #[error("invalid global config field {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

/// Final, merged global configuration used by the running process.
///
/// Merge order: CLI > ENV > bootstrap file > defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Optional outbound proxy (for upstream egress).
    pub proxy: Option<String>,
    pub connect_timeout_secs: u64,
    /// Whole-call deadline for non-stream upstream requests.
    pub request_timeout_secs: u64,
    /// Longest gap tolerated between two reads of a streaming body.
    pub stream_idle_timeout_secs: u64,
    pub sse_heartbeat_secs: u64,
    /// Flat quota added on top of the token estimate when reserving.
    pub pre_consumed_quota: i64,
    /// A balance above `trust_multiplier × estimate` skips the token-level reservation.
    /// Zero turns the shortcut off.
    pub trust_multiplier: i64,
    /// Extra attempts on other channels after a retryable failure.
    pub retry_times: u32,
    pub auto_disable_channel: bool,
    pub auto_enable_channel: bool,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            proxy: None,
            connect_timeout_secs: 5,
            request_timeout_secs: 600,
            stream_idle_timeout_secs: 30,
            sse_heartbeat_secs: 15,
            pre_consumed_quota: 500,
            trust_multiplier: 100,
            retry_times: 0,
            auto_disable_channel: true,
            auto_enable_channel: true,
        }
    }
}

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3000;

impl GlobalConfig {
    pub fn trust_multiplier(&self) -> Option<i64> {
        (self.trust_multiplier > 0).then_some(self.trust_multiplier)
    }
}

/// Optional layer used for merging global config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub proxy: Option<String>,
    pub connect_timeout_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub stream_idle_timeout_secs: Option<u64>,
    pub sse_heartbeat_secs: Option<u64>,
    pub pre_consumed_quota: Option<i64>,
    pub trust_multiplier: Option<i64>,
    pub retry_times: Option<u32>,
    pub auto_disable_channel: Option<bool>,
    pub auto_enable_channel: Option<bool>,
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
        if other.connect_timeout_secs.is_some() {
            self.connect_timeout_secs = other.connect_timeout_secs;
        }
        if other.request_timeout_secs.is_some() {
            self.request_timeout_secs = other.request_timeout_secs;
        }
        if other.stream_idle_timeout_secs.is_some() {
            self.stream_idle_timeout_secs = other.stream_idle_timeout_secs;
        }
        if other.sse_heartbeat_secs.is_some() {
            self.sse_heartbeat_secs = other.sse_heartbeat_secs;
        }
        if other.pre_consumed_quota.is_some() {
            self.pre_consumed_quota = other.pre_consumed_quota;
        }
        if other.trust_multiplier.is_some() {
            self.trust_multiplier = other.trust_multiplier;
        }
        if other.retry_times.is_some() {
            self.retry_times = other.retry_times;
        }
        if other.auto_disable_channel.is_some() {
            self.auto_disable_channel = other.auto_disable_channel;
        }
        if other.auto_enable_channel.is_some() {
            self.auto_enable_channel = other.auto_enable_channel;
        }
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        let defaults = GlobalConfig::default();
        let host = self.host.unwrap_or(defaults.host);
        if host.trim().is_empty() {
            return Err(GlobalConfigError::MissingField("host"));
        }
        let request_timeout_secs = self
            .request_timeout_secs
            .unwrap_or(defaults.request_timeout_secs);
        if request_timeout_secs == 0 {
            return Err(GlobalConfigError::InvalidField {
                field: "request_timeout_secs",
                reason: "must be greater than zero",
            });
        }
        let pre_consumed_quota = self
            .pre_consumed_quota
            .unwrap_or(defaults.pre_consumed_quota);
        if pre_consumed_quota < 0 {
            return Err(GlobalConfigError::InvalidField {
                field: "pre_consumed_quota",
                reason: "must not be negative",
            });
        }
        Ok(GlobalConfig {
            host,
            port: self.port.unwrap_or(defaults.port),
            proxy: self.proxy.filter(|proxy| !proxy.trim().is_empty()),
            connect_timeout_secs: self
                .connect_timeout_secs
                .unwrap_or(defaults.connect_timeout_secs),
            request_timeout_secs,
            stream_idle_timeout_secs: self
                .stream_idle_timeout_secs
                .unwrap_or(defaults.stream_idle_timeout_secs),
            sse_heartbeat_secs: self
                .sse_heartbeat_secs
                .unwrap_or(defaults.sse_heartbeat_secs),
            pre_consumed_quota,
            trust_multiplier: self.trust_multiplier.unwrap_or(defaults.trust_multiplier),
            retry_times: self.retry_times.unwrap_or(defaults.retry_times),
            auto_disable_channel: self
                .auto_disable_channel
                .unwrap_or(defaults.auto_disable_channel),
            auto_enable_channel: self
                .auto_enable_channel
                .unwrap_or(defaults.auto_enable_channel),
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            proxy: value.proxy,
            connect_timeout_secs: Some(value.connect_timeout_secs),
            request_timeout_secs: Some(value.request_timeout_secs),
            stream_idle_timeout_secs: Some(value.stream_idle_timeout_secs),
            sse_heartbeat_secs: Some(value.sse_heartbeat_secs),
            pre_consumed_quota: Some(value.pre_consumed_quota),
            trust_multiplier: Some(value.trust_multiplier),
            retry_times: Some(value.retry_times),
            auto_disable_channel: Some(value.auto_disable_channel),
            auto_enable_channel: Some(value.auto_enable_channel),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_layers_win() {
        let mut merged: GlobalConfigPatch =
            serde_json::from_str(r#"{"port": 4000, "retry_times": 2}"#).expect("file layer");
        merged.overlay(GlobalConfigPatch {
            port: Some(5000),
            ..GlobalConfigPatch::default()
        });
        let config = merged.into_config().expect("config");
        assert_eq!(config.port, 5000);
        assert_eq!(config.retry_times, 2);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.trust_multiplier(), Some(100));
    }

    #[test]
    fn zero_trust_multiplier_disables_shortcut() {
        let config = GlobalConfigPatch {
            trust_multiplier: Some(0),
            ..GlobalConfigPatch::default()
        }
        .into_config()
        .expect("config");
        assert_eq!(config.trust_multiplier(), None);
    }

    #[test]
    fn rejects_zero_request_timeout() {
        let err = GlobalConfigPatch {
            request_timeout_secs: Some(0),
            ..GlobalConfigPatch::default()
        }
        .into_config()
        .expect_err("zero timeout");
        assert!(matches!(
            err,
            GlobalConfigError::InvalidField {
                field: "request_timeout_secs",
                ..
            }
        ));
    }
}
