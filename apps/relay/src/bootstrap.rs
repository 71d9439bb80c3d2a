use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use arc_swap::ArcSwap;
use serde::Deserialize;
use tracing::{info, warn};

use relay_billing::{MemoryQuotaStore, PreConsumePolicy, QuotaLedger, RateTable, RateTableSnapshot};
use relay_common::{GlobalConfig, GlobalConfigPatch};
use relay_core::{
    AuthSnapshot, EngineState, RelayEngine, TokenAuth, TokenEntry, UpstreamClientConfig,
    WreqUpstreamClient,
};
use relay_provider_core::{AdaptorRegistry, Channel, MemoryChannelRegistry};
use relay_provider_impl::{TiktokenEstimator, register_builtin_adaptors};

/// Contents of the `--config` file. Every section is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct BootstrapFile {
    pub(crate) global: GlobalConfigPatch,
    pub(crate) channels: Vec<Channel>,
    pub(crate) users: Vec<UserSeed>,
    pub(crate) tokens: Vec<TokenSeed>,
    pub(crate) rates: RateTableSnapshot,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct UserSeed {
    pub(crate) id: i64,
    #[serde(default)]
    pub(crate) quota: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TokenSeed {
    #[serde(flatten)]
    pub(crate) entry: TokenEntry,
    #[serde(default)]
    pub(crate) remain_quota: i64,
    #[serde(default)]
    pub(crate) unlimited_quota: bool,
}

impl BootstrapFile {
    pub(crate) fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            warn!(event = "bootstrap_missing", "no --config given; starting without channels or tokens");
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read bootstrap file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parse bootstrap file {}", path.display()))
    }

    /// File layer under the command line.
    pub(crate) fn global_config(&self, cli: GlobalConfigPatch) -> anyhow::Result<GlobalConfig> {
        let mut patch = self.global.clone();
        patch.overlay(cli);
        patch.into_config().context("invalid global config")
    }

    fn auth_snapshot(&self) -> AuthSnapshot {
        AuthSnapshot::from_entries(self.tokens.iter().map(|token| token.entry.clone()))
    }
}

/// A running relay plus the handles a reload needs.
pub(crate) struct Relay {
    pub(crate) engine: RelayEngine,
    channels: Arc<MemoryChannelRegistry>,
    store: Arc<MemoryQuotaStore>,
}

impl Relay {
    pub(crate) fn build(file: BootstrapFile, global: GlobalConfig) -> anyhow::Result<Self> {
        let store = Arc::new(MemoryQuotaStore::new());
        seed_accounts(&store, &file);

        let mut adaptors = AdaptorRegistry::new();
        register_builtin_adaptors(&mut adaptors);
        for channel in &file.channels {
            if adaptors.create(&channel.channel_type).is_none() {
                warn!(
                    event = "channel_type_unknown",
                    channel_id = channel.id,
                    channel_type = %channel.channel_type
                );
            }
        }

        let estimator = TiktokenEstimator::new().context("load token encoders")?;
        let auth = TokenAuth::new(file.auth_snapshot());
        let channels = Arc::new(MemoryChannelRegistry::new(file.channels));
        let ledger = QuotaLedger::new(
            store.clone(),
            PreConsumePolicy {
                trust_multiplier: global.trust_multiplier(),
            },
        );
        let client_config = UpstreamClientConfig::from_global(&global);

        let state = Arc::new(EngineState {
            global: ArcSwap::from_pointee(global),
            auth,
            adaptors,
            channels: channels.clone(),
            rates: RateTable::new(file.rates),
            ledger,
            estimator: Arc::new(estimator),
        });
        let proxy_state = state.clone();
        let client = WreqUpstreamClient::new_with_proxy_resolver(client_config, move || {
            proxy_state.global.load().proxy.clone()
        })
        .context("build upstream client")?;

        Ok(Self {
            engine: RelayEngine::new(state, Arc::new(client)),
            channels,
            store,
        })
    }

    /// Apply a re-read bootstrap file. Channels are upserted, tokens and rates
    /// replaced. Accounts that already exist keep their balances.
    pub(crate) fn reload(&self, file: BootstrapFile, global: GlobalConfig) {
        let state = self.engine.state();
        seed_accounts(&self.store, &file);
        let snapshot = file.auth_snapshot();
        let tokens = snapshot.len();
        state.auth.replace_snapshot(snapshot);
        let channels = file.channels.len();
        for channel in file.channels {
            self.channels.upsert(channel);
        }
        state.rates.reload(file.rates);
        self.engine.apply_global_config(global);
        info!(
            event = "bootstrap_reloaded",
            channels,
            tokens
        );
    }
}

fn seed_accounts(store: &MemoryQuotaStore, file: &BootstrapFile) {
    for user in &file.users {
        if store.user(user.id).is_none() {
            store.insert_user(user.id, user.quota);
        }
    }
    for token in &file.tokens {
        if !file.users.iter().any(|user| user.id == token.entry.user_id)
            && store.user(token.entry.user_id).is_none()
        {
            warn!(
                event = "token_user_missing",
                token_id = token.entry.id,
                user_id = token.entry.user_id
            );
        }
        if store.token(token.entry.id).is_none() {
            store.insert_token(
                token.entry.id,
                token.entry.user_id,
                token.remain_quota,
                token.unlimited_quota,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "global": {"port": 4000, "retry_times": 1},
        "channels": [
            {"id": 1, "type": "openai", "base_url": "https://api.openai.com", "api_key": "sk-a", "models": ["gpt-4o-mini"]}
        ],
        "users": [{"id": 1, "quota": 500000}],
        "tokens": [{"id": 10, "user_id": 1, "key": "sk-client", "remain_quota": 100000}],
        "rates": {"models": {"gpt-4o-mini": {"input": 0.075, "output": 0.3}}}
    }"#;

    #[test]
    fn cli_layer_wins_over_file() {
        let file: BootstrapFile = serde_json::from_str(SAMPLE).expect("parse");
        let global = file
            .global_config(GlobalConfigPatch {
                port: Some(5000),
                ..GlobalConfigPatch::default()
            })
            .expect("config");
        assert_eq!(global.port, 5000);
        assert_eq!(global.retry_times, 1);
    }

    #[test]
    fn seeds_accounts_once() {
        let file: BootstrapFile = serde_json::from_str(SAMPLE).expect("parse");
        assert_eq!(file.tokens[0].entry.group, "default");
        let store = MemoryQuotaStore::new();
        seed_accounts(&store, &file);
        assert_eq!(store.user(1).map(|user| user.quota), Some(500_000));
        assert_eq!(store.token(10).map(|token| token.remain_quota), Some(100_000));

        store.insert_user(1, 7);
        seed_accounts(&store, &file);
        assert_eq!(store.user(1).map(|user| user.quota), Some(7));
    }

    #[test]
    fn missing_file_is_an_empty_bootstrap() {
        let file = BootstrapFile::load(None).expect("empty");
        assert!(file.channels.is_empty());
        assert!(file.tokens.is_empty());
    }
}
