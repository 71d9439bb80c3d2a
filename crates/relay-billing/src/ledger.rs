use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::time::Instant;

use time::OffsetDateTime;
use tracing::{error, info, warn};

use relay_protocol::openai::create_chat_completions::types::Usage;

use crate::cache::BalanceCache;
use crate::log::ConsumeLog;
use crate::rate::RateQuote;
use crate::store::{QuotaStore, StoreError};

pub const DEFAULT_TRUST_MULTIPLIER: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreConsumePolicy {
    /// A user whose balance exceeds this many times the estimate is trusted:
    /// the user balance is still reserved but the token-level reservation is
    /// skipped. `None` always reserves on the token.
    pub trust_multiplier: Option<i64>,
}

impl Default for PreConsumePolicy {
    fn default() -> Self {
        Self {
            trust_multiplier: Some(DEFAULT_TRUST_MULTIPLIER),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("user quota is not enough")]
    InsufficientUserQuota {
        user_id: i64,
        balance: i64,
        required: i64,
    },
    #[error("{0}")]
    InsufficientTokenQuota(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LedgerError {
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InsufficientUserQuota { .. } => "insufficient_user_quota",
            LedgerError::InsufficientTokenQuota(_) => "pre_consume_token_quota_failed",
            LedgerError::Store(_) => "get_user_quota_failed",
        }
    }

    pub fn is_insufficient(&self) -> bool {
        !matches!(self, LedgerError::Store(_))
    }
}

/// Who pays for a request, and for what.
#[derive(Debug, Clone, Default)]
pub struct Account {
    pub trace_id: String,
    pub user_id: i64,
    pub token_id: i64,
    pub token_name: String,
    /// Origin model name; billing never sees the mapped name.
    pub model: String,
    pub is_stream: bool,
}

/// Result of a reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    pub final_quota: i64,
    /// Applied to the token balance: `final_quota - pre_consumed`.
    pub delta: i64,
    pub pre_consumed: i64,
    /// Whether a consume log was written.
    pub logged: bool,
}

struct LedgerInner {
    store: Arc<dyn QuotaStore>,
    cache: BalanceCache,
    policy: PreConsumePolicy,
}

/// Pre-consume, refund and reconcile against user and token balances.
///
/// Every reservation ends in exactly one of `Reservation::refund` or
/// `Reservation::reconcile`; both take the reservation by value.
#[derive(Clone)]
pub struct QuotaLedger {
    inner: Arc<LedgerInner>,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn QuotaStore>, policy: PreConsumePolicy) -> Self {
        Self {
            inner: Arc::new(LedgerInner {
                store,
                cache: BalanceCache::new(),
                policy,
            }),
        }
    }

    pub fn policy(&self) -> PreConsumePolicy {
        self.inner.policy
    }

    async fn user_slot(&self, user_id: i64) -> Result<Arc<AtomicI64>, LedgerError> {
        if let Some(slot) = self.inner.cache.slot(user_id) {
            return Ok(slot);
        }
        let balance = self.inner.store.user_quota(user_id).await?;
        self.inner
            .cache
            .prime(user_id, balance)
            .ok_or_else(|| LedgerError::Store(StoreError::Backend("balance cache poisoned".into())))
    }

    /// Cached balance, loading it from the store on first use.
    pub async fn user_balance(&self, user_id: i64) -> Result<i64, LedgerError> {
        let slot = self.user_slot(user_id).await?;
        Ok(slot.load(std::sync::atomic::Ordering::SeqCst))
    }

    /// Reserve `estimate` before the upstream call. `units` is kept for
    /// per-call pricing at reconciliation.
    pub async fn pre_consume(
        &self,
        account: Account,
        quote: RateQuote,
        estimate: i64,
        units: f64,
    ) -> Result<Reservation, LedgerError> {
        let estimate = estimate.max(0);
        let slot = self.user_slot(account.user_id).await?;
        let before = BalanceCache::try_reserve(&slot, estimate).map_err(|balance| {
            LedgerError::InsufficientUserQuota {
                user_id: account.user_id,
                balance,
                required: estimate,
            }
        })?;

        let trusted = self
            .inner
            .policy
            .trust_multiplier
            .is_some_and(|multiplier| before > multiplier.saturating_mul(estimate));
        let token_reserved = if trusted { 0 } else { estimate };
        if token_reserved > 0
            && let Err(err) = self
                .inner
                .store
                .pre_consume_token(account.token_id, token_reserved)
                .await
        {
            self.inner.cache.credit(account.user_id, estimate);
            return Err(match err {
                StoreError::InsufficientTokenQuota { .. }
                | StoreError::InsufficientUserQuota { .. } => {
                    LedgerError::InsufficientTokenQuota(err.to_string())
                }
                other => LedgerError::Store(other),
            });
        }

        info!(
            event = "quota_pre_consumed",
            trace_id = %account.trace_id,
            user_id = account.user_id,
            token_id = account.token_id,
            model = %account.model,
            estimate,
            token_reserved,
            trusted
        );

        Ok(Reservation {
            inner: self.inner.clone(),
            account,
            quote,
            units,
            estimate,
            token_reserved,
            trusted,
            started: Instant::now(),
            settled: false,
        })
    }
}

/// Quota held for one in-flight request.
///
/// Dropping an unsettled reservation refunds it in the background and logs a
/// warning; callers should settle explicitly.
#[must_use = "a reservation must be refunded or reconciled"]
pub struct Reservation {
    inner: Arc<LedgerInner>,
    account: Account,
    quote: RateQuote,
    units: f64,
    /// Taken from the cached user balance.
    estimate: i64,
    /// Taken from the token (and store user) balance; zero when trusted.
    token_reserved: i64,
    trusted: bool,
    started: Instant,
    settled: bool,
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("account", &self.account)
            .field("estimate", &self.estimate)
            .field("token_reserved", &self.token_reserved)
            .field("trusted", &self.trusted)
            .field("settled", &self.settled)
            .finish()
    }
}

impl Reservation {
    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn quote(&self) -> &RateQuote {
        &self.quote
    }

    pub fn estimate(&self) -> i64 {
        self.estimate
    }

    /// Token-level pre-consumed quota, the base of the reconcile delta.
    pub fn pre_consumed(&self) -> i64 {
        self.token_reserved
    }

    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    /// Bill with the rate of the channel now serving the request. The amount
    /// reserved is not touched.
    pub fn requote(&mut self, quote: RateQuote) {
        self.quote = quote;
    }

    /// Return everything reserved. For requests that never produced output.
    pub async fn refund(mut self) -> Result<(), LedgerError> {
        self.settled = true;
        self.inner.cache.credit(self.account.user_id, self.estimate);
        let result = if self.token_reserved > 0 {
            self.inner
                .store
                .post_consume_token(self.account.token_id, -self.token_reserved)
                .await
        } else {
            Ok(())
        };
        info!(
            event = "quota_refunded",
            trace_id = %self.account.trace_id,
            user_id = self.account.user_id,
            token_id = self.account.token_id,
            estimate = self.estimate,
            token_reserved = self.token_reserved
        );
        result.map_err(LedgerError::from)
    }

    /// Charge the final quota for `usage` and write the consume log.
    ///
    /// Zero usage with a zero charge is an upstream anomaly: the reservation
    /// is still returned through the delta, but no log is written.
    pub async fn reconcile(mut self, channel_id: i64, usage: &Usage) -> Result<Settlement, LedgerError> {
        self.settled = true;
        let final_quota = self.quote.final_quota(usage, self.units);
        let delta = final_quota - self.token_reserved;
        self.inner
            .cache
            .credit(self.account.user_id, self.estimate - final_quota);
        if delta != 0 {
            self.inner
                .store
                .post_consume_token(self.account.token_id, delta)
                .await?;
        }

        let anomaly = final_quota == 0 && usage.prompt_tokens + usage.completion_tokens == 0;
        if anomaly {
            warn!(
                event = "consume_log_skipped",
                trace_id = %self.account.trace_id,
                user_id = self.account.user_id,
                channel_id,
                model = %self.account.model,
                pre_consumed = self.token_reserved
            );
        } else {
            let log = ConsumeLog {
                user_id: self.account.user_id,
                channel_id,
                token_id: self.account.token_id,
                token_name: self.account.token_name.clone(),
                model: self.account.model.clone(),
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                quota: final_quota,
                content: self.quote.annotation(usage.prompt_tokens),
                pre_consumed_quota: self.token_reserved,
                is_stream: self.account.is_stream,
                elapsed_ms: self.started.elapsed().as_millis() as u64,
                created_at: OffsetDateTime::now_utc(),
            };
            self.inner.store.append_consume_log(log).await?;
            self.inner
                .store
                .record_usage(self.account.user_id, channel_id, final_quota)
                .await?;
        }

        info!(
            event = "quota_reconciled",
            trace_id = %self.account.trace_id,
            user_id = self.account.user_id,
            token_id = self.account.token_id,
            channel_id,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            final_quota,
            delta
        );

        Ok(Settlement {
            final_quota,
            delta,
            pre_consumed: self.token_reserved,
            logged: !anomaly,
        })
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        warn!(
            event = "quota_refunded",
            trace_id = %self.account.trace_id,
            user_id = self.account.user_id,
            reason = "reservation_dropped",
            estimate = self.estimate
        );
        self.inner.cache.credit(self.account.user_id, self.estimate);
        if self.token_reserved == 0 {
            return;
        }
        let store = self.inner.store.clone();
        let token_id = self.account.token_id;
        let quota = self.token_reserved;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = store.post_consume_token(token_id, -quota).await {
                        error!(event = "quota_refund_failed", token_id, quota, error = %err);
                    }
                });
            }
            Err(_) => error!(
                event = "quota_refund_failed",
                token_id,
                quota,
                error = "no runtime to return token quota"
            ),
        }
    }
}
