//! Pricing and prepaid quota accounting.
//!
//! `RateTable` turns a model, channel type and group into a `RateQuote`.
//! `QuotaLedger` reserves an estimate before the upstream call and settles the
//! reservation once by refund or by reconciliation against final usage.

pub mod cache;
pub mod ledger;
pub mod log;
pub mod rate;
pub mod store;

pub use cache::BalanceCache;
pub use ledger::{
    Account, DEFAULT_TRUST_MULTIPLIER, LedgerError, PreConsumePolicy, QuotaLedger, Reservation,
    Settlement,
};
pub use log::ConsumeLog;
pub use rate::{
    DEFAULT_MODEL_RATE, LongContextTier, ModelRate, PriceKind, RateQuote, RateTable,
    RateTableSnapshot,
};
pub use store::{
    MemoryQuotaStore, QuotaStore, StoreError, StoreResult, TokenAccount, UserAccount,
};
