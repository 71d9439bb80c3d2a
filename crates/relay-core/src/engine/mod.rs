//! Request orchestration.
//!
//! A metered call is parsed, priced and reserved once, then dispatched to one
//! channel after another until an attempt succeeds, the failure is not worth
//! retrying, or the candidates run out. The reservation is settled exactly once:
//! reconciled against final usage when anything reached the client, refunded
//! otherwise.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::{error, info, warn};

use relay_billing::{Account, LedgerError, PriceKind, QuotaLedger, RateQuote, RateTable, Reservation};
use relay_common::GlobalConfig;
use relay_protocol::openai::list_models::response::ModelList;
use relay_provider_core::{
    AdaptorError, AdaptorRegistry, Channel, ChannelHealth, ChannelRegistry, ChannelStatus,
    Downstream, DownstreamReceiver, Headers, Meta, PROXY_PATH_PREFIX, RelayError, RelayMode,
    ResponseOutcome, TokenEstimator, UpstreamClient, UpstreamHttpRequest, finalize_usage,
};

use crate::auth::{AuthContext, AuthError, TokenAuth};
use crate::classify::{channel_health, classify};
use crate::mapping::resolve_model;

mod request;

pub use request::{DEFAULT_TRANSCRIPTION_MODEL, InboundRequest};

use request::Payload;

const PROXY_ADAPTOR: &str = "proxy";

/// Everything the engine reads while serving. Built once at startup; the
/// pieces that change at runtime swap their contents internally.
pub struct EngineState {
    pub global: ArcSwap<GlobalConfig>,
    pub auth: TokenAuth,
    pub adaptors: AdaptorRegistry,
    pub channels: Arc<dyn ChannelRegistry>,
    pub rates: RateTable,
    pub ledger: QuotaLedger,
    pub estimator: Arc<dyn TokenEstimator>,
}

#[derive(Clone)]
pub struct RelayEngine {
    state: Arc<EngineState>,
    client: Arc<dyn UpstreamClient>,
}

impl RelayEngine {
    pub fn new(state: Arc<EngineState>, client: Arc<dyn UpstreamClient>) -> Self {
        Self { state, client }
    }

    pub fn state(&self) -> &Arc<EngineState> {
        &self.state
    }

    pub fn global(&self) -> Arc<GlobalConfig> {
        self.state.global.load_full()
    }

    /// Retry, health and reservation settings apply from the next request on.
    pub fn apply_global_config(&self, config: GlobalConfig) {
        self.state.global.store(Arc::new(config));
    }

    pub fn authenticate(&self, key: Option<&str>) -> Result<AuthContext, AuthError> {
        self.state.auth.authenticate(key)
    }

    /// Models the group can reach through at least one enabled channel.
    pub async fn list_models(&self, group: &str) -> ModelList {
        ModelList::new(self.state.channels.models_for_group(group).await)
    }

    /// Serve `request` on a background task. The receiver yields the response
    /// head once and then the body; the task keeps running to settle the quota
    /// even if the receiver is dropped.
    pub fn relay(&self, request: InboundRequest) -> DownstreamReceiver {
        let (downstream, receiver) = Downstream::channel();
        let engine = self.clone();
        tokio::spawn(async move {
            engine.serve(request, downstream).await;
        });
        receiver
    }

    pub async fn serve(&self, request: InboundRequest, mut downstream: Downstream) {
        let mode = RelayMode::from_path(&request.path);
        info!(
            event = "downstream_received",
            trace_id = %request.trace_id,
            mode = %mode,
            path = %request.path,
            user_id = request.auth.user_id,
            token_id = request.auth.token_id
        );
        let result = if mode == RelayMode::Proxy {
            self.serve_proxy(&request, &mut downstream).await
        } else {
            self.serve_metered(mode, &request, &mut downstream).await
        };
        if let Err(err) = result {
            warn!(
                event = "downstream_failed",
                trace_id = %request.trace_id,
                status = err.status(),
                code = err.code(),
                error = %err
            );
            if downstream.fail(&err).await.is_err() {
                info!(event = "client_gone", trace_id = %request.trace_id);
            }
        }
    }

    async fn serve_metered(
        &self,
        mode: RelayMode,
        request: &InboundRequest,
        downstream: &mut Downstream,
    ) -> Result<(), RelayError> {
        let payload = Payload::parse(mode, request)?;
        let origin_model = payload.model().to_string();
        let auth = &request.auth;
        let global = self.global();

        let mut excluded: Vec<i64> = Vec::new();
        let mut channel = self
            .state
            .channels
            .select(&auth.group, &origin_model, &excluded)
            .await
            .ok_or_else(|| RelayError::NoAvailableChannel {
                group: auth.group.clone(),
                model: origin_model.clone(),
            })?;

        let prompt_tokens = payload.prompt_tokens(mode, self.state.estimator.as_ref());
        let units = self.units(&payload)?;
        let quote = self.quote(&payload, &channel, &auth.group);
        let estimate = quote.estimate(
            prompt_tokens,
            payload.max_tokens(),
            global.pre_consumed_quota,
            units,
        );
        let account = Account {
            trace_id: request.trace_id.clone(),
            user_id: auth.user_id,
            token_id: auth.token_id,
            token_name: auth.token_name.clone(),
            model: origin_model.clone(),
            is_stream: payload.is_stream(),
        };
        let mut reservation = self
            .state
            .ledger
            .pre_consume(account, quote, estimate, units)
            .await
            .map_err(ledger_error)?;

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let meta = self.attempt_meta(mode, request, &payload, &channel, prompt_tokens);
            info!(
                event = "channel_selected",
                trace_id = %meta.trace_id,
                attempt,
                channel_id = meta.channel_id,
                channel_type = %meta.channel_type,
                origin_model = %meta.origin_model,
                actual_model = %meta.actual_model
            );

            let err = match self.attempt(&meta, &payload, request, downstream).await {
                Ok(outcome) => {
                    if global.auto_enable_channel {
                        self.state
                            .channels
                            .report(meta.channel_id, ChannelHealth::Healthy)
                            .await;
                    }
                    self.settle(reservation, &meta, outcome).await;
                    return Ok(());
                }
                Err(err) => err,
            };

            let class = classify(&err);
            warn!(
                event = "upstream_failed",
                trace_id = %meta.trace_id,
                attempt,
                channel_id = meta.channel_id,
                class = %class,
                status = err.status(),
                error = %err
            );
            if let Some(health) = channel_health(class, &err) {
                let disables = matches!(health, ChannelHealth::Disable { .. });
                if !disables || global.auto_disable_channel {
                    self.state.channels.report(meta.channel_id, health).await;
                }
            }

            // The status line is committed; the client keeps what it got.
            if downstream.is_started() {
                let outcome = ResponseOutcome {
                    partial_failure: Some(err.to_string()),
                    ..ResponseOutcome::default()
                };
                self.settle(reservation, &meta, outcome).await;
                return Err(err);
            }

            excluded.push(channel.id);
            if attempt <= global.retry_times
                && class.is_retryable()
                && let Some(next) = self
                    .state
                    .channels
                    .select(&auth.group, &origin_model, &excluded)
                    .await
            {
                backoff_sleep(attempt).await;
                reservation.requote(self.quote(&payload, &next, &auth.group));
                channel = next;
                continue;
            }

            if let Err(refund_err) = reservation.refund().await {
                error!(
                    event = "quota_refund_failed",
                    trace_id = %meta.trace_id,
                    error = %refund_err
                );
            }
            return Err(err);
        }
    }

    /// Rate of `channel` for this request. Image requests are always per-call.
    fn quote(&self, payload: &Payload, channel: &Channel, group: &str) -> RateQuote {
        let mut quote = self
            .state
            .rates
            .quote(payload.model(), &channel.channel_type, group);
        if matches!(payload, Payload::Image(_)) {
            quote.rate.kind = PriceKind::Times;
        }
        quote
    }

    /// Per-call billing units; zero for everything but image requests.
    fn units(&self, payload: &Payload) -> Result<f64, RelayError> {
        let Payload::Image(image) = payload else {
            return Ok(0.0);
        };
        self.state
            .rates
            .image_units(
                &image.model,
                image.size_or_default(),
                image.quality.as_deref(),
                image.count(),
            )
            .ok_or_else(|| {
                RelayError::invalid_request(
                    "size_not_supported",
                    format!(
                        "size {} is not supported by {}",
                        image.size_or_default(),
                        image.model
                    ),
                )
            })
    }

    fn attempt_meta(
        &self,
        mode: RelayMode,
        request: &InboundRequest,
        payload: &Payload,
        channel: &Channel,
        prompt_tokens: u64,
    ) -> Meta {
        let mut meta = channel_meta(&request.trace_id, mode, channel, request);
        meta.origin_model = payload.model().to_string();
        meta.actual_model = resolve_model(&channel.model_mapping, payload.model());
        meta.is_stream = payload.is_stream();
        meta.include_usage = payload.include_usage();
        meta.prompt_tokens = prompt_tokens;
        meta
    }

    async fn attempt(
        &self,
        meta: &Meta,
        payload: &Payload,
        request: &InboundRequest,
        downstream: &mut Downstream,
    ) -> Result<ResponseOutcome, RelayError> {
        let mut adaptor = self.state.adaptors.create(&meta.channel_type).ok_or_else(|| {
            AdaptorError::InvalidChannelConfig(format!(
                "unknown channel type {}",
                meta.channel_type
            ))
        })?;
        adaptor.init(meta)?;
        let url = adaptor.request_url(meta).await?;
        let mut headers = Headers::new();
        adaptor
            .setup_request_header(&request.headers, &mut headers, meta)
            .await?;
        let body = payload.upstream_body(adaptor.as_ref(), meta, &request.body)?;
        let upstream = UpstreamHttpRequest {
            method: request.method,
            url,
            headers,
            body: Some(body),
            is_stream: meta.is_stream,
        };
        let response = adaptor
            .do_request(self.client.as_ref(), meta, upstream)
            .await?;
        adaptor
            .do_response(meta, response, downstream, self.state.estimator.as_ref())
            .await
    }

    async fn settle(&self, reservation: Reservation, meta: &Meta, outcome: ResponseOutcome) {
        if let Some(reason) = &outcome.partial_failure {
            warn!(
                event = "stream_partial_failure",
                trace_id = %meta.trace_id,
                channel_id = meta.channel_id,
                reason = %reason
            );
        }
        let usage = finalize_usage(
            outcome.usage.as_ref(),
            meta.prompt_tokens,
            &outcome.completion_text,
            self.state.estimator.as_ref(),
            &meta.actual_model,
        );
        if outcome.client_gone {
            info!(event = "client_gone", trace_id = %meta.trace_id, channel_id = meta.channel_id);
        }
        if let Err(err) = reservation.reconcile(meta.channel_id, &usage).await {
            error!(
                event = "quota_settle_failed",
                trace_id = %meta.trace_id,
                channel_id = meta.channel_id,
                error = %err
            );
        }
    }

    /// `/v1/oneapi/proxy/{channel_id}/...`: forwarded to one named channel with
    /// no ledger involvement.
    async fn serve_proxy(
        &self,
        request: &InboundRequest,
        downstream: &mut Downstream,
    ) -> Result<(), RelayError> {
        let channel_id = proxy_channel_id(&request.path)?;
        let channel = self.state.channels.get(channel_id).await.ok_or_else(|| {
            RelayError::invalid_request(
                "channel_not_found",
                format!("channel {channel_id} does not exist"),
            )
        })?;
        if channel.status != ChannelStatus::Enabled {
            return Err(RelayError::invalid_request(
                "channel_disabled",
                format!("channel {channel_id} is disabled"),
            ));
        }
        let mut meta = channel_meta(&request.trace_id, RelayMode::Proxy, &channel, request);
        meta.is_stream = true;
        info!(
            event = "channel_selected",
            trace_id = %meta.trace_id,
            attempt = 1u32,
            channel_id = meta.channel_id,
            channel_type = %meta.channel_type
        );

        let adaptor = self.state.adaptors.create(PROXY_ADAPTOR).ok_or_else(|| {
            AdaptorError::InvalidChannelConfig("proxy adaptor is not registered".to_string())
        })?;
        let url = adaptor.request_url(&meta).await?;
        let mut headers = Headers::new();
        adaptor
            .setup_request_header(&request.headers, &mut headers, &meta)
            .await?;
        let upstream = UpstreamHttpRequest {
            method: request.method,
            url,
            headers,
            body: (!request.body.is_empty()).then(|| request.body.clone()),
            is_stream: true,
        };
        let response = adaptor
            .do_request(self.client.as_ref(), &meta, upstream)
            .await?;
        let outcome = adaptor
            .do_response(&meta, response, downstream, self.state.estimator.as_ref())
            .await?;
        if let Some(reason) = outcome.partial_failure {
            warn!(
                event = "stream_partial_failure",
                trace_id = %meta.trace_id,
                channel_id = meta.channel_id,
                reason = %reason
            );
        }
        Ok(())
    }
}

fn channel_meta(trace_id: &str, mode: RelayMode, channel: &Channel, request: &InboundRequest) -> Meta {
    let mut meta = Meta::new(trace_id, mode);
    meta.channel_id = channel.id;
    meta.channel_name = channel.name.clone();
    meta.channel_type = channel.channel_type.clone();
    meta.channel_config = channel.config.clone();
    meta.token_id = request.auth.token_id;
    meta.token_name = request.auth.token_name.clone();
    meta.user_id = request.auth.user_id;
    meta.group = request.auth.group.clone();
    meta.base_url = channel.base_url.clone();
    meta.api_key = channel.api_key.clone();
    meta.request_path = request.path.clone();
    meta.request_query = request.query.clone();
    meta
}

fn proxy_channel_id(path: &str) -> Result<i64, RelayError> {
    let rest = path
        .strip_prefix(PROXY_PATH_PREFIX)
        .unwrap_or_default()
        .trim_start_matches('/');
    let id = rest.split('/').next().unwrap_or_default();
    id.parse().map_err(|_| {
        RelayError::invalid_request(
            "invalid_channel_id",
            format!("{id:?} is not a channel id"),
        )
    })
}

fn ledger_error(err: LedgerError) -> RelayError {
    if err.is_insufficient() {
        RelayError::InsufficientQuota {
            code: err.code(),
            message: err.to_string(),
        }
    } else {
        RelayError::QuotaStore(err.to_string())
    }
}

fn retry_backoff_delay(attempt: u32) -> Duration {
    let step = attempt.saturating_sub(1).min(6);
    let base_ms = 200u64;
    let backoff = base_ms.saturating_mul(1u64 << step);
    let jitter = rand::random::<u64>() % (base_ms + 1);
    Duration::from_millis((backoff + jitter).min(2_000))
}

async fn backoff_sleep(attempt: u32) {
    tokio::time::sleep(retry_backoff_delay(attempt)).await;
}
