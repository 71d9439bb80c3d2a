use async_trait::async_trait;
use bytes::Bytes;

use relay_protocol::openai::create_chat_completions::request::TextRequest;
use relay_protocol::openai::create_chat_completions::types::Usage;
use relay_protocol::openai::create_image::request::ImageRequest;
use relay_protocol::openai::create_speech::request::SpeechRequest;

use crate::downstream::Downstream;
use crate::errors::{AdaptorError, AdaptorResult};
use crate::estimator::TokenEstimator;
use crate::headers::Headers;
use crate::meta::Meta;
use crate::relay_error::RelayError;
use crate::stream::StreamSummary;
use crate::upstream::{UpstreamClient, UpstreamFailure, UpstreamHttpRequest, UpstreamHttpResponse};

/// What `do_response` hands back once the client has its answer.
#[derive(Debug, Clone, Default)]
pub struct ResponseOutcome {
    /// Vendor-reported usage, if any was seen.
    pub usage: Option<Usage>,
    /// Text produced for the client; the estimator runs over it when usage is missing.
    pub completion_text: String,
    /// The stream broke off after output started.
    pub partial_failure: Option<String>,
    pub client_gone: bool,
}

impl From<StreamSummary> for ResponseOutcome {
    fn from(summary: StreamSummary) -> Self {
        Self {
            usage: summary.usage_observed.then_some(summary.usage),
            completion_text: summary.completion_text,
            partial_failure: summary.error,
            client_gone: summary.client_gone,
        }
    }
}

/// One upstream vendor.
///
/// Every vendor difference lives behind this trait; the orchestrator, ledger
/// and stream translator never branch on vendor. Capabilities a vendor lacks
/// keep the default body and report `AdaptorError::NotImplemented`.
#[async_trait]
pub trait Adaptor: Send + Sync {
    /// Connection-scoped setup, once per attempt before anything else.
    fn init(&mut self, _meta: &Meta) -> AdaptorResult<()> {
        Ok(())
    }

    /// Vendor endpoint for `meta.mode`. Async so vendors can exchange or
    /// refresh credentials here.
    async fn request_url(&self, meta: &Meta) -> AdaptorResult<String>;

    /// Auth and content negotiation. `inbound` are the client's headers with
    /// its own credentials already removed.
    async fn setup_request_header(
        &self,
        inbound: &Headers,
        outbound: &mut Headers,
        meta: &Meta,
    ) -> AdaptorResult<()>;

    /// Canonical text request to the vendor body. Pure.
    fn convert_request(&self, meta: &Meta, request: &TextRequest) -> AdaptorResult<Bytes>;

    fn convert_image_request(&self, _meta: &Meta, _request: &ImageRequest) -> AdaptorResult<Bytes> {
        Err(AdaptorError::NotImplemented("image_generations"))
    }

    fn convert_speech_request(
        &self,
        _meta: &Meta,
        _request: &SpeechRequest,
    ) -> AdaptorResult<Bytes> {
        Err(AdaptorError::NotImplemented("text_to_speech"))
    }

    /// Issue the call. Vendors on another transport override this and
    /// synthesize an `UpstreamHttpResponse` with an equivalent status.
    async fn do_request(
        &self,
        client: &dyn UpstreamClient,
        _meta: &Meta,
        request: UpstreamHttpRequest,
    ) -> Result<UpstreamHttpResponse, UpstreamFailure> {
        client.send(request).await
    }

    /// Write the canonical answer to `downstream`. Upstream errors come back as
    /// `RelayError::Upstream` with nothing written.
    async fn do_response(
        &self,
        meta: &Meta,
        response: UpstreamHttpResponse,
        downstream: &mut Downstream,
        estimator: &dyn TokenEstimator,
    ) -> Result<ResponseOutcome, RelayError>;

    fn model_list(&self) -> Vec<String>;

    fn channel_name(&self) -> &'static str;
}
