use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, warn};
use wreq::{Client, Method, Proxy};

use relay_common::GlobalConfig;
use relay_provider_core::{
    ByteStream, Headers, HttpMethod, UpstreamBody, UpstreamClient, UpstreamFailure,
    UpstreamHttpRequest, UpstreamHttpResponse, UpstreamTransportErrorKind,
};

const STREAM_CHANNEL_CAPACITY: usize = 16;

/// Timeouts and egress for upstream calls.
///
/// `request_timeout` bounds a whole non-stream call, and only the wait for
/// the response head of a stream call. A stream then lives as long as each
/// read arrives within `stream_idle_timeout`.
#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
}

impl UpstreamClientConfig {
    pub fn from_global(global: &GlobalConfig) -> Self {
        Self {
            proxy: global.proxy.clone(),
            connect_timeout: Duration::from_secs(global.connect_timeout_secs),
            request_timeout: Duration::from_secs(global.request_timeout_secs),
            stream_idle_timeout: Duration::from_secs(global.stream_idle_timeout_secs),
        }
    }
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self::from_global(&GlobalConfig::default())
    }
}

type ProxyResolver = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// `UpstreamClient` over wreq.
#[derive(Clone)]
pub struct WreqUpstreamClient {
    config: UpstreamClientConfig,
    resolve_proxy: ProxyResolver,
    pool: Arc<ClientPool>,
}

impl WreqUpstreamClient {
    pub fn new(config: UpstreamClientConfig) -> Result<Self, wreq::Error> {
        let proxy = config.proxy.clone();
        Self::new_with_proxy_resolver(config, move || proxy.clone())
    }

    /// The resolver runs on every call, so a reloaded proxy setting applies to
    /// the next request.
    pub fn new_with_proxy_resolver<F>(
        config: UpstreamClientConfig,
        resolve_proxy: F,
    ) -> Result<Self, wreq::Error>
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        let pool = ClientPool::new(config.connect_timeout);
        // fail at startup on a malformed proxy rather than on the first request
        pool.warm(proxy_key(resolve_proxy()))?;
        Ok(Self {
            config,
            resolve_proxy: Arc::new(resolve_proxy),
            pool: Arc::new(pool),
        })
    }

    async fn execute(
        &self,
        req: UpstreamHttpRequest,
    ) -> Result<UpstreamHttpResponse, UpstreamFailure> {
        let client = self.pool.client(proxy_key((self.resolve_proxy)()))?;
        let deadline = Instant::now() + self.config.request_timeout;
        let is_stream = req.is_stream;

        let mut builder = client.request(wreq_method(req.method), &req.url);
        for (name, value) in &req.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = req.body {
            builder = builder.body(body);
        }

        let resp = timeout_at(deadline, builder.send())
            .await
            .map_err(|_| self.deadline_exceeded())?
            .map_err(transport_failure)?;
        let status = resp.status().as_u16();
        let headers = response_headers(resp.headers());

        if is_stream && (200..300).contains(&status) {
            let body = pump_stream(resp, self.config.stream_idle_timeout);
            return Ok(UpstreamHttpResponse {
                status,
                headers,
                body: UpstreamBody::Stream(body),
            });
        }

        let body = timeout_at(deadline, resp.bytes())
            .await
            .map_err(|_| self.deadline_exceeded())?
            .map_err(transport_failure)?;
        Ok(UpstreamHttpResponse {
            status,
            headers,
            body: UpstreamBody::Bytes(body),
        })
    }

    fn deadline_exceeded(&self) -> UpstreamFailure {
        UpstreamFailure::transport(
            UpstreamTransportErrorKind::Timeout,
            format!(
                "upstream did not answer within {}s",
                self.config.request_timeout.as_secs()
            ),
        )
    }
}

impl UpstreamClient for WreqUpstreamClient {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
    {
        Box::pin(self.execute(req))
    }
}

/// One wreq client per egress proxy; `None` is a direct connection.
struct ClientPool {
    connect_timeout: Duration,
    clients: Mutex<HashMap<Option<String>, Client>>,
}

impl ClientPool {
    fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn build(&self, proxy: Option<&str>) -> Result<Client, wreq::Error> {
        let builder = Client::builder().connect_timeout(self.connect_timeout);
        match proxy {
            Some(proxy) => builder.proxy(Proxy::all(proxy)?).build(),
            None => builder.build(),
        }
    }

    fn warm(&self, proxy: Option<String>) -> Result<(), wreq::Error> {
        let client = self.build(proxy.as_deref())?;
        if let Ok(mut clients) = self.clients.lock() {
            clients.insert(proxy, client);
        }
        Ok(())
    }

    fn client(&self, proxy: Option<String>) -> Result<Client, UpstreamFailure> {
        let mut clients = self.clients.lock().map_err(|_| {
            UpstreamFailure::transport(UpstreamTransportErrorKind::Other, "client pool poisoned")
        })?;
        if let Some(client) = clients.get(&proxy) {
            return Ok(client.clone());
        }
        debug!(event = "upstream_client_built", proxy = proxy.as_deref().unwrap_or("direct"));
        let client = self.build(proxy.as_deref()).map_err(transport_failure)?;
        clients.insert(proxy, client.clone());
        Ok(client)
    }
}

fn proxy_key(proxy: Option<String>) -> Option<String> {
    proxy
        .map(|proxy| proxy.trim().to_string())
        .filter(|proxy| !proxy.is_empty())
}

/// Forward body chunks through a channel. A read error or an idle gap ends the
/// stream with an in-band failure; a dropped receiver ends it at once, even
/// mid-wait, and releases the connection.
fn pump_stream(resp: wreq::Response, idle: Duration) -> ByteStream {
    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let mut chunks = resp.bytes_stream();
        loop {
            let next = tokio::select! {
                next = timeout(idle, chunks.next()) => next,
                _ = tx.closed() => return,
            };
            let item = match next {
                Ok(None) => return,
                Ok(Some(chunk)) => chunk.map_err(transport_failure),
                Err(_) => {
                    warn!(event = "upstream_stream_idle", idle_secs = idle.as_secs());
                    Err(UpstreamFailure::transport(
                        UpstreamTransportErrorKind::ReadTimeout,
                        format!("no data for {}s", idle.as_secs()),
                    ))
                }
            };
            let last = item.is_err();
            if tx.send(item).await.is_err() || last {
                return;
            }
        }
    });
    rx
}

fn wreq_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

fn response_headers(map: &wreq::header::HeaderMap) -> Headers {
    map.iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

fn transport_failure(err: wreq::Error) -> UpstreamFailure {
    UpstreamFailure::transport(transport_kind(&err), err.to_string())
}

fn transport_kind(err: &wreq::Error) -> UpstreamTransportErrorKind {
    let text = err.to_string().to_ascii_lowercase();
    let mentions = |needles: &[&str]| needles.iter().any(|needle| text.contains(needle));

    if err.is_timeout() {
        return if mentions(&["read", "idle"]) {
            UpstreamTransportErrorKind::ReadTimeout
        } else {
            UpstreamTransportErrorKind::Timeout
        };
    }
    if mentions(&["tls", "ssl", "certificate"]) {
        return UpstreamTransportErrorKind::Tls;
    }
    if err.is_connect() && mentions(&["dns", "resolve", "lookup"]) {
        return UpstreamTransportErrorKind::Dns;
    }
    if err.is_connect() || err.is_connection_reset() {
        return UpstreamTransportErrorKind::Connect;
    }
    UpstreamTransportErrorKind::Other
}
