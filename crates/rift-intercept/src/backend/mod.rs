//! Interception backend: the orchestrator behind every intercepted call.
//!
//! A call is checked against the whitelist, serialized, fingerprinted, and then
//! either replayed from the cache through an emulated socket or handed to the
//! backend's loopback listener, which forwards it live and records the result.
//!
//! # Module Structure
//!
//! - `active` - Process-wide active backend and [`InterceptedClient`]
//! - `listener` - Loopback listener serving the server-side view of misses
//! - `state` - Per-call state machine

mod active;
mod listener;
mod state;

pub use active::{active_backend, InterceptedClient};
pub use state::CallState;

use crate::config::{Config, ConnectionPoolConfig, DispatchConfig, ResolverPolicy};
use crate::correlator::{CallHandle, RequestCorrelator};
use crate::error::{BoxError, CallContext, InterceptError, PersistenceError};
use crate::events::{CallEvent, CallListener, Logger, NoopListener, ServedFrom, TracingLogger};
use crate::fingerprint::{self, Fingerprint, FingerprintContext, RedactionRules, Story};
use crate::headers::{is_hop_by_hop, strip_reserved, X_RIFT_CORRELATION_ERROR};
use crate::metrics;
use crate::persistence::Persistence;
use crate::request::{Destination, Protocol, SerializedRequest, SerializedResponse};
use crate::resolver::{DirectResolver, RelayResolver, ResponseResolver};
use crate::socket::{self, ReplayOptions};
use crate::tls::{CertificateAuthority, HandshakeTargets};
use crate::upstream::{HyperUpstream, Upstream};
use crate::whitelist::Whitelist;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::client::conn::http1;
use hyper::header::{CONTENT_LENGTH, HOST};
use hyper::http::request::Parts;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use listener::ListenerContext;
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use state::CallTrace;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Result of one intercepted call.
#[derive(Debug)]
pub struct Intercepted {
    pub response: Response<Bytes>,
    /// `None` for whitelisted passthrough calls.
    pub fingerprint: Option<Fingerprint>,
    pub state: CallState,
}

struct Running {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

struct BackendInner {
    persistence: Arc<dyn Persistence>,
    policy: ResolverPolicy,
    whitelist: Whitelist,
    rules: Arc<RedactionRules>,
    user_id: Option<String>,
    signature: Option<String>,
    upstream: Arc<dyn Upstream>,
    resolver: Arc<dyn ResponseResolver>,
    call_listener: Arc<dyn CallListener>,
    logger: Arc<dyn Logger>,
    story: Arc<Story>,
    correlator: RequestCorrelator,
    replay: ReplayOptions,
    listen_host: IpAddr,
    authority: Arc<CertificateAuthority>,
    targets: HandshakeTargets,
    tls_connector: TlsConnector,
    running: Mutex<Option<Running>>,
}

/// Intercepts outbound calls for one session.
///
/// Cheap to clone; clones share the same session, story and listener.
#[derive(Clone)]
pub struct InterceptionBackend {
    inner: Arc<BackendInner>,
}

impl InterceptionBackend {
    pub fn builder(
        authority: Arc<CertificateAuthority>,
        persistence: Arc<dyn Persistence>,
    ) -> BackendBuilder {
        BackendBuilder::new(authority, persistence)
    }

    /// Build a backend from a validated config, loading the CA it names.
    pub async fn from_config(
        config: &Config,
        persistence: Arc<dyn Persistence>,
    ) -> Result<Self, InterceptError> {
        Self::builder_from_config(config, persistence).await?.build()
    }

    /// Builder preloaded from `config`, for embedders that also swap collaborators.
    pub async fn builder_from_config(
        config: &Config,
        persistence: Arc<dyn Persistence>,
    ) -> Result<BackendBuilder, InterceptError> {
        config
            .validate()
            .map_err(|e| InterceptError::Configuration(e.to_string()))?;
        let authority = CertificateAuthority::load(&config.ca.cert_path, &config.ca.key_path).await?;
        let listen_host: IpAddr = config.listener.host.parse().map_err(|e| {
            InterceptError::Configuration(format!("invalid listener host '{}': {e}", config.listener.host))
        })?;

        let mut builder = Self::builder(authority, persistence)
            .policy(config.policy)
            .whitelist(Whitelist::new(config.whitelist.clone())?)
            .redact(config.redact.clone())
            .dispatch(config.dispatch.clone())
            .connection_pool(config.connection_pool.clone())
            .listener_host(listen_host);
        if let Some(user_id) = &config.user_id {
            builder = builder.user_id(user_id.clone());
        }
        if let Some(signature) = &config.signature {
            builder = builder.signature(signature.clone());
        }
        if let Some(timeout_ms) = config.replay_timeout_ms {
            builder = builder.replay_timeout_ms(timeout_ms);
        }
        Ok(builder)
    }

    pub fn policy(&self) -> ResolverPolicy {
        self.inner.policy
    }

    pub fn whitelist(&self) -> &Whitelist {
        &self.inner.whitelist
    }

    pub fn story(&self) -> &Story {
        &self.inner.story
    }

    pub fn correlator(&self) -> &RequestCorrelator {
        &self.inner.correlator
    }

    /// Address of the loopback listener while active.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.running.lock().as_ref().map(|running| running.addr)
    }

    pub fn is_active(&self) -> bool {
        self.inner.running.lock().is_some()
    }

    pub(crate) fn same_as(&self, other: &InterceptionBackend) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Bind the listener, start correlating and become the active backend.
    ///
    /// Any previously active backend is deactivated first. Activating an
    /// already active backend returns its current address.
    pub async fn activate(&self) -> Result<SocketAddr, InterceptError> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        if let Some(previous) = active_backend() {
            if !previous.same_as(self) {
                self.inner.logger.log("Deactivating previously active backend");
                previous.deactivate();
            }
        }

        let (tcp_listener, addr) = listener::bind(self.inner.listen_host).await?;
        {
            // A concurrent activate may have won while we were binding.
            let mut running = self.inner.running.lock();
            if let Some(existing) = running.as_ref() {
                debug!("Backend already listening on {}; dropping {}", existing.addr, addr);
                return Ok(existing.addr);
            }
            let context = Arc::new(ListenerContext {
                correlator: self.inner.correlator.clone(),
                resolver: Arc::clone(&self.inner.resolver),
                persistence: Arc::clone(&self.inner.persistence),
                story: Arc::clone(&self.inner.story),
                call_listener: Arc::clone(&self.inner.call_listener),
                authority: Arc::clone(&self.inner.authority),
                targets: self.inner.targets.clone(),
            });
            let task = tokio::spawn(listener::serve(tcp_listener, context));
            *running = Some(Running { addr, task });
        }

        self.inner.correlator.start();
        active::install(self.clone());
        self.inner.logger.log(&format!(
            "Interception active on {} (policy: {})",
            addr,
            self.inner.policy.as_str()
        ));
        Ok(addr)
    }

    /// Stop the listener and the correlator. Idempotent.
    pub fn deactivate(&self) {
        let running = self.inner.running.lock().take();
        if let Some(running) = running {
            running.task.abort();
            self.inner
                .logger
                .log(&format!("Interception listener on {} stopped", running.addr));
        }
        self.inner.correlator.stop();
        active::clear_if(self);
    }

    /// Resolve one outbound call.
    pub async fn intercept<B>(&self, request: Request<B>) -> Result<Intercepted, InterceptError>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<BoxError>,
    {
        let started = Instant::now();
        let result = self.intercept_inner(request).await;
        let outcome = match &result {
            Ok(intercepted) => intercepted.state.outcome(),
            Err(_) => "error",
        };
        metrics::record_call(outcome, started.elapsed().as_secs_f64() * 1000.0);
        if let Err(e) = &result {
            self.inner.logger.error(&format!("Intercepted call failed: {e}"));
        }
        result
    }

    async fn intercept_inner<B>(&self, request: Request<B>) -> Result<Intercepted, InterceptError>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<BoxError>,
    {
        if !self.is_active() {
            return Err(InterceptError::Configuration(
                "interception backend is not active".to_string(),
            ));
        }

        let (parts, body) = request.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| InterceptError::network(parts_context(&parts), e))?
            .to_bytes();
        let destination = Destination::from_parts(&parts)?;
        let mut trace = CallTrace::new(destination.context());

        if self
            .inner
            .whitelist
            .is_whitelisted(&destination.host, &destination.hostname)
        {
            trace.advance(CallState::Whitelisted);
            let response = self.passthrough(&destination, parts, body).await?;
            trace.advance(CallState::Passthrough);
            return Ok(Intercepted {
                response,
                fingerprint: None,
                state: trace.state(),
            });
        }

        let serialized = SerializedRequest::from_destination(destination, &parts, &body)?;
        let mut prior = Vec::new();
        let fingerprint = self.inner.story.advance(|story| {
            prior = story.to_vec();
            let context = FingerprintContext {
                story,
                user_id: self.inner.user_id.as_deref(),
                signature: self.inner.signature.as_deref(),
            };
            fingerprint::fingerprint(&serialized, &context, &self.inner.rules)
        });
        trace.advance(CallState::Fingerprinted);
        let context = serialized.context().with_fingerprint(fingerprint.clone());

        if let Some(cached) = self.lookup(&fingerprint, &context)? {
            trace.advance(CallState::CacheHit);
            match socket::replay(&serialized, &cached, self.inner.replay).await {
                Ok(response) => {
                    trace.advance(CallState::Replayed);
                    self.report(&fingerprint, &serialized, cached, ServedFrom::Cache);
                    return Ok(Intercepted {
                        response,
                        fingerprint: Some(fingerprint),
                        state: trace.state(),
                    });
                }
                Err(InterceptError::CacheCorruption { reason, .. }) => {
                    warn!("Cached response for {} is unreadable ({}); going live", context, reason);
                    metrics::record_cache_corruption(self.inner.policy.as_str());
                }
                Err(other) => return Err(other),
            }
        }

        trace.advance(CallState::CacheMiss);
        let handle = Arc::new(CallHandle::new(
            fingerprint.clone(),
            serialized,
            prior,
            Arc::clone(&self.inner.rules),
            self.inner.signature.clone(),
        ));
        trace.advance(CallState::Forwarding);
        let response = self.forward(&handle, parts, body).await?;
        trace.advance(CallState::Recorded);
        Ok(Intercepted {
            response,
            fingerprint: Some(fingerprint),
            state: trace.state(),
        })
    }

    /// Consult the policy and the cache. `Ok(None)` means go live.
    fn lookup(
        &self,
        fingerprint: &Fingerprint,
        context: &CallContext,
    ) -> Result<Option<SerializedResponse>, InterceptError> {
        let policy = self.inner.policy;
        let persistence_error = |source| InterceptError::Persistence {
            context: context.clone(),
            source,
        };

        match policy {
            ResolverPolicy::AlwaysLive => return Ok(None),
            ResolverPolicy::LiveIfUncached => {
                if !self
                    .inner
                    .persistence
                    .has_fingerprint(fingerprint)
                    .map_err(persistence_error)?
                {
                    return Ok(None);
                }
            }
            ResolverPolicy::AlwaysCached => {}
        }

        match self.inner.persistence.load_response(fingerprint) {
            Ok(Some(response)) => Ok(Some(response)),
            Ok(None) => {
                if policy == ResolverPolicy::AlwaysCached {
                    warn!("No cached response for {}; going live", context);
                }
                Ok(None)
            }
            Err(PersistenceError::Corrupt { reason, .. }) => {
                warn!("Cached response for {} is corrupt ({}); going live", context, reason);
                metrics::record_cache_corruption(policy.as_str());
                Ok(None)
            }
            Err(other) => Err(persistence_error(other)),
        }
    }

    fn report(
        &self,
        fingerprint: &Fingerprint,
        request: &SerializedRequest,
        response: SerializedResponse,
        served_from: ServedFrom,
    ) {
        if self.inner.story.mark_reported(fingerprint) {
            self.inner.call_listener.on_call(&CallEvent {
                fingerprint: fingerprint.clone(),
                request: request.clone(),
                response,
                served_from,
            });
        }
    }

    /// Send a whitelisted call over the real transport, untouched.
    async fn passthrough(
        &self,
        destination: &Destination,
        mut parts: Parts,
        body: Bytes,
    ) -> Result<Response<Bytes>, InterceptError> {
        if parts.uri.authority().is_none() {
            parts.uri = destination.url().parse().map_err(|e| {
                InterceptError::protocol(destination.context(), format!("invalid URI: {e}"))
            })?;
        }
        strip_reserved(&mut parts.headers);
        debug!("Passing {} through", destination.url());
        self.inner
            .upstream
            .send(Request::from_parts(parts, body))
            .await
            .map_err(|e| InterceptError::network(destination.context(), e))
    }

    /// Tag the call and send it to the loopback listener.
    async fn forward(
        &self,
        handle: &Arc<CallHandle>,
        parts: Parts,
        body: Bytes,
    ) -> Result<Response<Bytes>, InterceptError> {
        let context = handle.context();
        let addr = self.local_addr().ok_or_else(|| {
            InterceptError::Configuration("interception backend is not active".to_string())
        })?;

        let mut outgoing = listener_request(&handle.request, &parts, body)?;
        let _guard = self
            .inner
            .correlator
            .tag(&mut outgoing, Arc::clone(handle))
            .ok_or_else(|| InterceptError::Configuration("request correlator is not active".to_string()))?;

        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| InterceptError::network(context.clone(), e))?;
        let mut response = match handle.request.protocol {
            Protocol::Https => {
                let name = handle
                    .request
                    .hostname
                    .trim_start_matches('[')
                    .trim_end_matches(']')
                    .to_string();
                let server_name = ServerName::try_from(name.clone()).map_err(|e| {
                    InterceptError::protocol(context.clone(), format!("invalid TLS server name: {e}"))
                })?;
                // No SNI is sent for IP literals; the listener finds the name by our port.
                let local = stream
                    .local_addr()
                    .map_err(|e| InterceptError::network(context.clone(), e))?;
                let _target = self.inner.targets.register(local, name);
                let tls_stream = self
                    .inner
                    .tls_connector
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| InterceptError::network(context.clone(), e))?;
                exchange(TokioIo::new(tls_stream), outgoing).await
            }
            Protocol::Http => exchange(TokioIo::new(stream), outgoing).await,
        }
        .map_err(|e| InterceptError::network(context.clone(), e))?;

        if let Some(reason) = response.headers().get(&X_RIFT_CORRELATION_ERROR) {
            return Err(InterceptError::Correlation {
                context,
                reason: String::from_utf8_lossy(reason.as_bytes()).into_owned(),
            });
        }
        if let Some(failure) = handle.take_failure() {
            return Err(failure);
        }
        strip_reserved(response.headers_mut());
        Ok(response)
    }
}

fn parts_context(parts: &Parts) -> CallContext {
    CallContext::new(
        parts.uri.host().unwrap_or_default(),
        parts.uri.path().to_string(),
    )
}

/// The request as the listener should see it: origin-form URI plus `Host`.
fn listener_request(
    request: &SerializedRequest,
    parts: &Parts,
    body: Bytes,
) -> Result<Request<Full<Bytes>>, InterceptError> {
    let mut builder = Request::builder()
        .method(parts.method.clone())
        .uri(request.path.as_str())
        .header(HOST, request.host.as_str());
    for (name, value) in &parts.headers {
        if is_hop_by_hop(name.as_str()) || name == HOST || name == CONTENT_LENGTH {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
        .body(Full::new(body))
        .map_err(|e| InterceptError::protocol(request.context(), e.to_string()))
}

/// One HTTP/1.1 exchange over an already connected stream.
async fn exchange<I>(io: I, request: Request<Full<Bytes>>) -> Result<Response<Bytes>, hyper::Error>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (mut sender, conn) = http1::handshake(io).await?;
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            debug!("Listener connection closed: {}", err);
        }
    });
    let response = sender.send_request(request).await?;
    let (parts, body) = response.into_parts();
    let body = body.collect().await?.to_bytes();
    Ok(Response::from_parts(parts, body))
}

/// Builder for [`InterceptionBackend`].
pub struct BackendBuilder {
    authority: Arc<CertificateAuthority>,
    persistence: Arc<dyn Persistence>,
    policy: ResolverPolicy,
    whitelist: Option<Whitelist>,
    rules: RedactionRules,
    user_id: Option<String>,
    signature: Option<String>,
    upstream: Option<Arc<dyn Upstream>>,
    dispatch: DispatchConfig,
    resolver: Option<Arc<dyn ResponseResolver>>,
    call_listener: Arc<dyn CallListener>,
    logger: Arc<dyn Logger>,
    connection_pool: ConnectionPoolConfig,
    replay: ReplayOptions,
    listen_host: IpAddr,
}

impl BackendBuilder {
    fn new(authority: Arc<CertificateAuthority>, persistence: Arc<dyn Persistence>) -> Self {
        Self {
            authority,
            persistence,
            policy: ResolverPolicy::default(),
            whitelist: None,
            rules: RedactionRules::default(),
            user_id: None,
            signature: None,
            upstream: None,
            dispatch: DispatchConfig::default(),
            resolver: None,
            call_listener: Arc::new(NoopListener),
            logger: Arc::new(TracingLogger),
            connection_pool: ConnectionPoolConfig::default(),
            replay: ReplayOptions::default(),
            listen_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }

    pub fn policy(mut self, policy: ResolverPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn whitelist(mut self, whitelist: Whitelist) -> Self {
        self.whitelist = Some(whitelist);
        self
    }

    pub fn redact(mut self, rules: RedactionRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    /// Transport for passthrough and live calls. Defaults to [`HyperUpstream`].
    pub fn upstream(mut self, upstream: Arc<dyn Upstream>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    pub fn dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Overrides the resolver `dispatch` would otherwise select.
    pub fn resolver(mut self, resolver: Arc<dyn ResponseResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn call_listener(mut self, listener: Arc<dyn CallListener>) -> Self {
        self.call_listener = listener;
        self
    }

    /// Sink for lifecycle and failure messages. Defaults to [`TracingLogger`].
    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn connection_pool(mut self, pool: ConnectionPoolConfig) -> Self {
        self.connection_pool = pool;
        self
    }

    pub fn replay_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.replay.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn listener_host(mut self, host: IpAddr) -> Self {
        self.listen_host = host;
        self
    }

    pub fn build(self) -> Result<InterceptionBackend, InterceptError> {
        let upstream: Arc<dyn Upstream> = match self.upstream {
            Some(upstream) => upstream,
            None => Arc::new(HyperUpstream::new(&self.connection_pool)?),
        };
        let resolver: Arc<dyn ResponseResolver> = match (self.resolver, &self.dispatch) {
            (Some(resolver), _) => resolver,
            (None, DispatchConfig::Direct) => Arc::new(DirectResolver::new(Arc::clone(&upstream))),
            (None, DispatchConfig::Relay { endpoint }) => Arc::new(RelayResolver::new(
                endpoint.clone(),
                Arc::clone(&upstream),
                Arc::clone(&self.persistence),
            )),
        };

        let client_config = self.authority.client_config()?;

        Ok(InterceptionBackend {
            inner: Arc::new(BackendInner {
                persistence: self.persistence,
                policy: self.policy,
                whitelist: self.whitelist.unwrap_or_default(),
                rules: Arc::new(self.rules),
                user_id: self.user_id,
                signature: self.signature,
                upstream,
                resolver,
                call_listener: self.call_listener,
                logger: self.logger,
                story: Arc::new(Story::new()),
                correlator: RequestCorrelator::new(),
                replay: self.replay,
                listen_host: self.listen_host,
                authority: self.authority,
                targets: HandshakeTargets::new(),
                tls_connector: TlsConnector::from(Arc::new(client_config)),
                running: Mutex::new(None),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryPersistence;
    use crate::request::OneOrMany;
    use async_trait::async_trait;
    use serial_test::serial;

    #[derive(Default)]
    struct StaticUpstream {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Upstream for StaticUpstream {
        async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, BoxError> {
            self.calls.lock().push(request.uri().to_string());
            Ok(Response::builder()
                .header("content-type", "application/json")
                .body(Bytes::from_static(br#"{"ok":true}"#))?)
        }
    }

    async fn backend(
        policy: ResolverPolicy,
        persistence: Arc<MemoryPersistence>,
        upstream: Arc<StaticUpstream>,
    ) -> InterceptionBackend {
        let authority = CertificateAuthority::bundled().await.unwrap();
        InterceptionBackend::builder(authority, persistence)
            .policy(policy)
            .upstream(upstream)
            .build()
            .unwrap()
    }

    fn get(uri: &str) -> Request<Full<Bytes>> {
        Request::builder().uri(uri).body(Full::new(Bytes::new())).unwrap()
    }

    #[tokio::test]
    #[serial]
    async fn test_inactive_backend_refuses_calls() {
        let backend = backend(
            ResolverPolicy::default(),
            Arc::new(MemoryPersistence::new()),
            Arc::new(StaticUpstream::default()),
        )
        .await;
        let err = backend.intercept(get("http://api.example.com/")).await.unwrap_err();
        assert!(matches!(err, InterceptError::Configuration(_)));
    }

    #[tokio::test]
    #[serial]
    async fn test_always_live_records_and_ignores_cache() {
        let persistence = Arc::new(MemoryPersistence::new());
        let upstream = Arc::new(StaticUpstream::default());
        let backend = backend(ResolverPolicy::AlwaysLive, persistence.clone(), upstream.clone()).await;
        backend.activate().await.unwrap();

        let first = backend.intercept(get("http://api.example.com/items")).await.unwrap();
        assert_eq!(first.state, CallState::Recorded);
        let fp = first.fingerprint.clone().unwrap();
        assert!(persistence.has_fingerprint(&fp).unwrap());

        let second = backend.intercept(get("http://api.example.com/items")).await.unwrap();
        assert_eq!(second.state, CallState::Recorded);
        assert_ne!(second.fingerprint.unwrap(), fp);
        assert_eq!(upstream.calls.lock().len(), 2);
        assert_eq!(
            upstream.calls.lock()[0],
            "http://api.example.com/items"
        );
        backend.deactivate();
    }

    #[tokio::test]
    #[serial]
    async fn test_always_cached_without_entry_goes_live() {
        let persistence = Arc::new(MemoryPersistence::new());
        let upstream = Arc::new(StaticUpstream::default());
        let backend = backend(ResolverPolicy::AlwaysCached, persistence, upstream.clone()).await;
        backend.activate().await.unwrap();

        let result = backend.intercept(get("http://api.example.com/items")).await.unwrap();
        assert_eq!(result.state, CallState::Recorded);
        assert_eq!(upstream.calls.lock().len(), 1);
        backend.deactivate();
    }

    #[tokio::test]
    #[serial]
    async fn test_always_cached_replays_without_has_check() {
        let persistence = Arc::new(MemoryPersistence::new());
        let upstream = Arc::new(StaticUpstream::default());
        let recorder = backend(ResolverPolicy::AlwaysLive, persistence.clone(), upstream.clone()).await;
        recorder.activate().await.unwrap();
        recorder.intercept(get("http://api.example.com/items")).await.unwrap();
        recorder.deactivate();

        let replayer = backend(ResolverPolicy::AlwaysCached, persistence, upstream.clone()).await;
        replayer.activate().await.unwrap();
        let result = replayer.intercept(get("http://api.example.com/items")).await.unwrap();
        assert_eq!(result.state, CallState::Replayed);
        assert_eq!(result.response.body().as_ref(), br#"{"ok":true}"#);
        assert_eq!(upstream.calls.lock().len(), 1);
        replayer.deactivate();
    }

    #[tokio::test]
    #[serial]
    async fn test_deactivate_is_idempotent() {
        let backend = backend(
            ResolverPolicy::default(),
            Arc::new(MemoryPersistence::new()),
            Arc::new(StaticUpstream::default()),
        )
        .await;
        let addr = backend.activate().await.unwrap();
        assert_eq!(backend.activate().await.unwrap(), addr);
        assert!(active_backend().is_some_and(|b| b.same_as(&backend)));

        backend.deactivate();
        backend.deactivate();
        assert!(!backend.is_active());
        assert!(!backend.correlator().is_active());
        assert!(active_backend().is_none());
    }

    #[derive(Default)]
    struct CollectingLogger {
        logs: Mutex<Vec<String>>,
        errors: Mutex<Vec<String>>,
    }

    impl Logger for CollectingLogger {
        fn log(&self, message: &str) {
            self.logs.lock().push(message.to_string());
        }

        fn error(&self, message: &str) {
            self.errors.lock().push(message.to_string());
        }
    }

    #[tokio::test]
    #[serial]
    async fn test_logger_receives_lifecycle_and_failures() {
        let logger = Arc::new(CollectingLogger::default());
        let authority = CertificateAuthority::bundled().await.unwrap();
        let backend = InterceptionBackend::builder(authority, Arc::new(MemoryPersistence::new()))
            .upstream(Arc::new(StaticUpstream::default()))
            .logger(logger.clone())
            .build()
            .unwrap();

        assert!(backend.intercept(get("http://api.example.com/")).await.is_err());
        assert_eq!(logger.errors.lock().len(), 1);
        assert!(logger.errors.lock()[0].contains("not active"));

        let addr = backend.activate().await.unwrap();
        backend.deactivate();
        let logs = logger.logs.lock();
        assert!(logs.iter().any(|m| m.contains(&format!("active on {addr}"))));
        assert!(logs.iter().any(|m| m.contains("stopped")));
    }

    #[tokio::test]
    #[serial]
    async fn test_builder_from_config_applies_every_setting() {
        let config = Config::from_yaml(
            r#"
policy: alwaysLive
whitelist:
  - "*.internal"
userId: user-42
signature: v1
replayTimeoutMs: 2000
listener:
  host: 127.0.0.1
"#,
        )
        .unwrap();
        let backend =
            InterceptionBackend::builder_from_config(&config, Arc::new(MemoryPersistence::new()))
                .await
                .unwrap()
                .upstream(Arc::new(StaticUpstream::default()))
                .build()
                .unwrap();

        assert_eq!(backend.policy(), ResolverPolicy::AlwaysLive);
        assert!(backend.whitelist().is_whitelisted("svc.internal", "svc.internal"));
        assert!(!backend.whitelist().is_whitelisted("localhost", "localhost"));
        assert_eq!(backend.inner.replay.timeout_ms, Some(2000));
        assert_eq!(backend.inner.listen_host, IpAddr::V4(Ipv4Addr::LOCALHOST));

        backend.activate().await.unwrap();
        let result = backend.intercept(get("http://api.example.com/items")).await.unwrap();
        backend.deactivate();

        let (parts, _) = get("http://api.example.com/items").into_parts();
        let request = SerializedRequest::from_parts(&parts, b"").unwrap();
        let rules = RedactionRules::default();
        let signed = fingerprint::fingerprint(
            &request,
            &FingerprintContext {
                story: &[],
                user_id: Some("user-42"),
                signature: Some("v1"),
            },
            &rules,
        );
        let unsigned = fingerprint::fingerprint(
            &request,
            &FingerprintContext {
                story: &[],
                user_id: Some("user-42"),
                signature: None,
            },
            &rules,
        );
        assert_eq!(result.fingerprint.as_ref(), Some(&signed));
        assert_ne!(signed, unsigned);
    }

    #[tokio::test]
    async fn test_from_config_with_missing_ca_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            "ca:\n  certPath: {}\n  keyPath: {}\n",
            dir.path().join("ca.pem").display(),
            dir.path().join("ca.key").display()
        );
        let config = Config::from_yaml(&yaml).unwrap();
        let err = InterceptionBackend::from_config(&config, Arc::new(MemoryPersistence::new()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, InterceptError::Configuration(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[serial]
    async fn test_concurrent_activation_binds_once() {
        let backend = backend(
            ResolverPolicy::default(),
            Arc::new(MemoryPersistence::new()),
            Arc::new(StaticUpstream::default()),
        )
        .await;

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let backend = backend.clone();
                tokio::spawn(async move { backend.activate().await.unwrap() })
            })
            .collect();
        let mut addrs = Vec::new();
        for task in tasks {
            addrs.push(task.await.unwrap());
        }

        let bound = backend.local_addr().unwrap();
        assert!(addrs.iter().all(|addr| *addr == bound));
        backend.deactivate();
        assert!(!backend.is_active());
    }

    #[test]
    fn test_listener_request_is_origin_form_without_hop_by_hop() {
        let (parts, _) = Request::builder()
            .method("POST")
            .uri("https://api.example.com:8443/v1/users?x=1")
            .header("connection", "keep-alive")
            .header("content-length", "2")
            .header("x-trace", "abc")
            .body(())
            .unwrap()
            .into_parts();
        let serialized = SerializedRequest::from_parts(&parts, b"{}").unwrap();
        let request = listener_request(&serialized, &parts, Bytes::from_static(b"{}")).unwrap();

        assert_eq!(request.uri(), "/v1/users?x=1");
        assert_eq!(request.headers()[HOST], "api.example.com:8443");
        assert_eq!(request.headers()["x-trace"], "abc");
        assert!(request.headers().get("connection").is_none());
        assert!(request.headers().get(CONTENT_LENGTH).is_none());
        assert_eq!(
            serialized.headers.get("x-trace"),
            Some(&OneOrMany::One("abc".to_string()))
        );
    }
}
