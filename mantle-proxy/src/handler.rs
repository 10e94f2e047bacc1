//! The workload-proxy HTTP handler: host-pattern dispatch, access
//! validation and request forwarding.
use crate::auth::{
    self, Access, AccessPolicy, KeyProvider, PUBLIC_KEY_ID_COOKIE, PUBLIC_KEY_SIGNATURE_COOKIE,
};
use crate::dialer::dial;
use crate::reconciler::Reconciler;
use crate::redirect::RedirectSigner;
use crate::{Error, Result};
use bytes::Bytes;
use http::header::{COOKIE, HOST, LOCATION};
use http::{HeaderMap, Request, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Dial budget for proxied requests (health checks use their own, shorter
/// one).
const UPSTREAM_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
/// How long to wait for upstream response headers.
const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(10);

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// Apex domain requests arrive under, e.g. `omni.siderolabs.io`.
    pub main_domain: String,
    /// Subdomain carrying workload hosts in the current scheme, e.g.
    /// `proxy-us`.
    pub proxy_subdomain: String,
    /// Path on the main domain that starts an authentication flow.
    pub authenticate_path: String,
    /// Path shown when access is rejected.
    pub forbidden_path: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            main_domain: String::new(),
            proxy_subdomain: "proxy".into(),
            authenticate_path: "/authenticate".into(),
            forbidden_path: "/forbidden".into(),
        }
    }
}

/// What the handler decided about one request.
pub enum Handled {
    /// Served (proxied or redirected) by the workload proxy.
    Response(Response<ProxyBody>),
    /// The host did not match a workload pattern; the next handler owns it.
    PassThrough(Request<Incoming>),
}

/// The host-multiplexed workload proxy front end.
#[derive(Clone)]
pub struct WorkloadProxy {
    reconciler: Reconciler,
    keys: Arc<dyn KeyProvider>,
    policy: Arc<dyn AccessPolicy>,
    signer: RedirectSigner,
    config: ProxyConfig,
}

impl WorkloadProxy {
    #[must_use]
    pub fn new(
        reconciler: Reconciler,
        keys: Arc<dyn KeyProvider>,
        policy: Arc<dyn AccessPolicy>,
        signer: RedirectSigner,
        config: ProxyConfig,
    ) -> Self {
        Self {
            reconciler,
            keys,
            policy,
            signer,
            config,
        }
    }

    /// Dispatches one request. Hosts that match neither the current nor the
    /// legacy workload pattern are handed back untouched.
    pub async fn handle(&self, req: Request<Incoming>) -> Result<Handled> {
        let host = request_host(&req);
        let Some(alias) = self.extract_alias(&host) else {
            return Ok(Handled::PassThrough(req));
        };
        let Some((lb, cluster)) = self.reconciler.lookup(&alias) else {
            return Err(Error::UnknownAlias(alias));
        };

        let key_id = cookie_value(req.headers(), PUBLIC_KEY_ID_COOKIE);
        let signature = cookie_value(req.headers(), PUBLIC_KEY_SIGNATURE_COOKIE);
        let access = auth::validate(
            self.keys.as_ref(),
            self.policy.as_ref(),
            key_id.as_deref(),
            signature.as_deref(),
            &cluster,
        )
        .await;
        match access {
            Access::Granted { identity, role } => {
                debug!(%identity, ?role, %cluster, alias = %alias, "workload request granted");
            }
            Access::Unauthenticated => {
                return self.redirect_to_authenticate(&req).map(Handled::Response);
            }
            Access::Denied { reason } => {
                warn!(%cluster, alias = %alias, reason = %reason, "workload request denied");
                return redirect(&format!(
                    "https://{}{}",
                    self.config.main_domain, self.config.forbidden_path
                ))
                .map(Handled::Response);
            }
        }

        let Some(upstream) = lb.pick_address() else {
            return Err(Error::NoUpstream { cluster, alias });
        };
        self.forward(req, &upstream).await.map(Handled::Response)
    }

    /// Pulls the workload alias out of a request host.
    ///
    /// Current form: `<alias>-<instance>.<proxy-subdomain>.<main-domain>`;
    /// legacy form: `p-<alias>-<instance>.<main-domain>`. Matching is
    /// case-sensitive on the alias.
    fn extract_alias(&self, host: &str) -> Option<String> {
        let current_suffix = format!(
            ".{}.{}",
            self.config.proxy_subdomain, self.config.main_domain
        );
        if let Some(label) = host.strip_suffix(current_suffix.as_str()) {
            if !label.is_empty() && !label.contains('.') {
                if let Some((alias, _instance)) = label.rsplit_once('-') {
                    return Some(alias.to_string());
                }
            }
            return None;
        }
        let legacy_suffix = format!(".{}", self.config.main_domain);
        if let Some(label) = host.strip_suffix(legacy_suffix.as_str()) {
            if let Some(rest) = label.strip_prefix("p-") {
                if !rest.contains('.') {
                    if let Some((alias, _instance)) = rest.rsplit_once('-') {
                        return Some(alias.to_string());
                    }
                }
            }
        }
        None
    }

    fn redirect_to_authenticate(&self, req: &Request<Incoming>) -> Result<Response<ProxyBody>> {
        let original = format!(
            "https://{}{}",
            request_host(req),
            req.uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/")
        );
        let signed = self.signer.encode(&original);
        let encoded: String = form_urlencoded::byte_serialize(signed.as_bytes()).collect();
        redirect(&format!(
            "https://{}{}?redirect={}",
            self.config.main_domain, self.config.authenticate_path, encoded
        ))
    }

    async fn forward(
        &self,
        req: Request<Incoming>,
        upstream: &str,
    ) -> Result<Response<ProxyBody>> {
        let stream = dial(upstream, UPSTREAM_DIAL_TIMEOUT).await?;
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
        // Client disconnects drop this whole future, which tears the
        // upstream connection down with it.
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!(error = %err, "upstream connection closed");
            }
        });
        let response = tokio::time::timeout(RESPONSE_HEADER_TIMEOUT, sender.send_request(req))
            .await
            .map_err(|_| Error::UpstreamTimeout)??;
        Ok(response.map(BodyExt::boxed))
    }
}

fn request_host(req: &Request<Incoming>) -> String {
    req.headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .split(':')
        .next()
        .unwrap_or_default()
        .to_string()
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let Ok(raw) = header.to_str() else { continue };
        for pair in raw.split(';') {
            if let Some((key, value)) = pair.trim().split_once('=') {
                if key == name {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

fn redirect(location: &str) -> Result<Response<ProxyBody>> {
    Ok(Response::builder()
        .status(StatusCode::SEE_OTHER)
        .header(LOCATION, location)
        .body(empty_body())?)
}

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}
