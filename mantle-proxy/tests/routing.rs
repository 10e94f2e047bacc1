//! End-to-end workload routing: a request with valid cookies lands on one of
//! the cluster's upstreams, one without cookies is sent to authenticate.
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use ed25519_dalek::{Signer, SigningKey};
use http::header::{COOKIE, HOST, LOCATION};
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use mantle_proxy::{
    AccessPolicy, Handled, KeyProvider, ProxyConfig, Reconciler, ReconcilerConfig, RegisteredKey,
    RedirectSigner, Role, WorkloadProxy,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

struct OneKey(RegisteredKey);

#[async_trait]
impl KeyProvider for OneKey {
    async fn public_key(&self, id: &str) -> Option<RegisteredKey> {
        (id == self.0.id).then(|| self.0.clone())
    }
}

struct ReaderEverywhere;

#[async_trait]
impl AccessPolicy for ReaderEverywhere {
    async fn role_in_cluster(&self, _: &str, _: Option<Role>, _: &str) -> Role {
        Role::Reader
    }
}

/// Serves a constant body on an ephemeral port, returning its address.
async fn upstream(body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let service = service_fn(move |_req: Request<Incoming>| async move {
                    Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from_static(
                        body.as_bytes(),
                    ))))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

/// Runs the workload proxy on an ephemeral port.
async fn serve_proxy(proxy: WorkloadProxy) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let proxy = proxy.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let proxy = proxy.clone();
                    async move {
                        match proxy.handle(req).await {
                            Ok(Handled::Response(response)) => Ok::<_, hyper::Error>(response),
                            Ok(Handled::PassThrough(_)) => Ok(Response::builder()
                                .status(StatusCode::NOT_FOUND)
                                .body(
                                    Empty::<Bytes>::new()
                                        .map_err(|never| match never {})
                                        .boxed(),
                                )
                                .unwrap()),
                            Err(_) => Ok(Response::builder()
                                .status(StatusCode::BAD_GATEWAY)
                                .body(
                                    Empty::<Bytes>::new()
                                        .map_err(|never| match never {})
                                        .boxed(),
                                )
                                .unwrap()),
                        }
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

async fn get(
    proxy_addr: &str,
    host: &str,
    cookies: Option<(&str, &str)>,
) -> Response<Incoming> {
    let stream = TcpStream::connect(proxy_addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake::<
        _,
        http_body_util::combinators::BoxBody<Bytes, std::convert::Infallible>,
    >(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);
    let mut builder = Request::builder().uri("/").header(HOST, host);
    if let Some((key_id, signature)) = cookies {
        builder = builder.header(
            COOKIE,
            format!("publicKeyId={key_id}; publicKeyIdSignatureBase64={signature}"),
        );
    }
    let req = builder
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .unwrap();
    sender.send_request(req).await.unwrap()
}

fn test_proxy(reconciler: Reconciler) -> WorkloadProxy {
    let signing = SigningKey::from_bytes(&[42u8; 32]);
    let key = RegisteredKey {
        id: "key-1".into(),
        verifying_key: signing.verifying_key(),
        expiration: None,
        role_claim: None,
        identity: "demo@example.org".into(),
    };
    WorkloadProxy::new(
        reconciler,
        Arc::new(OneKey(key)),
        Arc::new(ReaderEverywhere),
        RedirectSigner::generate(),
        ProxyConfig {
            main_domain: "omni.siderolabs.io".into(),
            proxy_subdomain: "proxy-us".into(),
            ..ProxyConfig::default()
        },
    )
}

fn signature() -> String {
    let signing = SigningKey::from_bytes(&[42u8; 32]);
    BASE64.encode(signing.sign(b"key-1").to_bytes())
}

#[tokio::test]
async fn valid_cookies_reach_a_cluster_upstream() {
    let u1 = upstream("u1").await;
    let u2 = upstream("u2").await;
    let reconciler = Reconciler::new(ReconcilerConfig {
        lazy: true,
        ..ReconcilerConfig::default()
    });
    let mut map = BTreeMap::new();
    map.insert("alias1".to_string(), vec![u1, u2]);
    map.insert("alias2".to_string(), vec!["127.0.0.1:9".to_string()]);
    reconciler.reconcile("cluster1", &map);

    let proxy_addr = serve_proxy(test_proxy(reconciler)).await;
    let signature = signature();
    let response = get(
        &proxy_addr,
        "alias1-demo.proxy-us.omni.siderolabs.io",
        Some(("key-1", &signature)),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert!(body.as_ref() == b"u1" || body.as_ref() == b"u2");
}

#[tokio::test]
async fn missing_cookies_redirect_to_authenticate() {
    let reconciler = Reconciler::new(ReconcilerConfig {
        lazy: true,
        ..ReconcilerConfig::default()
    });
    let mut map = BTreeMap::new();
    map.insert("alias1".to_string(), vec!["127.0.0.1:9".to_string()]);
    reconciler.reconcile("cluster1", &map);

    let proxy_addr = serve_proxy(test_proxy(reconciler)).await;
    let response = get(&proxy_addr, "alias1-demo.proxy-us.omni.siderolabs.io", None).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let location = response.headers()[LOCATION].to_str().unwrap().to_string();
    assert!(location.starts_with("https://omni.siderolabs.io/authenticate?redirect="));
    // The redirect parameter is a signed, versioned payload.
    assert!(location.contains("redirect=v1%3A"));
}

#[tokio::test]
async fn unknown_hosts_pass_through() {
    let reconciler = Reconciler::new(ReconcilerConfig {
        lazy: true,
        ..ReconcilerConfig::default()
    });
    let proxy_addr = serve_proxy(test_proxy(reconciler)).await;
    let response = get(&proxy_addr, "omni.siderolabs.io", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
