//! Source address pinning for gateway callbacks.
//!
//! Callback endpoints are reachable from the public internet, so beyond the
//! HMAC signature check we also pin the gateway's published egress ranges.
//! The client address comes from `x-forwarded-for` when the service sits
//! behind load balancers; `trusted_proxy_depth` says how many trailing chain
//! entries were appended by infrastructure we control. Everything the client
//! itself sent in that header is untrusted and ignored.

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::task::{Context, Poll};

use axum::extract::connect_info::ConnectInfo;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::future::BoxFuture;
use tower::{Layer, Service};

use crate::config::AllowedIps;

const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

#[derive(Clone, Debug)]
pub struct CallbackIpFilterLayer {
    allowlist: AllowedIps,
    proxy_depth: usize,
}

impl CallbackIpFilterLayer {
    pub fn new(allowlist: AllowedIps, proxy_depth: usize) -> Self {
        Self {
            allowlist,
            proxy_depth,
        }
    }
}

impl<S> Layer<S> for CallbackIpFilterLayer {
    type Service = CallbackIpFilter<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CallbackIpFilter {
            inner,
            allowlist: self.allowlist.clone(),
            proxy_depth: self.proxy_depth,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CallbackIpFilter<S> {
    inner: S,
    allowlist: AllowedIps,
    proxy_depth: usize,
}

impl<S, B> Service<Request<B>> for CallbackIpFilter<S>
where
    S: Service<Request<B>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let source = source_ip(req.headers(), req.extensions(), self.proxy_depth);

        if !permitted(source, &self.allowlist) {
            tracing::warn!(
                source_ip = ?source,
                path = %req.uri().path(),
                "rejected gateway callback from unlisted address"
            );
            let response = StatusCode::FORBIDDEN.into_response();
            return Box::pin(async move { Ok(response) });
        }

        let mut inner = self.inner.clone();
        Box::pin(async move { inner.call(req).await })
    }
}

/// An unresolvable source address passes only in bypass mode.
fn permitted(source: Option<IpAddr>, allowlist: &AllowedIps) -> bool {
    match source {
        Some(ip) => allowlist.permits(ip),
        None => matches!(allowlist, AllowedIps::Any),
    }
}

fn source_ip(
    headers: &HeaderMap,
    extensions: &axum::http::Extensions,
    proxy_depth: usize,
) -> Option<IpAddr> {
    if let Some(ip) = forwarded_for_ip(headers, proxy_depth) {
        return Some(ip);
    }

    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
}

/// Walks the `x-forwarded-for` chain back past our own proxies.
///
/// With depth N the last N entries belong to our infrastructure, so the
/// client is the entry just before them. A chain shorter than the depth
/// cannot have passed through our proxies and is ignored.
fn forwarded_for_ip(headers: &HeaderMap, proxy_depth: usize) -> Option<IpAddr> {
    let raw = headers.get(FORWARDED_FOR_HEADER)?.to_str().ok()?;

    let chain: Vec<IpAddr> = raw
        .split(',')
        .map(str::trim)
        .filter_map(parse_forwarded_entry)
        .collect();

    if chain.is_empty() || proxy_depth >= chain.len() {
        return None;
    }

    let index = chain.len().saturating_sub(1 + proxy_depth);
    chain.get(index).copied()
}

fn parse_forwarded_entry(value: &str) -> Option<IpAddr> {
    if let Ok(ip) = IpAddr::from_str(value) {
        return Some(ip);
    }

    // Some balancers append the port.
    if let Ok(addr) = SocketAddr::from_str(value) {
        return Some(addr.ip());
    }

    None
}
