use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::IpAddr;

use crate::{
    error::ApiError,
    extractors::RateKey,
    services::PodService,
    utils::validation::is_valid_pod_name,
    AppState,
};

/// What the request `Host` resolved to.
#[derive(Debug, Clone)]
pub enum HostContext {
    MainDomain,
    Pod(String),
}

/// Resolve the request host to a pod identity.
///
/// Order: main-domain exact match (with an `X-Pod-Name` override for
/// localhost development), `<label>.<mainDomain>` subdomain, custom-domain
/// lookup through `.config/domains`, configured root pod. Anything else is
/// a 404.
pub async fn resolve_host(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let ip = extract_client_ip(&request);
    request.extensions_mut().insert(RateKey(format!("ip:{}", ip)));

    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(strip_port)
        .unwrap_or("")
        .to_ascii_lowercase();

    let main_domain = state.settings.domain.main_domain.as_str();

    let context = if let Some(pod) = dev_pod_override(&request, &host) {
        if is_valid_pod_name(&pod) {
            HostContext::Pod(pod)
        } else {
            return ApiError::InvalidPodId(pod).into_response();
        }
    } else {
        match classify_host(&host, main_domain) {
            HostMatch::Main => HostContext::MainDomain,
            HostMatch::Subdomain(label) => HostContext::Pod(label.to_string()),
            HostMatch::Invalid => return ApiError::PodNotFound(host).into_response(),
            HostMatch::Unknown => {
                let pods = PodService::new(state.db.clone(), state.cache.clone());
                match pods.find_by_domain(&host).await {
                    Ok(Some(pod)) => HostContext::Pod(pod),
                    Ok(None) => match &state.settings.domain.root_pod {
                        Some(root) => HostContext::Pod(root.clone()),
                        None => return ApiError::PodNotFound(host).into_response(),
                    },
                    Err(e) => return e.into_response(),
                }
            }
        }
    };

    request.extensions_mut().insert(context);
    next.run(request).await
}

/// How a host relates to the configured main domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostMatch<'a> {
    Main,
    /// One valid pod label directly under the main domain.
    Subdomain(&'a str),
    /// Under the main domain but not a usable pod label.
    Invalid,
    /// Unrelated host — candidate for the custom-domain map.
    Unknown,
}

fn classify_host<'a>(host: &'a str, main_domain: &str) -> HostMatch<'a> {
    if host == main_domain {
        return HostMatch::Main;
    }
    let Some(label) = host
        .strip_suffix(main_domain)
        .and_then(|p| p.strip_suffix('.'))
    else {
        return HostMatch::Unknown;
    };
    if !label.contains('.') && is_valid_pod_name(label) {
        HostMatch::Subdomain(label)
    } else {
        HostMatch::Invalid
    }
}

/// `X-Pod-Name` simulates the subdomain during localhost development.
fn dev_pod_override(request: &Request, host: &str) -> Option<String> {
    if host != "localhost" && !host.starts_with("127.") {
        return None;
    }
    request
        .headers()
        .get("x-pod-name")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn strip_port(host: &str) -> &str {
    host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host)
}

/// Extract the client IP address from the request.
///
/// Checks (in order):
/// 1. `X-Forwarded-For` header (first entry — set by reverse proxies)
/// 2. `X-Real-Ip` header
/// 3. The connected peer address from the connection info
/// 4. Falls back to 127.0.0.1
fn extract_client_ip(request: &Request) -> IpAddr {
    if let Some(xff) = request.headers().get("x-forwarded-for") {
        if let Ok(xff_str) = xff.to_str() {
            if let Some(first_ip) = xff_str.split(',').next() {
                if let Ok(ip) = first_ip.trim().parse::<IpAddr>() {
                    return ip;
                }
            }
        }
    }

    if let Some(xri) = request.headers().get("x-real-ip") {
        if let Ok(xri_str) = xri.to_str() {
            if let Ok(ip) = xri_str.trim().parse::<IpAddr>() {
                return ip;
            }
        }
    }

    if let Some(connect_info) = request
        .extensions()
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
    {
        return connect_info.0.ip();
    }

    IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_main_domain_match() {
        assert_eq!(classify_host("webpods.dev", "webpods.dev"), HostMatch::Main);
    }

    #[test]
    fn test_subdomain_label() {
        assert_eq!(
            classify_host("alice.webpods.dev", "webpods.dev"),
            HostMatch::Subdomain("alice")
        );
    }

    #[test]
    fn test_nested_labels_rejected() {
        assert_eq!(
            classify_host("a.b.webpods.dev", "webpods.dev"),
            HostMatch::Invalid
        );
    }

    #[test]
    fn test_invalid_label_rejected() {
        assert_eq!(
            classify_host("Bad_Label.webpods.dev", "webpods.dev"),
            HostMatch::Invalid
        );
    }

    #[test]
    fn test_unrelated_host_is_unknown() {
        assert_eq!(classify_host("blog.example.com", "webpods.dev"), HostMatch::Unknown);
        // A host merely ending with the domain text is not a subdomain.
        assert_eq!(classify_host("evilwebpods.dev", "webpods.dev"), HostMatch::Unknown);
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("localhost:3000"), "localhost");
        assert_eq!(strip_port("alice.webpods.dev"), "alice.webpods.dev");
    }
}
