use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::{
    error::ApiError,
    extractors::{AuthenticatedUser, RateKey},
    middleware::host::HostContext,
    AppState,
};

/// Bearer-token claims issued by the external authorization server.
///
/// Global tokens carry no `pod` claim and are valid only on the main
/// domain; pod-scoped tokens are valid only when the claim matches the
/// resolved pod.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    #[serde(default)]
    pub pod: Option<String>,
    #[serde(rename = "type")]
    pub token_type: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub exp: i64,
    #[serde(default)]
    pub iat: Option<i64>,
}

/// Validate the bearer token, if any, and attach the principal.
///
/// Anonymous requests pass through; handlers decide whether a principal is
/// required. A present-but-invalid token always fails the request.
pub async fn authenticate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let bearer = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());

    let Some(token) = bearer else {
        return next.run(request).await;
    };

    let claims = match decode_token(token, &state.settings.auth.jwt_secret) {
        Ok(claims) => claims,
        Err(e) => return e.into_response(),
    };

    // A token's pod claim must agree with the resolved host: pod-scoped
    // tokens only work on their pod, global tokens only on the main domain.
    let host = request.extensions().get::<HostContext>().cloned();
    match (&host, &claims.pod) {
        (Some(HostContext::Pod(host_pod)), Some(token_pod)) if token_pod != host_pod => {
            return ApiError::PodMismatch {
                token_pod: token_pod.clone(),
                host_pod: host_pod.clone(),
            }
            .into_response();
        }
        (Some(HostContext::Pod(host_pod)), None) => {
            return ApiError::PodMismatch {
                token_pod: "<global>".to_string(),
                host_pod: host_pod.clone(),
            }
            .into_response();
        }
        (Some(HostContext::MainDomain), Some(token_pod)) => {
            return ApiError::PodMismatch {
                token_pod: token_pod.clone(),
                host_pod: state.settings.domain.main_domain.clone(),
            }
            .into_response();
        }
        _ => {}
    }

    let user = AuthenticatedUser {
        id: claims.sub,
        email: claims.email,
        name: claims.name,
    };
    request.extensions_mut().insert(RateKey(user.id.clone()));
    request.extensions_mut().insert(user);

    next.run(request).await
}

fn decode_token(token: &str, secret: &str) -> Result<TokenClaims, ApiError> {
    let validation = Validation::new(Algorithm::HS256);
    let data = decode::<TokenClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => ApiError::TokenExpired,
        _ => ApiError::InvalidToken(e.to_string()),
    })?;

    if data.claims.token_type != "access" {
        return Err(ApiError::InvalidToken(format!(
            "unexpected token type '{}'",
            data.claims.token_type
        )));
    }

    Ok(data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn sign(claims: &TokenClaims, secret: &str) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn claims(pod: Option<&str>, exp: i64) -> TokenClaims {
        TokenClaims {
            sub: "user-1".to_string(),
            pod: pod.map(str::to_string),
            token_type: "access".to_string(),
            email: Some("user@example.com".to_string()),
            name: None,
            exp,
            iat: None,
        }
    }

    fn far_future() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[test]
    fn test_valid_token_decodes() {
        let token = sign(&claims(Some("alice"), far_future()), "secret");
        let decoded = decode_token(&token, "secret").unwrap();
        assert_eq!(decoded.sub, "user-1");
        assert_eq!(decoded.pod.as_deref(), Some("alice"));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = sign(&claims(None, far_future()), "secret");
        assert!(matches!(
            decode_token(&token, "other"),
            Err(ApiError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_expired_token_rejected() {
        let token = sign(&claims(None, chrono::Utc::now().timestamp() - 120), "secret");
        assert!(matches!(
            decode_token(&token, "secret"),
            Err(ApiError::TokenExpired)
        ));
    }

    #[test]
    fn test_non_access_token_rejected() {
        let mut c = claims(None, far_future());
        c.token_type = "refresh".to_string();
        let token = sign(&c, "secret");
        assert!(matches!(
            decode_token(&token, "secret"),
            Err(ApiError::InvalidToken(_))
        ));
    }
}
