//! Bearer-token authentication for tokens minted by the identity provider.
//!
//! Services never issue tokens; they only verify them. The verified claims are
//! stored in request extensions by [`auth_middleware`] and read back by the
//! [`AuthUser`] / [`AdminUser`] extractors.

use crate::error::AppError;
use crate::middleware::rate_limit::RateLimitKey;
use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// How incoming tokens are checked.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenSettings {
    /// Expected `iss` claim.
    pub issuer: String,
    /// Expected `aud` claim (the project id for the identity provider).
    pub audience: String,
    /// Shared secret for HS256 tokens. Mutually exclusive with `public_key_pem`.
    pub hmac_secret: Option<Secret<String>>,
    /// PEM-encoded RSA public key for RS256 tokens.
    pub public_key_pem: Option<String>,
    /// Clock skew tolerated on `exp`/`iat`, in seconds.
    #[serde(default = "default_leeway")]
    pub leeway_seconds: u64,
}

fn default_leeway() -> u64 {
    30
}

/// Claims the services rely on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id).
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    /// Custom claim set for operators of the admin panel.
    #[serde(default)]
    pub admin: bool,
    pub exp: i64,
    #[serde(default)]
    pub iat: i64,
    pub iss: String,
    pub aud: String,
}

/// Verifies bearer tokens against [`TokenSettings`].
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(settings: &TokenSettings) -> Result<Self, AppError> {
        let (key, algorithm) = match (&settings.hmac_secret, &settings.public_key_pem) {
            (Some(secret), None) => (
                DecodingKey::from_secret(secret.expose_secret().as_bytes()),
                Algorithm::HS256,
            ),
            (None, Some(pem)) => (
                DecodingKey::from_rsa_pem(pem.as_bytes()).map_err(|e| {
                    AppError::ConfigError(anyhow::anyhow!("Invalid RSA public key: {}", e))
                })?,
                Algorithm::RS256,
            ),
            _ => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Exactly one of hmac_secret or public_key_pem must be configured"
                )));
            }
        };

        let mut validation = Validation::new(algorithm);
        validation.set_issuer(&[settings.issuer.as_str()]);
        validation.set_audience(&[settings.audience.as_str()]);
        validation.leeway = settings.leeway_seconds;

        Ok(Self { key, validation })
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AppError> {
        let data = decode::<Claims>(token, &self.key, &self.validation)?;
        Ok(data.claims)
    }
}

/// Authenticated caller.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub email: Option<String>,
    pub is_admin: bool,
}

impl From<Claims> for AuthUser {
    fn from(claims: Claims) -> Self {
        Self {
            user_id: claims.sub,
            email: claims.email,
            is_admin: claims.admin,
        }
    }
}

impl RateLimitKey for AuthUser {
    fn rate_limit_key(&self) -> String {
        self.user_id.clone()
    }
}

/// Reject requests without a valid bearer token; store the caller otherwise.
pub async fn auth_middleware(
    State(verifier): State<Arc<TokenVerifier>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            AppError::Unauthorized(anyhow::anyhow!("Missing or invalid Authorization header"))
        })?;

    let claims = verifier.verify(token).map_err(|e| {
        tracing::debug!(error = %e, "Rejected bearer token");
        AppError::Unauthorized(anyhow::anyhow!("Invalid or expired token"))
    })?;

    let user = AuthUser::from(claims);
    tracing::Span::current().record("user_id", user.user_id.as_str());
    req.extensions_mut().insert(user);

    Ok(next.run(req).await)
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthUser>()
            .cloned()
            .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Authentication required")))
    }
}

/// Authenticated caller carrying the `admin` claim.
#[derive(Debug, Clone)]
pub struct AdminUser(pub AuthUser);

#[axum::async_trait]
impl<S> FromRequestParts<S> for AdminUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let user = AuthUser::from_request_parts(parts, state).await?;
        if !user.is_admin {
            tracing::warn!(user_id = %user.user_id, "Non-admin attempted admin operation");
            return Err(AppError::Forbidden(anyhow::anyhow!("Admin access required")));
        }
        Ok(AdminUser(user))
    }
}
