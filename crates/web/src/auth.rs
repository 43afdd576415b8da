//! Identity store, login/logout, and the bearer-token middleware.
//!
//! Tokens are HS256-signed JWTs, but a server-side session entry in the
//! cache is the authority for "still valid": the middleware checks both, and
//! extends the session TTL on every authenticated request.

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use flashboard_common::{Error, Result, User};

use crate::cache::Cache;

const SESSION_TTL_SECS: u64 = 24 * 60 * 60;
const USER_KEY_PREFIX: &str = "user:";

/// JWT claims carried by a bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: i64,
    pub username: String,
    pub exp: i64,
}

/// Identity attached to the request after the middleware accepts it.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: i64,
    pub username: String,
    /// Raw bearer token, needed to name the session key on logout.
    pub token: String,
}

#[derive(Clone)]
pub struct AuthService {
    cache: Cache,
    jwt_secret: String,
}

impl AuthService {
    pub fn new(cache: Cache, jwt_secret: String) -> Self {
        Self { cache, jwt_secret }
    }

    /// Create the default admin record on first boot.
    pub async fn init_admin(&self) -> Result<()> {
        let key = user_key("admin");
        if self.cache.exists(&key).await? {
            return Ok(());
        }
        let hash = hash_password("admin".to_string()).await?;
        let user = User {
            id: 1,
            username: "admin".to_string(),
            password_hash: hash,
        };
        self.cache.set_json(&key, &user).await?;
        info!("default admin user created");
        Ok(())
    }

    /// Validate credentials and issue a bearer token with a 24h session.
    pub async fn login(&self, username: &str, password: &str) -> Result<String> {
        validate_input(username)?;
        validate_input(password)?;

        let user: User = match self.cache.get_json(&user_key(username)).await? {
            Some(u) => u,
            None => {
                warn!("failed login for '{username}': user not found");
                return Err(Error::Unauthenticated("Invalid credentials".to_string()));
            }
        };

        // The password is verified as received, untrimmed.
        if !verify_password(password.to_string(), user.password_hash.clone()).await? {
            warn!("failed login for '{username}': invalid password");
            return Err(Error::Unauthenticated("Invalid credentials".to_string()));
        }

        let token = issue_token(&self.jwt_secret, user.id, &user.username)?;
        self.cache
            .set_ex(
                &session_key(user.id, &token),
                &user.id.to_string(),
                SESSION_TTL_SECS,
            )
            .await?;

        info!("successful login for user: {username}");
        Ok(token)
    }

    /// Delete the session key. Idempotent; a delete failure is logged only.
    pub async fn logout(&self, user_id: i64, token: &str) {
        if let Err(e) = self.cache.del(&session_key(user_id, token)).await {
            warn!("failed to delete session for user {user_id}: {e}");
        }
        info!("user {user_id} logged out");
    }

    /// Rehash and persist a new password for the user with the given id.
    ///
    /// The store is primary-indexed by username, so this scans `user:*`.
    pub async fn change_password(&self, user_id: i64, new_password: &str) -> Result<()> {
        validate_input(new_password)?;

        for key in self.cache.keys("user:*").await? {
            let mut user: User = match self.cache.get_json(&key).await {
                Ok(Some(u)) => u,
                Ok(None) => continue,
                Err(e) => {
                    warn!("skipping unreadable user record {key}: {e}");
                    continue;
                }
            };
            if user.id == user_id {
                user.password_hash = hash_password(new_password.to_string()).await?;
                self.cache.set_json(&key, &user).await?;
                info!("password changed for user: {}", user.username);
                return Ok(());
            }
        }

        warn!("user {user_id} not found for password change");
        Err(Error::UserNotFound)
    }

    /// Full token check: signature, claims shape, and server-side session.
    /// Extends the session TTL on success (sliding expiration).
    pub async fn authenticate(&self, token: &str) -> Result<AuthUser> {
        let claims = decode_claims(&self.jwt_secret, token)?;

        let key = session_key(claims.user_id, token);
        if !self.cache.exists(&key).await? {
            return Err(Error::Unauthenticated(
                "Session expired or invalid".to_string(),
            ));
        }
        self.cache
            .expire(&key, std::time::Duration::from_secs(SESSION_TTL_SECS))
            .await;

        Ok(AuthUser {
            user_id: claims.user_id,
            username: claims.username,
            token: token.to_string(),
        })
    }
}

/// Middleware that rejects requests without a valid bearer token and a live
/// session, and attaches the `AuthUser` extension otherwise.
pub async fn require_auth(
    State(auth): State<AuthService>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::to_string);

    let token = match token {
        Some(t) => t,
        None => {
            return Error::Unauthenticated("Missing or invalid Authorization header".to_string())
                .into_response()
        }
    };

    match auth.authenticate(&token).await {
        Ok(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(e) => e.into_response(),
    }
}

/// Trimmed length must be 3..=50 characters.
pub fn validate_input(input: &str) -> Result<()> {
    let trimmed = input.trim();
    if trimmed.len() < 3 || trimmed.len() > 50 {
        return Err(Error::InvalidInput(format!(
            "input must be between 3 and 50 characters, got: {trimmed}"
        )));
    }
    Ok(())
}

fn user_key(username: &str) -> String {
    format!("{USER_KEY_PREFIX}{username}")
}

fn session_key(user_id: i64, token: &str) -> String {
    format!("session:user:{user_id}:{token}")
}

fn issue_token(secret: &str, user_id: i64, username: &str) -> Result<String> {
    let claims = Claims {
        user_id,
        username: username.to_string(),
        exp: (Utc::now() + chrono::Duration::hours(24)).timestamp(),
    };
    Ok(jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?)
}

fn decode_claims(secret: &str, token: &str) -> Result<Claims> {
    // Validation pinned to HS256: tokens signed with any other algorithm are
    // rejected before the signature is even checked.
    let data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )?;
    Ok(data.claims)
}

/// bcrypt is deliberately slow; keep it off the async workers.
async fn hash_password(password: String) -> Result<String> {
    tokio::task::spawn_blocking(move || bcrypt::hash(password, bcrypt::DEFAULT_COST))
        .await
        .map_err(|e| Error::Internal(format!("hash task failed: {e}")))?
        .map_err(Error::from)
}

async fn verify_password(password: String, hash: String) -> Result<bool> {
    tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
        .await
        .map_err(|e| Error::Internal(format!("verify task failed: {e}")))?
        .map_err(Error::from)
}
