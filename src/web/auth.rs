//! Bearer-token authentication (HS256 JWT) and the login endpoints.

use crate::concurrency::MutationOutcome;
use crate::core::Document;
use crate::model::{Actor, ROLE_ADMIN, ROLE_VIEWER, Record, User};
use crate::repository::Store;
use crate::web::state::AppState;
use crate::web::{Result as WebResult, WebError};
use anyhow::Context;
use axum::Json;
use axum::extract::{Extension, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

const INVALID_CREDENTIALS_MESSAGE: &str = "invalid email or password";
const TOKEN_REQUIRED_MESSAGE: &str = "authorization bearer token is required";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub role: String,
    pub exp: i64,
}

impl From<Claims> for Actor {
    fn from(claims: Claims) -> Self {
        Actor {
            id: claims.sub,
            email: claims.email,
            display_name: claims.name,
            role: claims.role,
        }
    }
}

pub struct AuthSettings {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
    required: bool,
}

impl AuthSettings {
    pub fn new(secret: &str, ttl_minutes: i64, required: bool) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl: Duration::minutes(ttl_minutes.max(1)),
            required,
        }
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn issue(&self, user: &Record<User>, now: DateTime<Utc>) -> WebResult<String> {
        let claims = Claims {
            sub: user.id.clone(),
            email: user.fields.email.clone(),
            name: user.fields.display_name.clone(),
            role: user.fields.role.clone(),
            exp: (now + self.ttl).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|err| WebError::Internal(format!("failed to sign token: {err}")))
    }

    pub fn verify(&self, token: &str) -> WebResult<Actor> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::new(Algorithm::HS256))
            .map_err(|err| {
                warn!(error = %err, "rejected bearer token");
                WebError::Unauthorized("invalid or expired token".to_string())
            })?;
        Ok(data.claims.into())
    }
}

/// Attaches the caller's [`Actor`] to the request. Anonymous requests pass
/// only when authentication is optional.
pub async fn authenticate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> WebResult<Response> {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);

    match token {
        Some(token) => {
            let actor = state.auth.verify(token)?;
            request.extensions_mut().insert(actor);
        }
        None if state.auth.is_required() => {
            return Err(WebError::Unauthorized(TOKEN_REQUIRED_MESSAGE.to_string()));
        }
        None => {}
    }

    Ok(next.run(request).await)
}

/// Viewers are read-only; only admins manage users.
pub fn authorize_write(actor: Option<&Actor>, managing_users: bool) -> WebResult<()> {
    let Some(actor) = actor else {
        return Ok(());
    };
    if actor.role == ROLE_VIEWER {
        return Err(WebError::Forbidden("viewers cannot modify records".to_string()));
    }
    if managing_users && actor.role != ROLE_ADMIN {
        return Err(WebError::Forbidden("only admins can manage users".to_string()));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: Document,
}

pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> WebResult<Json<LoginResponse>> {
    let email = payload.email.trim();
    let user = state
        .repository::<User>()
        .list(None)
        .await?
        .records
        .into_iter()
        .find(|user| user.fields.email.eq_ignore_ascii_case(email));

    let Some(user) = user else {
        return Err(WebError::Unauthorized(INVALID_CREDENTIALS_MESSAGE.to_string()));
    };

    let hashed = user.fields.clone();
    let password = payload.password;
    let verified = tokio::task::spawn_blocking(move || hashed.verify_password(&password))
        .await
        .map_err(|err| WebError::Internal(err.to_string()))?;
    if !verified {
        warn!(email, "failed login");
        return Err(WebError::Unauthorized(INVALID_CREDENTIALS_MESSAGE.to_string()));
    }

    let token = state.auth.issue(&user, Utc::now())?;
    let public = user
        .to_public()
        .map_err(|err| WebError::Internal(err.to_string()))?;
    info!(user = %user.id, "login succeeded");

    Ok(Json(LoginResponse {
        token,
        user: public,
    }))
}

pub async fn me(actor: Option<Extension<Actor>>) -> WebResult<Json<Actor>> {
    match actor {
        Some(Extension(actor)) => Ok(Json(actor)),
        None => Err(WebError::Unauthorized(TOKEN_REQUIRED_MESSAGE.to_string())),
    }
}

/// Creates the first admin account when the users collection is empty.
pub async fn seed_admin(
    store: &Store,
    email: &str,
    password: &str,
) -> anyhow::Result<Option<Record<User>>> {
    let users = store.repository::<User>();
    if !users
        .list(None)
        .await
        .context("failed to read users")?
        .records
        .is_empty()
    {
        return Ok(None);
    }

    let input = json!({
        "email": email,
        "displayName": "Administrator",
        "role": ROLE_ADMIN,
        "password": password,
    });
    let input = input
        .as_object()
        .cloned()
        .context("admin payload is not an object")?;

    let outcome = users
        .create(input, None)
        .await
        .context("failed to store admin user")?;
    let record = match outcome {
        MutationOutcome::Applied(applied) => applied.record,
        MutationOutcome::Invalid(reason) => {
            anyhow::bail!("admin account rejected: {reason}")
        }
        other => anyhow::bail!("unexpected outcome while seeding admin: {other:?}"),
    };

    info!(id = %record.id, email, "seeded admin user");
    Ok(Some(record))
}
