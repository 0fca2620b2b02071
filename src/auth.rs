use crate::db::poll::VoterId;
use crate::error::{PollError, PollResult};
use actix_web::{http::header, web, HttpRequest};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Claims we read from a caller's token. Tokens are minted elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> PollResult<VoterId> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|err| {
            debug!("Rejected token: {err}");
            PollError::Unauthenticated("Invalid or expired token".to_owned())
        })?;
        if data.claims.sub.trim().is_empty() {
            return Err(PollError::Unauthenticated("Token has no subject".to_owned()));
        }
        Ok(VoterId(data.claims.sub))
    }

    /// Identity of a caller that must be authenticated.
    pub fn authenticate(&self, req: &HttpRequest) -> PollResult<VoterId> {
        self.identify(req)?
            .ok_or_else(|| PollError::Unauthenticated("Missing bearer token".to_owned()))
    }

    /// Identity of a caller that may be anonymous. A token that is present
    /// but invalid is still an error.
    pub fn identify(&self, req: &HttpRequest) -> PollResult<Option<VoterId>> {
        match token(req) {
            Some(token) => self.verify(&token).map(Some),
            None => Ok(None),
        }
    }
}

/// `Authorization: Bearer` header first, then the `token` query parameter
/// browsers use for websocket handshakes.
fn token(req: &HttpRequest) -> Option<String> {
    let from_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_owned());
    from_header.or_else(|| {
        web::Query::<TokenQuery>::from_query(req.query_string())
            .ok()
            .and_then(|query| query.into_inner().token)
    })
}
