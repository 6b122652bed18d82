// Capability token service.
//
// A capability token grants narrow, resource-scoped access: one
// document, one session, one access level. It is the only admission
// mechanism for the live channel, which lets a form be shared (embeds,
// collaborator invites, anonymous respondents) without a full login
// session. Tokens are stateless; lifetime is bounded by `exp`.

use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

use formsync_common::types::{AccessLevel, ResourceKind};

pub const CAPABILITY_TOKEN_TTL_SECONDS: i64 = 2 * 60 * 60;

const TOKEN_ISSUER: &str = "formsync-relay";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenClaims {
    iss: String,
    sub: String,
    resource_id: Uuid,
    resource_kind: ResourceKind,
    connection_id: Uuid,
    access_level: AccessLevel,
    iat: i64,
    exp: i64,
}

/// Validated claim set carried by a capability token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityClaims {
    pub user_id: Uuid,
    pub resource_id: Uuid,
    pub resource_kind: ResourceKind,
    pub connection_id: Uuid,
    pub access_level: AccessLevel,
}

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("capability token signature or expiry check failed")]
    InvalidSignature,
    #[error("capability token grants {granted:?}, which is not in the required set")]
    InsufficientAccess { granted: AccessLevel },
    #[error("capability token claims are malformed: {0}")]
    MalformedClaims(String),
    #[error("failed to sign capability token: {0}")]
    Signing(#[from] anyhow::Error),
}

#[derive(Clone)]
pub struct CapabilityTokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl CapabilityTokenService {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < 32 {
            anyhow::bail!("capability token secret must be at least 32 characters long");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub", "iss"]);
        validation.set_issuer(&[TOKEN_ISSUER]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    /// Issue a token scoped to one resource for one connection.
    pub fn issue(
        &self,
        resource_id: Uuid,
        resource_kind: ResourceKind,
        user_id: Uuid,
        connection_id: Uuid,
        access_level: AccessLevel,
    ) -> Result<String, CapabilityError> {
        self.issue_at(
            resource_id,
            resource_kind,
            user_id,
            connection_id,
            access_level,
            current_unix_timestamp()?,
        )
    }

    fn issue_at(
        &self,
        resource_id: Uuid,
        resource_kind: ResourceKind,
        user_id: Uuid,
        connection_id: Uuid,
        access_level: AccessLevel,
        issued_at: i64,
    ) -> Result<String, CapabilityError> {
        let claims = TokenClaims {
            iss: TOKEN_ISSUER.to_string(),
            sub: user_id.to_string(),
            resource_id,
            resource_kind,
            connection_id,
            access_level,
            iat: issued_at,
            exp: issued_at + CAPABILITY_TOKEN_TTL_SECONDS,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|error| CapabilityError::Signing(error.into()))
    }

    /// Validate a token against a required access-level set.
    ///
    /// The check passes iff the token's level is a member of
    /// `required_levels` (e.g. [`AccessLevel::EDIT_LEVELS`]).
    pub fn validate(
        &self,
        token: &str,
        required_levels: &[AccessLevel],
    ) -> Result<CapabilityClaims, CapabilityError> {
        let claims = decode::<TokenClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|error| match error.kind() {
                ErrorKind::Json(json_error) => {
                    CapabilityError::MalformedClaims(json_error.to_string())
                }
                ErrorKind::MissingRequiredClaim(claim) => {
                    CapabilityError::MalformedClaims(format!("missing claim '{claim}'"))
                }
                _ => CapabilityError::InvalidSignature,
            })?
            .claims;

        if !required_levels.contains(&claims.access_level) {
            return Err(CapabilityError::InsufficientAccess { granted: claims.access_level });
        }

        let user_id = Uuid::parse_str(&claims.sub).map_err(|_| {
            CapabilityError::MalformedClaims(format!("subject '{}' is not a UUID", claims.sub))
        })?;

        Ok(CapabilityClaims {
            user_id,
            resource_id: claims.resource_id,
            resource_kind: claims.resource_kind,
            connection_id: claims.connection_id,
            access_level: claims.access_level,
        })
    }
}

fn current_unix_timestamp() -> Result<i64, CapabilityError> {
    let duration = SystemTime::now().duration_since(UNIX_EPOCH).map_err(|error| {
        CapabilityError::Signing(anyhow::anyhow!("system clock is before unix epoch: {error}"))
    })?;

    i64::try_from(duration.as_secs())
        .map_err(|_| CapabilityError::Signing(anyhow::anyhow!("unix timestamp overflow")))
}
