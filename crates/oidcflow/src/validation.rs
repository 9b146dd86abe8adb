//! ID token validation (OpenID Connect Core 1.0, section 3.1.3.7).
//!
//! [`TokenValidator`] runs the checks in a fixed order and stops at the
//! first failure, reporting which check failed in a [`ValidationOutcome`].
//! The outcome is meant for logs: callers turn any failure into the generic
//! [`OidcError::AuthenticationFailed`](crate::OidcError::AuthenticationFailed).
//!
//! Checks, in order:
//!
//! 1. `iss`, `sub`, `aud`, `exp` and `iat` are present.
//! 2. The header `alg` is `RS256`, the header `kid` selects a key of the
//!    set, and the signature verifies with it.
//! 3. `nonce` matches the one issued for this flow.
//! 4. `iat` is within `max_id_token_iat_offset_seconds` of now.
//! 5. `iss` equals the discovered issuer exactly.
//! 6. `aud` names the client; several audiences require `azp == client_id`.
//! 7. `exp` lies beyond now plus `silent_renew_offset_seconds`.
//! 8. `at_hash` matches the access token, when one was issued.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use jsonwebtoken::{Algorithm, Validation, decode, decode_header};
use serde_json::Value;
use time::OffsetDateTime;

use crate::config::OpenIdConfiguration;
use crate::discovery::AuthWellKnownEndpoints;
use crate::jwks::JwtKeySet;
use crate::token::{Audience, IdTokenClaims, at_hash, expires_within};

/// The check that rejected a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailedCheck {
    /// Signature, algorithm, or key lookup.
    Signature,
    /// `nonce` claim.
    Nonce,
    /// `state` of the callback.
    State,
    /// `iss` claim.
    Issuer,
    /// `aud` or `azp` claim.
    Audience,
    /// `exp` claim.
    Expiry,
    /// `iat` claim too far from now.
    IatOffset,
    /// `at_hash` claim.
    AtHash,
    /// One of `iss`, `sub`, `aud`, `exp`, `iat` is absent.
    RequiredClaimMissing,
    /// A refreshed ID token does not continue the existing one.
    RefreshedTokenMismatch,
}

impl FailedCheck {
    /// Stable name for logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Signature => "signature",
            Self::Nonce => "nonce",
            Self::State => "state",
            Self::Issuer => "issuer",
            Self::Audience => "audience",
            Self::Expiry => "expiry",
            Self::IatOffset => "iat_offset",
            Self::AtHash => "at_hash",
            Self::RequiredClaimMissing => "required_claim_missing",
            Self::RefreshedTokenMismatch => "refreshed_token_mismatch",
        }
    }
}

impl fmt::Display for FailedCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a validation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationOutcome {
    /// `true` when every check passed.
    pub is_valid: bool,
    /// The first check that failed.
    pub failed_check: Option<FailedCheck>,
}

impl ValidationOutcome {
    /// A passing outcome.
    #[must_use]
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            failed_check: None,
        }
    }

    /// A failing outcome.
    #[must_use]
    pub fn failed(check: FailedCheck) -> Self {
        Self {
            is_valid: false,
            failed_check: Some(check),
        }
    }
}

/// What the `nonce` claim must look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceExpectation<'a> {
    /// Must equal the nonce issued for the authorize request.
    Issued(&'a str),
    /// Token from a refresh grant: absent, or present only when
    /// `ignore_nonce_after_refresh` is set.
    RefreshGrant,
}

/// Everything the validator looks at.
#[derive(Debug, Clone, Copy)]
pub struct ValidationInput<'a> {
    /// Raw compact JWS.
    pub id_token: &'a str,
    /// Access token issued together with the ID token.
    pub access_token: Option<&'a str>,
    /// Decoded (unverified) claims of `id_token`.
    pub claims: &'a IdTokenClaims,
    /// Endpoint metadata; provides the expected issuer.
    pub endpoints: &'a AuthWellKnownEndpoints,
    /// Verification keys.
    pub key_set: &'a JwtKeySet,
    /// Expected nonce.
    pub nonce: NonceExpectation<'a>,
}

/// Validates ID tokens for one configuration.
#[derive(Debug, Clone)]
pub struct TokenValidator {
    config: Arc<OpenIdConfiguration>,
}

impl TokenValidator {
    /// Creates a validator.
    #[must_use]
    pub fn new(config: Arc<OpenIdConfiguration>) -> Self {
        Self { config }
    }

    /// Validates against the current time.
    #[must_use]
    pub fn validate(&self, input: &ValidationInput<'_>) -> ValidationOutcome {
        self.validate_at(input, OffsetDateTime::now_utc())
    }

    /// Validates against `now`.
    #[must_use]
    pub fn validate_at(&self, input: &ValidationInput<'_>, now: OffsetDateTime) -> ValidationOutcome {
        let claims = input.claims;

        if !has_required_claims(claims) {
            return ValidationOutcome::failed(FailedCheck::RequiredClaimMissing);
        }
        if !verify_signature(input.id_token, input.key_set) {
            return ValidationOutcome::failed(FailedCheck::Signature);
        }
        if !self.validate_nonce(claims, input.nonce) {
            return ValidationOutcome::failed(FailedCheck::Nonce);
        }
        if !self.validate_iat(claims, now) {
            return ValidationOutcome::failed(FailedCheck::IatOffset);
        }
        if claims.iss.as_deref() != Some(input.endpoints.issuer.as_str()) {
            return ValidationOutcome::failed(FailedCheck::Issuer);
        }
        if !self.validate_audience(claims) {
            return ValidationOutcome::failed(FailedCheck::Audience);
        }
        if !self.validate_expiry(claims, now) {
            return ValidationOutcome::failed(FailedCheck::Expiry);
        }
        if let Some(access_token) = input.access_token
            && !self.validate_at_hash(claims, access_token)
        {
            return ValidationOutcome::failed(FailedCheck::AtHash);
        }

        ValidationOutcome::valid()
    }

    /// Checks that a refreshed ID token continues `existing`
    /// (OpenID Connect Core 1.0, section 12.2).
    #[must_use]
    pub fn validate_refreshed(
        &self,
        existing: &IdTokenClaims,
        refreshed: &IdTokenClaims,
    ) -> ValidationOutcome {
        let same_principal = existing.iss == refreshed.iss
            && existing.sub == refreshed.sub
            && existing.aud == refreshed.aud
            && existing.azp == refreshed.azp
            && existing.auth_time == refreshed.auth_time;
        let not_older = match (existing.iat, refreshed.iat) {
            (Some(old), Some(new)) => new >= old,
            _ => false,
        };

        if same_principal && not_older {
            ValidationOutcome::valid()
        } else {
            ValidationOutcome::failed(FailedCheck::RefreshedTokenMismatch)
        }
    }

    fn validate_nonce(&self, claims: &IdTokenClaims, expected: NonceExpectation<'_>) -> bool {
        match expected {
            NonceExpectation::Issued(nonce) => {
                !nonce.is_empty() && claims.nonce.as_deref() == Some(nonce)
            }
            NonceExpectation::RefreshGrant => {
                claims.nonce.is_none() || self.config.ignore_nonce_after_refresh
            }
        }
    }

    fn validate_iat(&self, claims: &IdTokenClaims, now: OffsetDateTime) -> bool {
        if self.config.disable_iat_offset_validation {
            return true;
        }
        let Some(iat) = claims.iat else {
            return false;
        };
        let now_ms = now.unix_timestamp_nanos() / 1_000_000;
        let diff_ms = (now_ms - i128::from(iat) * 1000).abs();
        diff_ms < i128::from(self.config.max_id_token_iat_offset_seconds) * 1000
    }

    fn validate_audience(&self, claims: &IdTokenClaims) -> bool {
        let client_id = self.config.client_id.as_str();
        let aud_ok = match &claims.aud {
            Some(Audience::One(aud)) => aud == client_id,
            Some(Audience::Many(auds)) => {
                auds.iter().any(|a| a == client_id)
                    && (auds.len() == 1 || claims.azp.as_deref() == Some(client_id))
            }
            None => false,
        };
        // An azp that names another party is never acceptable.
        aud_ok && claims.azp.as_deref().is_none_or(|azp| azp == client_id)
    }

    fn validate_expiry(&self, claims: &IdTokenClaims, now: OffsetDateTime) -> bool {
        claims
            .exp
            .is_some_and(|exp| !expires_within(exp, self.config.silent_renew_offset_seconds, now))
    }

    fn validate_at_hash(&self, claims: &IdTokenClaims, access_token: &str) -> bool {
        match &claims.at_hash {
            Some(expected) => *expected == at_hash(access_token),
            // Optional in the code flow, required when the token came from
            // the authorization endpoint.
            None => self.config.response_type.is_code_flow(),
        }
    }
}

/// Returns `true` if `iss`, `sub`, `aud`, `exp` and `iat` are all present.
#[must_use]
pub fn has_required_claims(claims: &IdTokenClaims) -> bool {
    claims.iss.is_some()
        && claims.sub.is_some()
        && claims.aud.as_ref().is_some_and(|aud| !aud.is_empty())
        && claims.exp.is_some()
        && claims.iat.is_some()
}

/// Verifies the RS256 signature of `id_token` with the key its header
/// selects from `key_set`.
#[must_use]
pub fn verify_signature(id_token: &str, key_set: &JwtKeySet) -> bool {
    let Ok(header) = decode_header(id_token) else {
        tracing::debug!("ID token header is not decodable");
        return false;
    };
    if header.alg != Algorithm::RS256 {
        tracing::debug!(alg = ?header.alg, "ID token is not signed with RS256");
        return false;
    }
    let Some(key) = key_set.find(header.kid.as_deref()) else {
        tracing::debug!(kid = ?header.kid, "No signing key matches the ID token");
        return false;
    };
    let Ok(decoding_key) = key.decoding_key() else {
        return false;
    };

    // Only the signature is checked here; claims have dedicated checks.
    let mut validation = Validation::new(Algorithm::RS256);
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims = HashSet::new();

    decode::<Value>(id_token, &decoding_key, &validation).is_ok()
}
