use jsonwebtoken::{decode, DecodingKey, Validation};

use crate::claims::Claims;
use crate::errors::{Error, Result};
use crate::issuer::SignatureAlgorithm;

/// Verifies bearer tokens against the token server's public key.
///
/// Every registry request (other than the token endpoint itself) passes
/// through here when token auth is enabled. Checks signature, `exp`, `nbf`,
/// `aud` and the issuer.
pub struct TokenVerifier {
    algorithm: SignatureAlgorithm,
    decoding_key: DecodingKey,
    issuer: String,
}

impl TokenVerifier {
    pub fn from_pem(
        algorithm: SignatureAlgorithm,
        public_key_pem: &[u8],
        issuer: impl Into<String>,
    ) -> Result<Self> {
        let decoding_key = match algorithm {
            SignatureAlgorithm::ES256 => DecodingKey::from_ec_pem(public_key_pem)?,
            SignatureAlgorithm::RS256 | SignatureAlgorithm::PS256 => {
                DecodingKey::from_rsa_pem(public_key_pem)?
            }
        };
        Ok(Self {
            algorithm,
            decoding_key,
            issuer: issuer.into(),
        })
    }

    pub fn verify(&self, token: &str, service: &str) -> Result<Claims> {
        let mut validation = Validation::new(self.algorithm.jwt_algorithm());
        validation.set_audience(&[service]);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.validate_nbf = true;
        validation.leeway = 5;

        let data = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|e| Error::TokenInvalid(format!("{e}")))?;
        Ok(data.claims)
    }
}
