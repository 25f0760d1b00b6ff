use std::collections::HashMap;

use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tokio::sync::RwLock;

use super::{permissions_allow, AuthError, AuthOutcome, AuthRequest, Permission};

/// Authenticator that verifies bearer tokens against a JWKS endpoint and maps
/// a permissions claim through the same matcher as the internal table.
///
/// Keys are cached by `kid`; an unknown `kid` triggers one refresh before the
/// token is rejected.
pub struct JwtAuthenticator {
    jwks_url: String,
    claim_key: String,
    client: reqwest::Client,
    keys: RwLock<HashMap<String, CachedKey>>,
}

struct CachedKey {
    key: DecodingKey,
    alg: Algorithm,
}

#[derive(Deserialize)]
struct Jwks {
    keys: Vec<Jwk>,
}

#[derive(Deserialize)]
struct Jwk {
    kty: String,
    #[serde(default)]
    kid: String,
    #[serde(default)]
    alg: Option<String>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
    #[serde(default)]
    x: Option<String>,
    #[serde(default)]
    y: Option<String>,
}

/// Permissions claim entries: either structured objects or "action:path"
/// strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawPermission {
    Obj(Permission),
    Str(String),
}

impl JwtAuthenticator {
    pub fn new(jwks_url: String, claim_key: String) -> crate::Result<Self> {
        url::Url::parse(&jwks_url)
            .map_err(|e| crate::Error::Validation(format!("invalid JWKS URL '{jwks_url}': {e}")))?;
        Ok(Self {
            jwks_url,
            claim_key,
            client: reqwest::Client::new(),
            keys: RwLock::new(HashMap::new()),
        })
    }

    pub async fn authenticate(&self, req: &AuthRequest) -> Result<AuthOutcome, AuthError> {
        let token = match &req.credentials {
            Some(c) if !c.token.is_empty() => c.token.clone(),
            // some protocols can only transport the token in the password slot
            Some(c) if !c.pass.is_empty() => c.pass.clone(),
            _ => return Err(AuthError::challenge("JWT required")),
        };

        let header = decode_header(&token)
            .map_err(|e| AuthError::fatal(format!("invalid JWT header: {e}")))?;
        let kid = header
            .kid
            .ok_or_else(|| AuthError::fatal("JWT is missing the kid header"))?;

        let claims = self.verify(&token, &kid).await?;

        let raw = claims.get(&self.claim_key).ok_or_else(|| {
            AuthError::fatal(format!("JWT is missing the '{}' claim", self.claim_key))
        })?;
        let perms = parse_permissions(raw)
            .map_err(|e| AuthError::fatal(format!("invalid permissions claim: {e}")))?;

        if permissions_allow(&perms, req.action, &req.path) {
            Ok(AuthOutcome::default())
        } else {
            Err(AuthError::fatal(format!(
                "token doesn't grant permission to perform action '{}'",
                req.action
            )))
        }
    }

    async fn verify(
        &self,
        token: &str,
        kid: &str,
    ) -> Result<serde_json::Map<String, serde_json::Value>, AuthError> {
        if let Some(claims) = self.try_decode(token, kid).await? {
            return Ok(claims);
        }

        // unknown kid: the upstream may have rotated keys
        self.refresh_keys().await?;

        match self.try_decode(token, kid).await? {
            Some(claims) => Ok(claims),
            None => Err(AuthError::fatal(format!("unknown JWT key id '{kid}'"))),
        }
    }

    async fn try_decode(
        &self,
        token: &str,
        kid: &str,
    ) -> Result<Option<serde_json::Map<String, serde_json::Value>>, AuthError> {
        let keys = self.keys.read().await;
        let Some(cached) = keys.get(kid) else {
            return Ok(None);
        };

        let validation = Validation::new(cached.alg);
        let data = decode::<serde_json::Map<String, serde_json::Value>>(
            token,
            &cached.key,
            &validation,
        )
        .map_err(|e| AuthError::fatal(format!("invalid JWT: {e}")))?;
        Ok(Some(data.claims))
    }

    async fn refresh_keys(&self) -> Result<(), AuthError> {
        let jwks: Jwks = self
            .client
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| AuthError::fatal(format!("JWKS fetch failed: {e}")))?
            .json()
            .await
            .map_err(|e| AuthError::fatal(format!("invalid JWKS document: {e}")))?;

        let mut parsed = HashMap::new();
        for jwk in jwks.keys {
            match compile_jwk(&jwk) {
                Ok(cached) => {
                    parsed.insert(jwk.kid.clone(), cached);
                }
                Err(e) => {
                    tracing::warn!("skipping JWKS key '{}': {}", jwk.kid, e);
                }
            }
        }

        *self.keys.write().await = parsed;
        Ok(())
    }
}

fn compile_jwk(jwk: &Jwk) -> Result<CachedKey, String> {
    match jwk.kty.as_str() {
        "RSA" => {
            let n = jwk.n.as_deref().ok_or("RSA key without modulus")?;
            let e = jwk.e.as_deref().ok_or("RSA key without exponent")?;
            let key = DecodingKey::from_rsa_components(n, e)
                .map_err(|e| format!("invalid RSA components: {e}"))?;
            let alg = match jwk.alg.as_deref() {
                Some("RS384") => Algorithm::RS384,
                Some("RS512") => Algorithm::RS512,
                _ => Algorithm::RS256,
            };
            Ok(CachedKey { key, alg })
        }
        "EC" => {
            let x = jwk.x.as_deref().ok_or("EC key without x")?;
            let y = jwk.y.as_deref().ok_or("EC key without y")?;
            let key = DecodingKey::from_ec_components(x, y)
                .map_err(|e| format!("invalid EC components: {e}"))?;
            Ok(CachedKey {
                key,
                alg: Algorithm::ES256,
            })
        }
        other => Err(format!("unsupported key type '{other}'")),
    }
}

fn parse_permissions(raw: &serde_json::Value) -> Result<Vec<Permission>, serde_json::Error> {
    let entries: Vec<RawPermission> = serde_json::from_value(raw.clone())?;
    Ok(entries
        .into_iter()
        .map(|e| match e {
            RawPermission::Obj(p) => p,
            RawPermission::Str(s) => {
                let (action, path) = s.split_once(':').unwrap_or((s.as_str(), ""));
                serde_json::from_value(serde_json::json!({
                    "action": action,
                    "path": path,
                }))
                .unwrap_or_default()
            }
        })
        .collect())
}
