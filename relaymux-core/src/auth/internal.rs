use std::net::IpAddr;

use base64::Engine as _;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq as _;
use tokio::task;

use super::{
    permissions_allow, AuthError, AuthOutcome, AuthRequest, AuthUser, Credentials,
};

/// Authenticator backed by the configured user table.
pub struct InternalAuthenticator {
    users: Vec<CompiledUser>,
}

struct CompiledUser {
    user: String,
    pass: String,
    networks: Vec<ipnet::IpNet>,
    entry: AuthUser,
}

impl InternalAuthenticator {
    pub fn new(users: Vec<AuthUser>) -> crate::Result<Self> {
        let mut compiled = Vec::with_capacity(users.len());
        for entry in users {
            let mut networks = Vec::with_capacity(entry.ips.len());
            for ip in &entry.ips {
                let net = parse_ip_or_net(ip).ok_or_else(|| {
                    crate::Error::Validation(format!("invalid IP or network '{ip}'"))
                })?;
                networks.push(net);
            }
            compiled.push(CompiledUser {
                user: entry.user.clone(),
                pass: entry.pass.clone(),
                networks,
                entry,
            });
        }
        Ok(Self { users: compiled })
    }

    pub async fn authenticate(&self, req: &AuthRequest) -> Result<AuthOutcome, AuthError> {
        let creds = req.credentials.clone().unwrap_or_default();

        let mut matched_without_permission = false;

        for user in &self.users {
            if !ip_allowed(&user.networks, req.ip) {
                continue;
            }
            if !user_matches(&user.user, &creds.user) {
                continue;
            }
            if !pass_matches(&user.pass, &creds, req).await {
                continue;
            }

            if permissions_allow(&user.entry.permissions, req.action, &req.path) {
                return Ok(AuthOutcome::default());
            }
            matched_without_permission = true;
        }

        if matched_without_permission {
            return Err(AuthError::fatal(format!(
                "user doesn't have permission to perform action '{}'",
                req.action
            )));
        }
        if creds.is_empty() {
            return Err(AuthError::challenge("credentials required"));
        }
        Err(AuthError::fatal("invalid credentials"))
    }
}

fn parse_ip_or_net(s: &str) -> Option<ipnet::IpNet> {
    if let Ok(net) = s.parse::<ipnet::IpNet>() {
        return Some(net);
    }
    s.parse::<IpAddr>().map(ipnet::IpNet::from).ok()
}

fn ip_allowed(networks: &[ipnet::IpNet], ip: IpAddr) -> bool {
    networks.is_empty() || networks.iter().any(|n| n.contains(&ip))
}

fn user_matches(expected: &str, given: &str) -> bool {
    expected == "any" || expected.as_bytes().ct_eq(given.as_bytes()).into()
}

async fn pass_matches(expected: &str, creds: &Credentials, req: &AuthRequest) -> bool {
    if expected.is_empty() {
        return true;
    }

    if let Some(hash) = expected.strip_prefix("sha256:") {
        let digest = Sha256::digest(creds.pass.as_bytes());
        let encoded = base64::engine::general_purpose::STANDARD.encode(digest);
        return encoded.as_bytes().ct_eq(hash.as_bytes()).into();
    }

    if let Some(phc) = expected.strip_prefix("argon2:") {
        return verify_argon2(creds.pass.clone(), phc.to_string()).await;
    }

    // Cleartext. Protocols that transmit hashed credentials (RTSP digest)
    // verify through their own callback against the stored cleartext.
    if let Some(verifier) = &req.custom_verify {
        return verifier.verify(&creds.user, expected);
    }
    expected.as_bytes().ct_eq(creds.pass.as_bytes()).into()
}

/// Argon2 verification is CPU-intensive; run it off the async threads.
async fn verify_argon2(pass: String, phc: String) -> bool {
    task::spawn_blocking(move || {
        use argon2::password_hash::{PasswordHash, PasswordVerifier};
        let Ok(parsed) = PasswordHash::new(&phc) else {
            return false;
        };
        argon2::Argon2::default()
            .verify_password(pass.as_bytes(), &parsed)
            .is_ok()
    })
    .await
    .unwrap_or(false)
}
