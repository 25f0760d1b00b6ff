use serde::{Deserialize, Serialize};

use super::{AuthError, AuthOutcome, AuthRequest};

/// Authenticator that delegates every decision to an external HTTP endpoint.
///
/// The endpoint receives a canonical JSON document and answers with any 2xx
/// status to allow, anything else to deny. A 2xx body may carry an override
/// path name for aliasing.
pub struct HttpAuthenticator {
    url: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct HookRequest<'a> {
    user: &'a str,
    password: &'a str,
    ip: String,
    action: String,
    path: &'a str,
    protocol: String,
    id: String,
    query: &'a str,
}

#[derive(Deserialize, Default)]
struct HookResponse {
    #[serde(default)]
    path: Option<String>,
}

impl HttpAuthenticator {
    pub fn new(url: String) -> crate::Result<Self> {
        url::Url::parse(&url)
            .map_err(|e| crate::Error::Validation(format!("invalid auth hook URL '{url}': {e}")))?;
        Ok(Self {
            url,
            client: reqwest::Client::new(),
        })
    }

    pub async fn authenticate(&self, req: &AuthRequest) -> Result<AuthOutcome, AuthError> {
        let creds = req.credentials.clone().unwrap_or_default();

        let body = HookRequest {
            user: &creds.user,
            password: &creds.pass,
            ip: req.ip.to_string(),
            action: req.action.to_string(),
            path: &req.path,
            protocol: req.protocol.to_string(),
            id: req.id.to_string(),
            query: &req.query,
        };

        let res = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AuthError::fatal(format!("auth hook unreachable: {e}")))?;

        if !res.status().is_success() {
            if creds.is_empty() {
                return Err(AuthError::challenge("credentials required"));
            }
            return Err(AuthError::fatal(format!(
                "auth hook returned {}",
                res.status().as_u16()
            )));
        }

        let outcome = res.json::<HookResponse>().await.unwrap_or_default();
        Ok(AuthOutcome {
            path_override: outcome.path.filter(|p| !p.is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use uuid::Uuid;
    use wiremock::matchers::{body_json_string, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::auth::{AuthAction, Credentials, Protocol};

    fn request(id: Uuid) -> AuthRequest {
        AuthRequest {
            action: AuthAction::Publish,
            path: "cam1".to_string(),
            protocol: Protocol::Rtmp,
            query: "key=abc".to_string(),
            credentials: Some(Credentials {
                user: "pub".to_string(),
                pass: "secret".to_string(),
                token: String::new(),
            }),
            ip: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5)),
            id,
            custom_verify: None,
        }
    }

    #[tokio::test]
    async fn test_canonical_body_and_allow() {
        let server = MockServer::start().await;
        let id = Uuid::new_v4();

        let expected = format!(
            "{{\"user\":\"pub\",\"password\":\"secret\",\"ip\":\"203.0.113.5\",\
             \"action\":\"publish\",\"path\":\"cam1\",\"protocol\":\"rtmp\",\
             \"id\":\"{id}\",\"query\":\"key=abc\"}}"
        );

        Mock::given(method("POST"))
            .and(path("/auth"))
            .and(body_json_string(&expected))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let auth = HttpAuthenticator::new(format!("{}/auth", server.uri())).unwrap();
        let outcome = auth.authenticate(&request(id)).await.unwrap();
        assert!(outcome.path_override.is_none());
    }

    #[tokio::test]
    async fn test_deny_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let auth = HttpAuthenticator::new(format!("{}/auth", server.uri())).unwrap();
        let err = auth.authenticate(&request(Uuid::new_v4())).await.unwrap_err();
        assert!(!err.ask_credentials);
    }

    #[tokio::test]
    async fn test_path_override() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"path": "alias"})),
            )
            .mount(&server)
            .await;

        let auth = HttpAuthenticator::new(format!("{}/auth", server.uri())).unwrap();
        let outcome = auth.authenticate(&request(Uuid::new_v4())).await.unwrap();
        assert_eq!(outcome.path_override.as_deref(), Some("alias"));
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(HttpAuthenticator::new("not a url".to_string()).is_err());
    }
}
