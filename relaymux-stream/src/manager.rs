//! Name→Path registry.
//!
//! Resolves literal and regex path templates, owns path creation and
//! destruction, and funnels every access request through authentication
//! before any state change. The registry lock is never held across
//! authentication or path calls.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use uuid::Uuid;

use relaymux_core::auth::{
    AuthAction, AuthManager, AuthOutcome, AuthRequest, Credentials, CredentialsVerifier,
    Protocol,
};
use relaymux_core::{Conf, Error, PathConf, Result};

use crate::adapter::{RecorderFactory, StaticSourceFactory};
use crate::path::{self, DescribeResult, PathHandle, PathInfo, PathNotice, PathSpawnParams};
use crate::stream::Stream;
use crate::unit::StreamDesc;

/// Uniform envelope for one attempt to interact with a path.
#[derive(Clone)]
pub struct AccessRequest {
    pub name: String,
    pub query: String,
    pub publish: bool,
    pub protocol: Protocol,
    pub credentials: Option<Credentials>,
    pub ip: IpAddr,
    pub id: Uuid,
    pub custom_verify: Option<Arc<dyn CredentialsVerifier>>,
}

impl AccessRequest {
    fn to_auth_request(&self, name: &str) -> AuthRequest {
        AuthRequest {
            action: if self.publish {
                AuthAction::Publish
            } else {
                AuthAction::Read
            },
            path: name.to_string(),
            protocol: self.protocol,
            query: self.query.clone(),
            credentials: self.credentials.clone(),
            ip: self.ip,
            id: self.id,
            custom_verify: self.custom_verify.clone(),
        }
    }
}

struct RegEntry {
    handle: PathHandle,
    conf: PathConf,
    dynamic: bool,
}

struct Inner {
    conf: RwLock<Arc<Conf>>,
    auth: RwLock<Arc<AuthManager>>,
    registry: RwLock<HashMap<String, RegEntry>>,
    notice_tx: mpsc::UnboundedSender<PathNotice>,
    source_factory: Option<Arc<dyn StaticSourceFactory>>,
    recorder_factory: Option<Arc<dyn RecorderFactory>>,
}

#[derive(Clone)]
pub struct PathManager {
    inner: Arc<Inner>,
}

impl PathManager {
    pub fn new(
        conf: Arc<Conf>,
        source_factory: Option<Arc<dyn StaticSourceFactory>>,
        recorder_factory: Option<Arc<dyn RecorderFactory>>,
    ) -> Result<Self> {
        let auth = Arc::new(AuthManager::from_conf(&conf)?);
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            conf: RwLock::new(conf.clone()),
            auth: RwLock::new(auth),
            registry: RwLock::new(HashMap::new()),
            notice_tx,
            source_factory,
            recorder_factory,
        });

        let manager = Self { inner };
        manager.spawn_notice_loop(notice_rx);

        // every literal path is instantiated eagerly
        for (name, path_conf) in &conf.paths {
            if !path_conf.is_regex() {
                manager.create_path(name, path_conf.clone(), false);
            }
        }

        Ok(manager)
    }

    fn spawn_notice_loop(&self, mut rx: mpsc::UnboundedReceiver<PathNotice>) {
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(notice) = rx.recv().await {
                let Some(inner) = inner.upgrade() else { break };
                match notice {
                    PathNotice::Idle { name } => {
                        let removed = {
                            let mut registry = inner.registry.write();
                            match registry.get(&name) {
                                Some(entry) if entry.dynamic => registry.remove(&name),
                                _ => None,
                            }
                        };
                        if let Some(entry) = removed {
                            entry.handle.terminate().await;
                        }
                    }
                }
            }
        });
    }

    #[must_use]
    pub fn current_conf(&self) -> Arc<Conf> {
        self.inner.conf.read().clone()
    }

    #[must_use]
    pub fn auth_manager(&self) -> Arc<AuthManager> {
        self.inner.auth.read().clone()
    }

    /// Resolve a name against the configuration snapshot without touching
    /// the registry: exact literal first, then ordered regex templates, then
    /// the catch-all literal `all`.
    ///
    /// The returned conf carries the runtime name.
    pub fn resolve_conf(&self, name: &str) -> Option<PathConf> {
        let conf = self.inner.conf.read().clone();
        resolve_path_conf(&conf, name)
    }

    /// Resolve and authenticate one request; used by adapters to
    /// short-circuit before committing to connect.
    pub async fn find_path_conf(&self, req: &AccessRequest) -> Result<PathConf> {
        let path_conf = self
            .resolve_conf(&req.name)
            .ok_or_else(|| Error::NotFound(format!("path '{}' is not configured", req.name)))?;
        self.authenticate(req, &path_conf, &req.name).await?;
        Ok(path_conf)
    }

    pub async fn add_publisher(
        &self,
        req: AccessRequest,
        label: &str,
        desc: StreamDesc,
    ) -> Result<(PathHandle, Arc<Stream>)> {
        let (name, path_conf) = self.resolve_and_authenticate(&req).await?;
        let handle = self.get_or_create(&name, path_conf);
        let stream = handle
            .add_publisher(req.id, label, &req.query, desc)
            .await?;
        Ok((handle, stream))
    }

    pub async fn add_reader(
        &self,
        req: AccessRequest,
        label: &str,
    ) -> Result<(PathHandle, Arc<Stream>)> {
        let (name, path_conf) = self.resolve_and_authenticate(&req).await?;
        let handle = self.get_or_create(&name, path_conf);
        let stream = handle.add_reader(req.id, label, &req.query).await?;
        Ok((handle, stream))
    }

    pub async fn describe(&self, req: AccessRequest) -> Result<DescribeResult> {
        let (name, path_conf) = self.resolve_and_authenticate(&req).await?;
        let handle = self.get_or_create(&name, path_conf);
        handle.describe().await
    }

    async fn resolve_and_authenticate(
        &self,
        req: &AccessRequest,
    ) -> Result<(String, PathConf)> {
        let path_conf = self
            .resolve_conf(&req.name)
            .ok_or_else(|| Error::NotFound(format!("path '{}' is not configured", req.name)))?;

        let outcome = self.authenticate(req, &path_conf, &req.name).await?;

        // the HTTP hook may alias the request onto another path
        if let Some(override_name) = outcome.path_override {
            let path_conf = self.resolve_conf(&override_name).ok_or_else(|| {
                Error::NotFound(format!("path '{override_name}' is not configured"))
            })?;
            return Ok((override_name, path_conf));
        }
        Ok((req.name.clone(), path_conf))
    }

    /// Per-path credential overrides take precedence over the global
    /// authenticator.
    async fn authenticate(
        &self,
        req: &AccessRequest,
        path_conf: &PathConf,
        name: &str,
    ) -> Result<AuthOutcome> {
        let (override_user, override_pass) = if req.publish {
            (&path_conf.publish_user, &path_conf.publish_pass)
        } else {
            (&path_conf.read_user, &path_conf.read_pass)
        };

        if !override_user.is_empty() {
            let creds = req.credentials.clone().unwrap_or_default();
            if creds.is_empty() {
                return Err(relaymux_core::auth::AuthError::challenge(
                    "credentials required",
                )
                .into());
            }
            let user_ok = creds.user == *override_user;
            let pass_ok = match &req.custom_verify {
                Some(v) => v.verify(override_user, override_pass),
                None => creds.pass == *override_pass,
            };
            if user_ok && pass_ok {
                return Ok(AuthOutcome::default());
            }
            return Err(
                relaymux_core::auth::AuthError::fatal("invalid credentials").into(),
            );
        }

        let auth = self.auth_manager();
        let outcome = auth.authenticate(&req.to_auth_request(name)).await?;
        Ok(outcome)
    }

    fn get_or_create(&self, name: &str, path_conf: PathConf) -> PathHandle {
        if let Some(entry) = self.inner.registry.read().get(name) {
            return entry.handle.clone();
        }
        let dynamic = path_conf.name != name;
        self.create_path(name, path_conf, dynamic)
    }

    fn create_path(&self, name: &str, path_conf: PathConf, dynamic: bool) -> PathHandle {
        let conf = self.inner.conf.read().clone();
        let mut registry = self.inner.registry.write();
        if let Some(entry) = registry.get(name) {
            return entry.handle.clone();
        }

        let handle = path::spawn(PathSpawnParams {
            name: name.to_string(),
            conf: path_conf.clone(),
            write_queue_size: conf.write_queue_size,
            max_payload_size: conf.max_payload_size,
            dynamic,
            notice_tx: self.inner.notice_tx.clone(),
            source_factory: self.inner.source_factory.clone(),
            recorder_factory: self.inner.recorder_factory.clone(),
        });
        registry.insert(
            name.to_string(),
            RegEntry {
                handle: handle.clone(),
                conf: path_conf,
                dynamic,
            },
        );
        handle
    }

    /// Apply a validated configuration swap: unchanged paths are kept,
    /// changed paths are gracefully recreated, removed paths terminate, new
    /// literal paths start.
    pub async fn reload_path_confs(&self, new_conf: Arc<Conf>) -> Result<()> {
        let new_auth = Arc::new(AuthManager::from_conf(&new_conf)?);
        *self.inner.conf.write() = new_conf.clone();
        *self.inner.auth.write() = new_auth;

        let snapshot: Vec<(String, PathConf, bool, PathHandle)> = {
            let registry = self.inner.registry.read();
            registry
                .iter()
                .map(|(name, e)| (name.clone(), e.conf.clone(), e.dynamic, e.handle.clone()))
                .collect()
        };

        for (name, old_conf, dynamic, handle) in snapshot {
            match resolve_path_conf(&new_conf, &name) {
                Some(resolved) if resolved == old_conf => {}
                resolved => {
                    self.inner.registry.write().remove(&name);
                    handle.terminate().await;
                    if let Some(resolved) = resolved {
                        if !dynamic {
                            self.create_path(&name, resolved, false);
                        }
                    }
                }
            }
        }

        for (name, path_conf) in &new_conf.paths {
            if !path_conf.is_regex() && !self.inner.registry.read().contains_key(name) {
                self.create_path(name, path_conf.clone(), false);
            }
        }

        Ok(())
    }

    /// Runtime inventory, for `/v3/paths/list`.
    pub async fn api_paths_list(&self) -> Vec<PathInfo> {
        let handles: Vec<PathHandle> = {
            let registry = self.inner.registry.read();
            registry.values().map(|e| e.handle.clone()).collect()
        };
        let mut infos = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(info) = handle.api_info().await {
                infos.push(info);
            }
        }
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// One runtime path, for `/v3/paths/get/*name`.
    pub async fn api_paths_get(&self, name: &str) -> Result<PathInfo> {
        let handle = {
            let registry = self.inner.registry.read();
            registry.get(name).map(|e| e.handle.clone())
        };
        match handle {
            Some(handle) => handle.api_info().await,
            None => Err(Error::NotFound(format!("path '{name}' not found"))),
        }
    }

    /// Terminate every path; pending requests receive "terminated".
    pub async fn close(&self) {
        let handles: Vec<PathHandle> = {
            let mut registry = self.inner.registry.write();
            registry.drain().map(|(_, e)| e.handle).collect()
        };
        for handle in handles {
            handle.terminate().await;
        }
    }
}

/// Name resolution: exact literal, ordered regex templates (first match
/// wins), catch-all literal `all` last. The matched runtime name is stored
/// in the returned conf's `name` field only when the conf itself is literal;
/// regex confs keep their template in `name` so the caller can tell the two
/// apart via [`PathConf::is_regex`].
fn resolve_path_conf(conf: &Conf, name: &str) -> Option<PathConf> {
    if let Some(found) = conf.paths.get(name) {
        return Some(found.clone());
    }

    for (conf_name, path_conf) in &conf.paths {
        let Some(expr) = conf_name.strip_prefix('~') else {
            continue;
        };
        if let Ok(re) = regex::Regex::new(expr) {
            if re.is_match(name) {
                return Some(path_conf.clone());
            }
        }
    }

    conf.paths.get("all").cloned()
}
