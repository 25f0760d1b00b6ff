//! Per-name path state machine.
//!
//! One task owns all mutable state of a path; external callers interact
//! through [`PathHandle`], which passes request structs with reply channels.
//! Suspension inside the loop happens only on the command channel and the
//! activation/close timers.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

use relaymux_core::hook::{self, HookEnv, HookHandle};
use relaymux_core::{Error, PathConf, Result};

use crate::adapter::{RecorderFactory, RecorderHandle, SourceHandle, StaticSourceFactory};
use crate::stream::Stream;
use crate::unit::StreamDesc;

const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle states of a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PathState {
    Initial,
    WaitingForPublisher,
    Ready,
    NotReady,
    Terminating,
}

/// Answer to a describe request.
#[derive(Debug)]
pub enum DescribeResult {
    Stream(Arc<Stream>),
    Redirect(String),
}

/// One publisher or reader as shown by the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRef {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: Uuid,
}

/// Runtime snapshot of a path, for `/v3/paths/*`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathInfo {
    pub name: String,
    pub conf_name: String,
    pub source: Option<SessionRef>,
    pub ready: bool,
    pub ready_time: Option<DateTime<Utc>>,
    pub tracks: Vec<String>,
    pub bytes_received: u64,
    pub readers: Vec<SessionRef>,
}

pub(crate) enum PathCommand {
    AddPublisher {
        id: Uuid,
        label: String,
        query: String,
        desc: StreamDesc,
        reply: oneshot::Sender<Result<Arc<Stream>>>,
    },
    RemovePublisher {
        id: Uuid,
    },
    AddReader {
        id: Uuid,
        label: String,
        query: String,
        reply: oneshot::Sender<Result<Arc<Stream>>>,
    },
    RemoveReader {
        id: Uuid,
    },
    Describe {
        reply: oneshot::Sender<Result<DescribeResult>>,
    },
    ApiGet {
        reply: oneshot::Sender<PathInfo>,
    },
    Terminate {
        reply: oneshot::Sender<()>,
    },
}

/// Notices emitted by path tasks towards the manager.
pub(crate) enum PathNotice {
    /// A dynamically-created path has returned to rest and can be dropped.
    Idle { name: String },
}

/// Cheap cloneable handle over a path task.
#[derive(Debug, Clone)]
pub struct PathHandle {
    name: String,
    tx: mpsc::Sender<PathCommand>,
}

impl PathHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn add_publisher(
        &self,
        id: Uuid,
        label: &str,
        query: &str,
        desc: StreamDesc,
    ) -> Result<Arc<Stream>> {
        let (reply, rx) = oneshot::channel();
        self.send(PathCommand::AddPublisher {
            id,
            label: label.to_string(),
            query: query.to_string(),
            desc,
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::Terminated)?
    }

    pub async fn remove_publisher(&self, id: Uuid) {
        let _ = self.send(PathCommand::RemovePublisher { id }).await;
    }

    pub async fn add_reader(&self, id: Uuid, label: &str, query: &str) -> Result<Arc<Stream>> {
        let (reply, rx) = oneshot::channel();
        self.send(PathCommand::AddReader {
            id,
            label: label.to_string(),
            query: query.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::Terminated)?
    }

    pub async fn remove_reader(&self, id: Uuid) {
        let _ = self.send(PathCommand::RemoveReader { id }).await;
    }

    pub async fn describe(&self) -> Result<DescribeResult> {
        let (reply, rx) = oneshot::channel();
        self.send(PathCommand::Describe { reply }).await?;
        rx.await.map_err(|_| Error::Terminated)?
    }

    pub async fn api_info(&self) -> Result<PathInfo> {
        let (reply, rx) = oneshot::channel();
        self.send(PathCommand::ApiGet { reply }).await?;
        rx.await.map_err(|_| Error::Terminated)
    }

    /// Graceful teardown; resolves once the task has drained its inbox.
    pub async fn terminate(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(PathCommand::Terminate { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn send(&self, cmd: PathCommand) -> Result<()> {
        self.tx.send(cmd).await.map_err(|_| Error::Terminated)
    }
}

/// Everything a path task needs at spawn time.
pub(crate) struct PathSpawnParams {
    pub name: String,
    pub conf: PathConf,
    pub write_queue_size: usize,
    pub max_payload_size: usize,
    /// Materialized from a regex template; dropped by the manager when idle.
    pub dynamic: bool,
    pub notice_tx: mpsc::UnboundedSender<PathNotice>,
    pub source_factory: Option<Arc<dyn StaticSourceFactory>>,
    pub recorder_factory: Option<Arc<dyn RecorderFactory>>,
}

pub(crate) fn spawn(params: PathSpawnParams) -> PathHandle {
    let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let handle = PathHandle {
        name: params.name.clone(),
        tx,
    };

    tokio::spawn(async move {
        let mut actor = PathActor::new(params, rx);
        actor.run().await;
    });

    handle
}

struct PublisherSlot {
    id: Uuid,
    label: String,
    stream: Arc<Stream>,
}

struct Waiter {
    reply: WaiterReply,
    /// Reader registration to perform when the stream appears.
    reader: Option<(Uuid, String, String)>,
}

enum WaiterReply {
    Reader(oneshot::Sender<Result<Arc<Stream>>>),
    Describe(oneshot::Sender<Result<DescribeResult>>),
}

enum OnDemandRun {
    Hook(HookHandle),
    Source(Box<dyn SourceHandle>),
}

struct PathActor {
    name: String,
    conf: PathConf,
    write_queue_size: usize,
    max_payload_size: usize,
    dynamic: bool,
    rx: mpsc::Receiver<PathCommand>,
    notice_tx: mpsc::UnboundedSender<PathNotice>,
    source_factory: Option<Arc<dyn StaticSourceFactory>>,
    recorder_factory: Option<Arc<dyn RecorderFactory>>,

    state: PathState,
    publisher: Option<PublisherSlot>,
    readers: HashMap<Uuid, (String, Option<HookHandle>)>,
    waiters: Vec<Waiter>,
    wait_deadline: Option<Instant>,
    close_deadline: Option<Instant>,
    on_demand: Option<OnDemandRun>,
    static_source: Option<Box<dyn SourceHandle>>,
    on_init_hook: Option<HookHandle>,
    on_ready_hook: Option<HookHandle>,
    recorder: Option<Box<dyn RecorderHandle>>,
    ready_time: Option<DateTime<Utc>>,
}

impl PathActor {
    fn new(params: PathSpawnParams, rx: mpsc::Receiver<PathCommand>) -> Self {
        Self {
            name: params.name,
            conf: params.conf,
            write_queue_size: params.write_queue_size,
            max_payload_size: params.max_payload_size,
            dynamic: params.dynamic,
            rx,
            notice_tx: params.notice_tx,
            source_factory: params.source_factory,
            recorder_factory: params.recorder_factory,
            state: PathState::Initial,
            publisher: None,
            readers: HashMap::new(),
            waiters: Vec::new(),
            wait_deadline: None,
            close_deadline: None,
            on_demand: None,
            static_source: None,
            on_init_hook: None,
            on_ready_hook: None,
            recorder: None,
            ready_time: None,
        }
    }

    async fn run(&mut self) {
        tracing::debug!("path '{}' created", self.name);

        if !self.conf.run_on_init.is_empty() {
            self.on_init_hook = Some(hook::run(
                &self.conf.run_on_init,
                &self.hook_env(""),
                self.conf.run_on_init_restart,
            ));
        }

        // a static pull source starts eagerly
        if !self.conf.has_publisher_source() && !self.conf.source_on_demand {
            self.start_static_source();
        }

        loop {
            let deadline = match (self.wait_deadline, self.close_deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let timer = async {
                match deadline {
                    Some(d) => tokio::time::sleep_until(d).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                cmd = self.rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    if self.handle_command(cmd) {
                        break;
                    }
                }
                () = timer => {
                    self.handle_deadline();
                }
            }
        }

        self.teardown().await;
        tracing::debug!("path '{}' destroyed", self.name);
    }

    /// Returns true when the actor must stop.
    fn handle_command(&mut self, cmd: PathCommand) -> bool {
        match cmd {
            PathCommand::AddPublisher {
                id,
                label,
                query,
                desc,
                reply,
            } => {
                let _ = reply.send(self.add_publisher(id, label, query, desc));
            }
            PathCommand::RemovePublisher { id } => {
                self.remove_publisher(id);
            }
            PathCommand::AddReader {
                id,
                label,
                query,
                reply,
            } => {
                match self.prepare_reader(true) {
                    Ok(Some(stream)) => {
                        self.register_reader(id, &label, &query);
                        let _ = reply.send(Ok(stream));
                    }
                    Ok(None) => {
                        self.waiters.push(Waiter {
                            reply: WaiterReply::Reader(reply),
                            reader: Some((id, label, query)),
                        });
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            PathCommand::RemoveReader { id } => {
                self.remove_reader(id);
            }
            PathCommand::Describe { reply } => {
                match self.prepare_reader(false) {
                    Ok(Some(stream)) => {
                        let _ = reply.send(Ok(DescribeResult::Stream(stream)));
                    }
                    Ok(None) => {
                        self.waiters.push(Waiter {
                            reply: WaiterReply::Describe(reply),
                            reader: None,
                        });
                    }
                    Err(Error::NoStreamAvailable(_)) if !self.conf.fallback.is_empty() => {
                        let _ = reply.send(Ok(DescribeResult::Redirect(
                            self.conf.fallback.clone(),
                        )));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            PathCommand::ApiGet { reply } => {
                let _ = reply.send(self.api_info());
            }
            PathCommand::Terminate { reply } => {
                self.state = PathState::Terminating;
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    fn add_publisher(
        &mut self,
        id: Uuid,
        label: String,
        query: String,
        desc: StreamDesc,
    ) -> Result<Arc<Stream>> {
        if self.state == PathState::Terminating {
            return Err(Error::Terminated);
        }
        if self.publisher.is_some() {
            return Err(Error::Conflict(format!(
                "another publisher is already publishing to path '{}'",
                self.name
            )));
        }

        let stream = Stream::new(
            desc,
            self.write_queue_size,
            self.max_payload_size,
            false,
        )?;

        self.publisher = Some(PublisherSlot {
            id,
            label: label.clone(),
            stream: stream.clone(),
        });
        self.state = PathState::Ready;
        self.ready_time = Some(Utc::now());
        self.wait_deadline = None;

        tracing::info!("path '{}': publisher {} bound, path is ready", self.name, id);

        if !self.conf.run_on_ready.is_empty() {
            let mut env = self.hook_env(&query);
            env.source_type = label;
            env.source_id = id.to_string();
            self.on_ready_hook = Some(hook::run(
                &self.conf.run_on_ready,
                &env,
                self.conf.run_on_ready_restart,
            ));
        }

        if self.conf.record {
            if let Some(factory) = &self.recorder_factory {
                self.recorder = Some(factory.start(&self.name, &self.conf, stream.clone()));
            }
        }

        // answer everyone who was waiting for this publisher
        for waiter in self.waiters.drain(..).collect::<Vec<_>>() {
            match waiter.reply {
                WaiterReply::Reader(reply) => {
                    if let Some((rid, rlabel, rquery)) = waiter.reader {
                        self.register_reader(rid, &rlabel, &rquery);
                    }
                    let _ = reply.send(Ok(stream.clone()));
                }
                WaiterReply::Describe(reply) => {
                    let _ = reply.send(Ok(DescribeResult::Stream(stream.clone())));
                }
            }
        }

        self.refresh_close_timer();
        Ok(stream)
    }

    fn remove_publisher(&mut self, id: Uuid) {
        let matches = self.publisher.as_ref().is_some_and(|p| p.id == id);
        if !matches {
            return;
        }
        let slot = self.publisher.take();

        if let Some(recorder) = self.recorder.take() {
            recorder.close();
        }
        if let Some(h) = self.on_ready_hook.take() {
            // detached close: the actor must not await hook teardown
            tokio::spawn(h.close());
        }
        if !self.conf.run_on_not_ready.is_empty() {
            drop(hook::run(&self.conf.run_on_not_ready, &self.hook_env(""), false));
        }
        if let Some(slot) = slot {
            slot.stream.close();
        }

        self.ready_time = None;
        self.state = if !self.readers.is_empty() && self.conf.has_publisher_source() {
            PathState::WaitingForPublisher
        } else {
            PathState::Initial
        };
        tracing::info!("path '{}': publisher removed, path is not ready", self.name);

        self.maybe_notify_idle();
    }

    /// Returns the live stream, `None` to queue the caller behind an
    /// activation, or an error. The reader cap only applies to actual reader
    /// registrations, not describes.
    fn prepare_reader(&mut self, check_limit: bool) -> Result<Option<Arc<Stream>>> {
        if check_limit
            && self.conf.max_readers > 0
            && self.readers.len() >= self.conf.max_readers
        {
            return Err(Error::Conflict(format!(
                "path '{}' reached the maximum number of readers",
                self.name
            )));
        }

        match self.state {
            PathState::Terminating => return Err(Error::Terminated),
            PathState::Ready => {
                if let Some(p) = &self.publisher {
                    return Ok(Some(p.stream.clone()));
                }
            }
            _ => {}
        }

        // no stream yet: can something produce one?
        if !self.conf.run_on_demand.is_empty() {
            self.start_on_demand_hook();
            return Ok(None);
        }
        if !self.conf.has_publisher_source() {
            if self.conf.source_on_demand {
                self.start_on_demand_source();
                return Ok(None);
            }
            if self.static_source.is_some() {
                // static pull still connecting: wait for it
                if self.wait_deadline.is_none() {
                    self.wait_deadline = Some(
                        Instant::now()
                            + self.conf.source_on_demand_start_timeout.as_duration(),
                    );
                }
                return Ok(None);
            }
        }

        Err(Error::NoStreamAvailable(self.name.clone()))
    }

    fn register_reader(&mut self, id: Uuid, label: &str, query: &str) {
        let on_read = if self.conf.run_on_read.is_empty() {
            None
        } else {
            let mut env = self.hook_env(query);
            env.source_type = label.to_string();
            env.source_id = id.to_string();
            Some(hook::run(&self.conf.run_on_read, &env, false))
        };
        self.readers.insert(id, (label.to_string(), on_read));
        self.close_deadline = None;
    }

    fn remove_reader(&mut self, id: Uuid) {
        let Some((_, on_read)) = self.readers.remove(&id) else {
            return;
        };
        if let Some(h) = on_read {
            tokio::spawn(h.close());
        }
        if !self.conf.run_on_unread.is_empty() {
            drop(hook::run(&self.conf.run_on_unread, &self.hook_env(""), false));
        }
        self.refresh_close_timer();
        self.maybe_notify_idle();
    }

    fn start_on_demand_hook(&mut self) {
        if self.on_demand.is_some() {
            return;
        }
        tracing::info!("path '{}': starting on-demand command", self.name);
        let handle = hook::run(
            &self.conf.run_on_demand,
            &self.hook_env(""),
            self.conf.run_on_demand_restart,
        );
        self.on_demand = Some(OnDemandRun::Hook(handle));
        self.wait_deadline = Some(
            Instant::now() + self.conf.run_on_demand_start_timeout.as_duration(),
        );
    }

    fn start_on_demand_source(&mut self) {
        if self.on_demand.is_some() {
            return;
        }
        let Some(factory) = &self.source_factory else {
            return;
        };
        tracing::info!("path '{}': starting on-demand source", self.name);
        let handle = factory.start(&self.name, &self.conf);
        self.on_demand = Some(OnDemandRun::Source(handle));
        self.wait_deadline = Some(
            Instant::now() + self.conf.source_on_demand_start_timeout.as_duration(),
        );
    }

    fn start_static_source(&mut self) {
        if let Some(factory) = &self.source_factory {
            self.static_source = Some(factory.start(&self.name, &self.conf));
        }
    }

    fn stop_on_demand(&mut self) {
        match self.on_demand.take() {
            Some(OnDemandRun::Hook(h)) => {
                tokio::spawn(h.close());
            }
            Some(OnDemandRun::Source(s)) => s.close(),
            None => {}
        }
    }

    fn refresh_close_timer(&mut self) {
        if !self.readers.is_empty() || self.on_demand.is_none() {
            return;
        }
        let close_after = if self.conf.run_on_demand.is_empty() {
            self.conf.source_on_demand_close_after
        } else {
            self.conf.run_on_demand_close_after
        };
        self.close_deadline = Some(Instant::now() + close_after.as_duration());
    }

    fn handle_deadline(&mut self) {
        let now = Instant::now();

        if self.wait_deadline.is_some_and(|d| d <= now) {
            self.wait_deadline = None;
            if self.state != PathState::Ready {
                tracing::warn!("path '{}': activation timed out", self.name);
                self.stop_on_demand();
                self.state = PathState::NotReady;
                for waiter in self.waiters.drain(..) {
                    let err = Error::NoStreamAvailable(self.name.clone());
                    match waiter.reply {
                        WaiterReply::Reader(reply) => {
                            let _ = reply.send(Err(err));
                        }
                        WaiterReply::Describe(reply) => {
                            if self.conf.fallback.is_empty() {
                                let _ = reply.send(Err(err));
                            } else {
                                let _ = reply.send(Ok(DescribeResult::Redirect(
                                    self.conf.fallback.clone(),
                                )));
                            }
                        }
                    }
                }
                self.maybe_notify_idle();
            }
        }

        if self.close_deadline.is_some_and(|d| d <= now) {
            self.close_deadline = None;
            if self.readers.is_empty() {
                tracing::info!("path '{}': idle, stopping on-demand source", self.name);
                self.stop_on_demand();
            }
        }
    }

    fn maybe_notify_idle(&self) {
        if self.dynamic
            && self.publisher.is_none()
            && self.readers.is_empty()
            && self.waiters.is_empty()
        {
            let _ = self.notice_tx.send(PathNotice::Idle {
                name: self.name.clone(),
            });
        }
    }

    fn api_info(&self) -> PathInfo {
        PathInfo {
            name: self.name.clone(),
            conf_name: self.conf.name.clone(),
            source: self.publisher.as_ref().map(|p| SessionRef {
                kind: p.label.clone(),
                id: p.id,
            }),
            ready: self.state == PathState::Ready,
            ready_time: self.ready_time,
            tracks: self
                .publisher
                .as_ref()
                .map(|p| p.stream.desc().track_codecs())
                .unwrap_or_default(),
            bytes_received: self
                .publisher
                .as_ref()
                .map(|p| p.stream.stats().bytes_received)
                .unwrap_or_default(),
            readers: self
                .readers
                .iter()
                .map(|(id, (label, _))| SessionRef {
                    kind: label.clone(),
                    id: *id,
                })
                .collect(),
        }
    }

    async fn teardown(&mut self) {
        self.state = PathState::Terminating;

        for waiter in self.waiters.drain(..) {
            match waiter.reply {
                WaiterReply::Reader(reply) => {
                    let _ = reply.send(Err(Error::Terminated));
                }
                WaiterReply::Describe(reply) => {
                    let _ = reply.send(Err(Error::Terminated));
                }
            }
        }

        // answer anything still queued in the inbox
        while let Ok(cmd) = self.rx.try_recv() {
            match cmd {
                PathCommand::AddPublisher { reply, .. } => {
                    let _ = reply.send(Err(Error::Terminated));
                }
                PathCommand::AddReader { reply, .. } => {
                    let _ = reply.send(Err(Error::Terminated));
                }
                PathCommand::Describe { reply } => {
                    let _ = reply.send(Err(Error::Terminated));
                }
                PathCommand::ApiGet { reply } => {
                    let _ = reply.send(self.api_info());
                }
                PathCommand::Terminate { reply } => {
                    let _ = reply.send(());
                }
                PathCommand::RemovePublisher { .. } | PathCommand::RemoveReader { .. } => {}
            }
        }

        if let Some(recorder) = self.recorder.take() {
            recorder.close();
        }
        if let Some(p) = self.publisher.take() {
            p.stream.close();
        }
        self.stop_on_demand();
        if let Some(s) = self.static_source.take() {
            s.close();
        }
        for (_, (_, on_read)) in self.readers.drain() {
            if let Some(h) = on_read {
                h.close().await;
            }
        }
        if let Some(h) = self.on_ready_hook.take() {
            h.close().await;
        }
        if let Some(h) = self.on_init_hook.take() {
            h.close().await;
        }
    }

    fn hook_env(&self, query: &str) -> HookEnv {
        HookEnv {
            path: self.name.clone(),
            query: query.to_string(),
            ..HookEnv::default()
        }
    }
}
