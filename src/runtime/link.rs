//! Link endpoints and the correlation table behind remote calls
//!
//! A link joins exactly one bot unit and one plugin unit. Each side holds an
//! endpoint that delivers frames into the peer's mailbox, stamped with the
//! link id, plus its own table of calls awaiting a reply.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::application::errors::BotError;

use super::protocol::{BotCall, BotInbox, PluginCall, PluginEvent, PluginInbox, RemoteResult, ToBot, ToPlugin};

pub type LinkId = u64;

/// Pending remote calls of one endpoint, keyed by correlation id.
///
/// An entry leaves the table exactly once: through [`resolve`](Self::resolve)
/// when the reply arrives, or through [`cancel`](Self::cancel) on timeout.
#[derive(Default)]
pub struct CorrelationTable {
    next: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<RemoteResult>>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> (u64, oneshot::Receiver<RemoteResult>) {
        let id = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, tx);
        (id, rx)
    }

    /// Deliver a reply; false if the entry was already gone
    pub fn resolve(&self, id: u64, result: RemoteResult) -> bool {
        match self.lock().remove(&id) {
            Some(tx) => {
                // The caller may have given up between removal and send
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    pub fn cancel(&self, id: u64) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Fail every pending call, used when the link goes down
    pub fn fail_all(&self, error: BotError) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(error.clone()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<RemoteResult>>> {
        // A panic while holding this lock cannot leave the map inconsistent
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// State shared by both endpoints of one link
#[derive(Clone)]
struct LinkCore {
    id: LinkId,
    alive: Arc<AtomicBool>,
    pending: Arc<CorrelationTable>,
    timeout: Duration,
}

impl LinkCore {
    async fn round_trip<F>(&self, method: &'static str, send: F) -> RemoteResult
    where
        F: FnOnce(u64) -> Result<(), BotError>,
    {
        if !self.alive.load(Ordering::Acquire) {
            return Err(BotError::link(format!("link {} is down", self.id)));
        }

        let (id, rx) = self.pending.register();
        if let Err(e) = send(id) {
            self.pending.cancel(id);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BotError::link(format!("link {} closed during '{}'", self.id, method))),
            Err(_) => {
                self.pending.cancel(id);
                debug!(link = self.id, call = id, method, "remote call timed out");
                Err(BotError::Timeout {
                    method: method.to_string(),
                    after: self.timeout,
                })
            }
        }
    }
}

/// A plugin's view of one bot
#[derive(Clone)]
pub struct BotLink {
    account: String,
    plugin: String,
    tx: mpsc::UnboundedSender<BotInbox>,
    core: LinkCore,
}

/// A bot's view of one plugin
#[derive(Clone)]
pub struct PluginLink {
    plugin: String,
    account: String,
    tx: mpsc::UnboundedSender<PluginInbox>,
    core: LinkCore,
}

/// Build both endpoints of a new link
pub fn connect(
    id: LinkId,
    account: &str,
    plugin: &str,
    bot_inbox: mpsc::UnboundedSender<BotInbox>,
    plugin_inbox: mpsc::UnboundedSender<PluginInbox>,
    timeout: Duration,
) -> (PluginLink, BotLink, Arc<AtomicBool>) {
    let alive = Arc::new(AtomicBool::new(true));
    let core = |alive: &Arc<AtomicBool>| LinkCore {
        id,
        alive: alive.clone(),
        pending: Arc::new(CorrelationTable::new()),
        timeout,
    };

    let for_bot = PluginLink {
        plugin: plugin.to_string(),
        account: account.to_string(),
        tx: plugin_inbox,
        core: core(&alive),
    };
    let for_plugin = BotLink {
        account: account.to_string(),
        plugin: plugin.to_string(),
        tx: bot_inbox,
        core: core(&alive),
    };
    (for_bot, for_plugin, alive)
}

impl BotLink {
    pub fn id(&self) -> LinkId {
        self.core.id
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn is_alive(&self) -> bool {
        self.core.alive.load(Ordering::Acquire)
    }

    /// Remote call into the bot, bounded by the link timeout
    pub async fn request(&self, call: BotCall) -> RemoteResult {
        let method = call.method();
        self.core
            .round_trip(method, |id| self.send(ToBot::Request { id, call }))
            .await
    }

    pub fn respond(&self, id: u64, result: RemoteResult) -> Result<(), BotError> {
        self.send(ToBot::Response { id, result })
    }

    pub(crate) fn resolve(&self, id: u64, result: RemoteResult) -> bool {
        self.core.pending.resolve(id, result)
    }

    pub(crate) fn close(&self, reason: &str) -> usize {
        self.core.pending.fail_all(BotError::link(reason.to_string()))
    }

    fn send(&self, frame: ToBot) -> Result<(), BotError> {
        if !self.is_alive() {
            return Err(BotError::link(format!("link {} to bot {} is down", self.core.id, self.account)));
        }
        self.tx
            .send(BotInbox::Frame {
                link: self.core.id,
                from: self.plugin.clone(),
                frame,
            })
            .map_err(|_| BotError::link(format!("bot {} is gone", self.account)))
    }

    pub async fn send_private_message(&self, user_id: &str, text: &str) -> Result<Value, BotError> {
        self.request(BotCall::SendPrivateMessage {
            user_id: user_id.to_string(),
            text: text.to_string(),
        })
        .await
    }

    pub async fn send_group_message(&self, group_id: &str, text: &str) -> Result<Value, BotError> {
        self.request(BotCall::SendGroupMessage {
            group_id: group_id.to_string(),
            text: text.to_string(),
        })
        .await
    }
}

impl PluginLink {
    pub fn id(&self) -> LinkId {
        self.core.id
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn is_alive(&self) -> bool {
        self.core.alive.load(Ordering::Acquire)
    }

    pub fn send_event(&self, event: PluginEvent) -> Result<(), BotError> {
        self.send(ToPlugin::Event(event))
    }

    /// Remote call into the plugin, bounded by the link timeout
    pub async fn request(&self, call: PluginCall) -> RemoteResult {
        let method = call.method();
        self.core
            .round_trip(method, |id| self.send(ToPlugin::Request { id, call }))
            .await
    }

    pub fn respond(&self, id: u64, result: RemoteResult) -> Result<(), BotError> {
        self.send(ToPlugin::Response { id, result })
    }

    pub(crate) fn resolve(&self, id: u64, result: RemoteResult) -> bool {
        self.core.pending.resolve(id, result)
    }

    pub(crate) fn close(&self, reason: &str) -> usize {
        self.core.pending.fail_all(BotError::link(reason.to_string()))
    }

    fn send(&self, frame: ToPlugin) -> Result<(), BotError> {
        if !self.is_alive() {
            return Err(BotError::link(format!("link {} to plugin {} is down", self.core.id, self.plugin)));
        }
        self.tx
            .send(PluginInbox::Frame {
                link: self.core.id,
                from: self.account.clone(),
                frame,
            })
            .map_err(|_| BotError::link(format!("plugin {} is gone", self.plugin)))
    }
}
