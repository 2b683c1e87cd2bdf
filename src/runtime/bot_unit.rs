//! Bot unit - owns one account's connection, permission model and settings
//!
//! The unit loop multiplexes its mailbox, the connector's event stream and
//! the tasks it spawned. Remote calls from plugins run in spawned tasks so
//! the loop keeps routing replies while a call is waiting on something else.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::application::errors::BotError;
use crate::application::services::{DisabledPlugins, Profile};
use crate::domain::entities::{ConnectorEvent, LoginEvent, Message, PermissionLevel, PermissionPolicy};
use crate::domain::traits::{Connector, ConnectorFactory, ConnectorSession, DocumentStore, GroupInfo};
use crate::infrastructure::config::AccountConfig;

use super::link::{LinkId, PluginLink};
use super::protocol::{
    BotCall, BotInbox, BotStatus, PluginCall, PluginEvent, PluginState, PluginSummary, RemoteResult,
    SuperviseRequest, ToBot,
};
use super::supervisor::{ShutdownReason, SupervisorHandle};

/// How many fanned-out messages keep their resolved level for setting calls
const ISSUED_CAPACITY: usize = 512;

pub struct BotUnit {
    account: AccountConfig,
    policy: PermissionPolicy,
    factory: Arc<dyn ConnectorFactory>,
    store: Arc<dyn DocumentStore>,
    supervisor: SupervisorHandle,
    inbox: mpsc::UnboundedReceiver<BotInbox>,
}

struct Attached {
    link: PluginLink,
    core: bool,
}

/// State reachable from the unit loop and from the tasks it spawns
struct BotShared {
    uin: String,
    connector: Arc<dyn Connector>,
    profile: Mutex<Profile>,
    disabled: Mutex<DisabledPlugins>,
    links: RwLock<BTreeMap<String, Attached>>,
    issued: Mutex<IssuedLevels>,
    supervisor: SupervisorHandle,
    /// Set on the first `Online` event of this incarnation
    seen_online: AtomicBool,
}

impl BotUnit {
    pub fn new(
        account: AccountConfig,
        policy: PermissionPolicy,
        factory: Arc<dyn ConnectorFactory>,
        store: Arc<dyn DocumentStore>,
        supervisor: SupervisorHandle,
    ) -> (Self, mpsc::UnboundedSender<BotInbox>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let unit = Self {
            account,
            policy,
            factory,
            store,
            supervisor,
            inbox: rx,
        };
        (unit, tx)
    }

    pub async fn run(self) -> Result<(), BotError> {
        let uin = self.account.uin.clone();
        let ConnectorSession { connector, mut events } = self.factory.connect(&self.account)?;
        let profile = Profile::load(&uin, self.store.clone()).await?;
        let disabled = DisabledPlugins::load(&uin, self.store.clone()).await?;

        let shared = Arc::new(BotShared {
            uin: uin.clone(),
            connector,
            profile: Mutex::new(profile),
            disabled: Mutex::new(disabled),
            links: RwLock::new(BTreeMap::new()),
            issued: Mutex::new(IssuedLevels::default()),
            supervisor: self.supervisor,
            seen_online: AtomicBool::new(false),
        });
        let policy = self.policy;
        let mut inbox = self.inbox;
        let mut tasks = JoinSet::new();

        if let Err(e) = shared.connector.login().await {
            if e.is_fatal() {
                error!(account = %uin, error = %e, "login rejected");
                shared.connector.terminate().await;
                return Err(e);
            }
            warn!(account = %uin, error = %e, "login failed");
        }
        info!(account = %uin, "bot unit started");

        let mut logout = false;
        let result = loop {
            tokio::select! {
                msg = inbox.recv() => match msg {
                    Some(BotInbox::Terminate { logout: sign_off }) => {
                        logout = sign_off;
                        break Ok(());
                    }
                    None => break Ok(()),
                    Some(msg) => shared.on_inbox(msg, &mut tasks).await,
                },
                event = events.recv() => match event {
                    Some(event) => {
                        if let Err(e) = shared.on_connector_event(event, &policy, &mut tasks).await {
                            break Err(e);
                        }
                    }
                    None => break Err(BotError::connector("connector event stream closed")),
                },
                Some(done) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = done {
                        if e.is_panic() {
                            warn!(account = %uin, "bot task panicked");
                        }
                    }
                }
            }
        };

        shared.shutdown(logout, &mut tasks).await;
        result
    }
}

impl BotShared {
    async fn on_inbox(self: &Arc<Self>, msg: BotInbox, tasks: &mut JoinSet<()>) {
        match msg {
            BotInbox::Attach { endpoint, manifest, ack } => {
                if !manifest.core {
                    self.profile
                        .lock()
                        .await
                        .register_plugin(&manifest.name, manifest.defaults.clone());
                }
                let id = endpoint.id();
                let attached = Attached {
                    link: endpoint,
                    core: manifest.core,
                };
                if let Some(old) = self.links.write().await.insert(manifest.name.clone(), attached) {
                    old.link.close("link replaced");
                }
                debug!(account = %self.uin, plugin = %manifest.name, link = id, "link attached");
                let _ = ack.send(());

                // Fill settings of a plugin added after the first connection
                if !manifest.core && self.seen_online.load(Ordering::Acquire) {
                    tasks.spawn(self.clone().refresh());
                }
            }
            BotInbox::Detach { plugin, link } => self.detach(&plugin, link).await,
            BotInbox::Frame { link, from, frame } => {
                let Some(endpoint) = self.endpoint(&from, link).await else {
                    error!(account = %self.uin, plugin = %from, link, "frame from unlinked plugin dropped");
                    return;
                };
                match frame {
                    ToBot::Request { id, call } => {
                        let shared = self.clone();
                        tasks.spawn(async move {
                            let method = call.method();
                            let result = shared.execute(&from, call).await;
                            if let Err(e) = &result {
                                debug!(account = %shared.uin, plugin = %from, method, error = %e, "remote call failed");
                            }
                            if let Err(e) = endpoint.respond(id, result) {
                                error!(account = %shared.uin, plugin = %from, error = %e, "failed to answer request");
                            }
                        });
                    }
                    ToBot::Response { id, result } => {
                        if !endpoint.resolve(id, result) {
                            debug!(account = %self.uin, plugin = %from, call = id, "late reply dropped");
                        }
                    }
                }
            }
            BotInbox::Terminate { .. } => {}
        }
    }

    async fn endpoint(&self, plugin: &str, link: LinkId) -> Option<PluginLink> {
        self.links
            .read()
            .await
            .get(plugin)
            .filter(|a| a.link.id() == link)
            .map(|a| a.link.clone())
    }

    async fn detach(&self, plugin: &str, link: LinkId) {
        let mut links = self.links.write().await;
        if links.get(plugin).map(|a| a.link.id()) == Some(link) {
            if let Some(old) = links.remove(plugin) {
                let failed = old.link.close("link torn down");
                debug!(account = %self.uin, plugin = %plugin, link, failed, "link detached");
            }
        }
    }

    async fn on_connector_event(
        self: &Arc<Self>,
        event: ConnectorEvent,
        policy: &PermissionPolicy,
        tasks: &mut JoinSet<()>,
    ) -> Result<(), BotError> {
        debug!(account = %self.uin, kind = event.kind(), "connector event");
        match event {
            ConnectorEvent::Message(mut message) => {
                message.permission = policy.resolve(&message.sender, message.scope.is_group());
                if let Some(group_id) = message.scope.group_id() {
                    message.setting = self.profile.lock().await.snapshot(group_id);
                }
                self.issued.lock().await.record(&message);
                self.fan_out(PluginEvent::Message(Arc::new(message))).await;
            }
            ConnectorEvent::GroupIncrease(notice) => {
                if notice.user_id == self.uin {
                    let group = GroupInfo::new(&notice.group_id, notice.group_name.clone().unwrap_or_default());
                    if let Err(e) = self.profile.lock().await.on_group_join(&group).await {
                        warn!(account = %self.uin, group = %notice.group_id, error = %e, "failed to add group settings");
                    }
                }
                self.fan_out(PluginEvent::GroupIncrease(notice)).await;
            }
            ConnectorEvent::GroupDecrease(notice) => {
                if notice.user_id == self.uin {
                    if let Err(e) = self.profile.lock().await.on_group_leave(&notice.group_id).await {
                        warn!(account = %self.uin, group = %notice.group_id, error = %e, "failed to drop group settings");
                    }
                }
                self.fan_out(PluginEvent::GroupDecrease(notice)).await;
            }
            ConnectorEvent::Online => {
                info!(account = %self.uin, nickname = %self.connector.nickname(), "online");
                if !self.seen_online.swap(true, Ordering::AcqRel) {
                    tasks.spawn(self.clone().refresh());
                }
                if let Err(e) = self.supervisor.announce(&self.uin, true) {
                    warn!(account = %self.uin, error = %e, "failed to announce");
                }
                self.fan_out(PluginEvent::Online).await;
            }
            ConnectorEvent::Offline { reason } => {
                warn!(account = %self.uin, reason = %reason, "offline");
                if let Err(e) = self.supervisor.announce(&self.uin, false) {
                    warn!(account = %self.uin, error = %e, "failed to announce");
                }
                self.fan_out(PluginEvent::Offline).await;
            }
            ConnectorEvent::Login(LoginEvent::Challenge { kind, detail }) => {
                info!(account = %self.uin, kind = %kind, detail = %detail, "login challenge");
            }
            ConnectorEvent::Login(LoginEvent::Failed { reason, fatal }) => {
                if fatal {
                    error!(account = %self.uin, reason = %reason, "login failed");
                    return Err(BotError::fatal_connector(reason));
                }
                warn!(account = %self.uin, reason = %reason, "login failed, waiting for the connector to retry");
            }
        }
        Ok(())
    }

    /// Deliver to every linked plugin that is not disabled for this account
    async fn fan_out(&self, event: PluginEvent) {
        let links = self.links.read().await;
        let disabled = self.disabled.lock().await;
        for (name, attached) in links.iter() {
            if !attached.core && disabled.contains(name) {
                continue;
            }
            if let Err(e) = attached.link.send_event(event.clone()) {
                error!(account = %self.uin, plugin = %name, link = attached.link.id(), error = %e, "fan-out failed");
            }
        }
    }

    async fn refresh(self: Arc<Self>) {
        let groups = match self.connector.group_list().await {
            Ok(groups) => groups,
            Err(e) => {
                warn!(account = %self.uin, error = %e, "cannot list groups, settings not refreshed");
                return;
            }
        };
        match self.profile.lock().await.refresh(&groups).await {
            Ok(true) => info!(account = %self.uin, groups = groups.len(), "settings refreshed"),
            Ok(false) => debug!(account = %self.uin, "settings already current"),
            Err(e) => warn!(account = %self.uin, error = %e, "settings refresh failed"),
        }
    }

    /// Call into one linked plugin, bounded by the link timeout
    async fn execute_remote(&self, plugin: &str, call: PluginCall) -> RemoteResult {
        let link = self
            .links
            .read()
            .await
            .get(plugin)
            .map(|a| a.link.clone())
            .ok_or_else(|| BotError::link(format!("plugin {} is not linked to {}", plugin, self.uin)))?;
        link.request(call).await
    }

    async fn execute(self: &Arc<Self>, from: &str, call: BotCall) -> RemoteResult {
        match call {
            BotCall::SendPrivateMessage { user_id, text } => {
                let id = self.connector.send_private_message(&user_id, &text).await?;
                Ok(Value::String(id))
            }
            BotCall::SendGroupMessage { group_id, text } => {
                let id = self.connector.send_group_message(&group_id, &text).await?;
                Ok(Value::String(id))
            }
            BotCall::Status => {
                let stat = self.connector.stat();
                let status = BotStatus {
                    uin: self.uin.clone(),
                    nickname: self.connector.nickname(),
                    online: self.connector.is_online(),
                    groups: self.connector.group_list().await?.len(),
                    friends: self.connector.friend_list().await?.len(),
                    plugins: self.links.read().await.len(),
                    sent: stat.sent,
                    received: stat.received,
                };
                to_value(&status)
            }
            BotCall::GroupList => to_value(&self.connector.group_list().await?),
            BotCall::FriendList => to_value(&self.connector.friend_list().await?),
            BotCall::GroupSetting { group_id } => {
                let profile = self.profile.lock().await;
                let setting = profile
                    .group(&group_id)
                    .ok_or_else(|| BotError::validation(format!("no settings for group {}", group_id)))?;
                to_value(setting)
            }
            BotCall::MutateSetting {
                group_id,
                plugin,
                key,
                value,
                message_id,
            } => {
                let caller = self.issued.lock().await.level_in(&message_id, &group_id)?;
                let mut profile = self.profile.lock().await;
                known_plugin(&profile, &plugin)?;
                profile.ensure_unlocked(&group_id, &plugin, caller)?;
                if key == "lock" && caller < PermissionLevel::MASTER {
                    return Err(BotError::validation("changing 'lock' requires level 5"));
                }
                profile.mutate_setting(&group_id, &plugin, &key, value).await?;
                Ok(Value::Null)
            }
            BotCall::SetApply {
                group_id,
                plugin,
                apply,
                message_id,
            } => {
                let caller = self.issued.lock().await.level_in(&message_id, &group_id)?;
                let mut profile = self.profile.lock().await;
                known_plugin(&profile, &plugin)?;
                profile.set_apply(&group_id, &plugin, apply, caller).await?;
                Ok(Value::Null)
            }
            BotCall::EnablePlugin { name } => {
                self.disabled.lock().await.enable(&name).await?;
                info!(account = %self.uin, plugin = %name, "plugin enabled");
                Ok(Value::Null)
            }
            BotCall::DisablePlugin { name } => {
                match self.links.read().await.get(&name) {
                    Some(a) if a.core => {
                        return Err(BotError::validation(format!("{} is a core plugin and cannot be disabled", name)))
                    }
                    Some(_) => {}
                    None => return Err(BotError::validation(format!("unknown plugin '{}'", name))),
                }
                self.disabled.lock().await.disable(&name).await?;
                info!(account = %self.uin, plugin = %name, "plugin disabled");
                Ok(Value::Null)
            }
            BotCall::Plugins => {
                let links = self.links.read().await;
                let disabled = self.disabled.lock().await;
                let states: Vec<PluginState> = links
                    .iter()
                    .map(|(name, a)| PluginState {
                        name: name.clone(),
                        core: a.core,
                        disabled: !a.core && disabled.contains(name),
                    })
                    .collect();
                to_value(&states)
            }
            BotCall::Help { topic } => Ok(Value::String(self.help(topic.as_deref()).await?)),
            BotCall::Supervise(request) => {
                info!(account = %self.uin, plugin = %from, ?request, "supervise request");
                Ok(Value::String(self.supervise(request).await?))
            }
        }
    }

    async fn describe_all(&self) -> Vec<PluginSummary> {
        let names: Vec<String> = {
            let links = self.links.read().await;
            let disabled = self.disabled.lock().await;
            links
                .iter()
                .filter(|(name, a)| a.core || !disabled.contains(name.as_str()))
                .map(|(name, _)| name.clone())
                .collect()
        };

        let mut summaries = Vec::with_capacity(names.len());
        for name in names {
            let described = self
                .execute_remote(&name, PluginCall::Describe)
                .await
                .and_then(|raw| serde_json::from_value::<PluginSummary>(raw).map_err(|e| BotError::Internal(e.to_string())));
            match described {
                Ok(summary) => summaries.push(summary),
                Err(e) => warn!(account = %self.uin, plugin = %name, error = %e, "describe failed"),
            }
        }
        summaries
    }

    async fn help(&self, topic: Option<&str>) -> Result<String, BotError> {
        let summaries = self.describe_all().await;

        let Some(topic) = topic else {
            let mut out = String::from("Plugins:");
            for s in &summaries {
                out.push_str(&format!("\n  {} - {}", s.name, s.description.as_deref().unwrap_or("")));
            }
            if let Some(core) = summaries.iter().find(|s| s.core) {
                out.push_str(&format!("\nUse {}help <plugin> to list its commands", core.prefix));
            }
            return Ok(out);
        };

        if let Some(plugin) = summaries.iter().find(|s| s.name.eq_ignore_ascii_case(topic)) {
            let mut out = format!("{}:", plugin.name);
            for c in &plugin.commands {
                out.push_str(&format!("\n  {}{}", plugin.prefix, c.signature));
                if let Some(desc) = &c.description {
                    out.push_str(&format!(" - {}", desc));
                }
                out.push_str(&format!(" [{}, {}]", c.scope, c.permission));
            }
            return Ok(out);
        }

        for plugin in &summaries {
            let found = plugin.commands.iter().find(|c| {
                c.signature
                    .split_whitespace()
                    .next()
                    .is_some_and(|name| name.eq_ignore_ascii_case(topic))
            });
            if let Some(c) = found {
                return Ok(format!(
                    "{}{} ({})\n  {}\n  scope: {}, levels: {}",
                    plugin.prefix,
                    c.signature,
                    plugin.name,
                    c.description.as_deref().unwrap_or("no description"),
                    c.scope,
                    c.permission
                ));
            }
        }
        Err(BotError::validation(format!("no help for '{}'", topic)))
    }

    async fn supervise(&self, request: SuperviseRequest) -> Result<String, BotError> {
        let supervisor = &self.supervisor;
        let done = match request {
            SuperviseRequest::Mount(name) => {
                supervisor.mount(&name).await?;
                format!("Plugin {} mounted", name)
            }
            SuperviseRequest::Unmount(name) => {
                supervisor.unmount(&name).await?;
                format!("Plugin {} unmounted", name)
            }
            SuperviseRequest::Reload(name) => {
                supervisor.reload(&name).await?;
                format!("Plugin {} reloaded", name)
            }
            SuperviseRequest::Login(uin) => {
                supervisor.login(&uin).await?;
                format!("Account {} logged in", uin)
            }
            SuperviseRequest::Logout(uin) if uin == self.uin => {
                // Tearing this unit down would cancel the call that asked for it
                let supervisor = supervisor.clone();
                tokio::spawn(async move {
                    if let Err(e) = supervisor.logout(&uin).await {
                        warn!(account = %uin, error = %e, "logout failed");
                    }
                });
                format!("Account {} logging out", self.uin)
            }
            SuperviseRequest::Logout(uin) => {
                supervisor.logout(&uin).await?;
                format!("Account {} logged out", uin)
            }
            SuperviseRequest::Restart => {
                supervisor.shutdown(ShutdownReason::Restart)?;
                "Restarting".to_string()
            }
            SuperviseRequest::Shutdown => {
                supervisor.shutdown(ShutdownReason::Shutdown)?;
                "Shutting down".to_string()
            }
        };
        Ok(done)
    }

    async fn shutdown(&self, logout: bool, tasks: &mut JoinSet<()>) {
        for (_, attached) in std::mem::take(&mut *self.links.write().await) {
            attached.link.close("bot unit terminating");
        }
        tasks.shutdown().await;
        if logout {
            if let Err(e) = self.connector.logout().await {
                warn!(account = %self.uin, error = %e, "logout failed");
            }
        }
        self.connector.terminate().await;
        info!(account = %self.uin, "bot unit stopped");
    }
}

/// Levels this bot resolved for recent messages, oldest dropped first
///
/// Setting changes name the message they act on instead of a level, so a
/// plugin cannot claim more than the sender was granted.
#[derive(Default)]
struct IssuedLevels {
    levels: HashMap<String, (Option<String>, PermissionLevel)>,
    order: VecDeque<String>,
}

impl IssuedLevels {
    fn record(&mut self, message: &Message) {
        let group = message.scope.group_id().map(str::to_string);
        if self.levels.insert(message.id.clone(), (group, message.permission)).is_some() {
            return;
        }
        self.order.push_back(message.id.clone());
        if self.order.len() > ISSUED_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.levels.remove(&oldest);
            }
        }
    }

    /// Level of the sender of `message_id`, which must come from `group_id`
    fn level_in(&self, message_id: &str, group_id: &str) -> Result<PermissionLevel, BotError> {
        match self.levels.get(message_id) {
            Some((Some(group), level)) if group == group_id => Ok(*level),
            Some(_) => Err(BotError::validation(format!(
                "message {} was not sent in group {}",
                message_id, group_id
            ))),
            None => Err(BotError::validation(format!("unknown message {}", message_id))),
        }
    }
}

fn known_plugin(profile: &Profile, plugin: &str) -> Result<(), BotError> {
    if profile.has_plugin(plugin) {
        Ok(())
    } else {
        Err(BotError::validation(format!("unknown plugin '{}'", plugin)))
    }
}

fn to_value<T: Serialize>(value: &T) -> RemoteResult {
    serde_json::to_value(value).map_err(|e| BotError::Internal(e.to_string()))
}
