//! Supervisor - owns the unit pool and the link mesh
//!
//! The supervisor is an actor: every change to the pool or to the mesh goes
//! through its command channel, so no other component can enumerate or touch
//! units directly. Slow steps (link handshakes, waiting for a unit to exit,
//! restart delays) run in spawned tasks that report back as commands.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::application::errors::BotError;
use crate::domain::entities::PermissionPolicy;
use crate::domain::traits::{ConnectorFactory, DocumentStore};
use crate::infrastructure::config::{AccountConfig, Config};
use crate::plugins::{PluginCatalog, PluginDescriptor};

use super::bot_unit::BotUnit;
use super::link::{self, LinkId};
use super::plugin_unit::PluginUnit;
use super::protocol::{BotInbox, PluginInbox};

/// Identity of a unit in the pool
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum UnitId {
    Bot(String),
    Plugin(String),
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitId::Bot(uin) => write!(f, "bot:{}", uin),
            UnitId::Plugin(name) => write!(f, "plugin:{}", name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UnitState {
    Starting,
    Online,
    Degraded,
    Restarting,
    Terminating,
    Exited,
}

/// Initialization arguments, reused verbatim on respawn
#[derive(Clone)]
pub enum UnitSpec {
    Bot(AccountConfig),
    Plugin(Arc<PluginDescriptor>),
}

impl UnitSpec {
    pub fn id(&self) -> UnitId {
        match self {
            UnitSpec::Bot(account) => UnitId::Bot(account.uin.clone()),
            UnitSpec::Plugin(plugin) => UnitId::Plugin(plugin.name().to_string()),
        }
    }
}

/// Snapshot of one unit for status queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitStatus {
    pub id: UnitId,
    pub state: UnitState,
    pub generation: u64,
    pub restart_count: u32,
    pub links: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Shutdown,
    /// Boot a fresh supervisor from re-read configuration
    Restart,
}

/// Exit codes reported by unit tasks
const EXIT_OK: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 101;

type Reply<T> = oneshot::Sender<Result<T, BotError>>;

type UnitFuture = Pin<Box<dyn Future<Output = Result<(), BotError>> + Send>>;

enum Command {
    Spawn { spec: UnitSpec, reply: Reply<()> },
    Terminate { id: UnitId, logout: bool, reply: Reply<()> },
    MeshLink { account: String, plugin: String, reply: Reply<()> },
    Announce { account: String, online: bool },
    Status { reply: oneshot::Sender<Vec<UnitStatus>> },
    Shutdown(ShutdownReason),
    // Reports from tasks the supervisor spawned
    Online { id: UnitId, incarnation: u64 },
    Exited { id: UnitId, incarnation: u64, code: i32 },
    Respawn { id: UnitId, incarnation: u64 },
    Removed { id: UnitId, incarnation: u64, reply: Reply<()> },
    LinkFailed { account: String, plugin: String, link: LinkId },
}

enum UnitInbox {
    Bot(mpsc::UnboundedSender<BotInbox>),
    Plugin(mpsc::UnboundedSender<PluginInbox>),
}

impl UnitInbox {
    fn terminate(&self, logout: bool) {
        match self {
            UnitInbox::Bot(tx) => {
                let _ = tx.send(BotInbox::Terminate { logout });
            }
            UnitInbox::Plugin(tx) => {
                let _ = tx.send(PluginInbox::Terminate);
            }
        }
    }
}

/// A running incarnation of a unit
struct Running {
    inbox: UnitInbox,
    abort: AbortHandle,
    exited: watch::Receiver<bool>,
}

struct UnitEntry {
    spec: UnitSpec,
    state: UnitState,
    /// Incarnations started so far under this id
    generation: u64,
    /// Supervisor-wide id of the current incarnation
    incarnation: u64,
    restart_count: u32,
    online_since: Option<Instant>,
    running: Option<Running>,
}

impl UnitEntry {
    fn accepts_links(&self) -> bool {
        self.running.is_some() && !matches!(self.state, UnitState::Terminating | UnitState::Exited)
    }
}

struct LinkRecord {
    id: LinkId,
    alive: Arc<AtomicBool>,
}

/// Cloneable front end of the supervisor actor
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::UnboundedSender<Command>,
    catalog: Arc<PluginCatalog>,
    config: Arc<Config>,
}

impl SupervisorHandle {
    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, BotError> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply))?;
        rx.await.map_err(|_| BotError::lifecycle("supervisor stopped"))?
    }

    fn send(&self, command: Command) -> Result<(), BotError> {
        self.tx
            .send(command)
            .map_err(|_| BotError::lifecycle("supervisor stopped"))
    }

    /// Create a unit and wait until its links are up
    pub async fn spawn(&self, spec: UnitSpec) -> Result<(), BotError> {
        self.call(|reply| Command::Spawn { spec, reply }).await
    }

    /// Terminate a unit, tear down its links and drop it from the pool
    pub async fn destroy(&self, id: UnitId) -> Result<(), BotError> {
        self.call(|reply| Command::Terminate { id, logout: false, reply }).await
    }

    /// Link one bot to one plugin; a no-op if the link already exists
    pub async fn mesh_link(&self, account: &str, plugin: &str) -> Result<(), BotError> {
        let (account, plugin) = (account.to_string(), plugin.to_string());
        self.call(|reply| Command::MeshLink { account, plugin, reply }).await
    }

    pub async fn mount(&self, name: &str) -> Result<(), BotError> {
        let plugin = self
            .catalog
            .get(name)
            .ok_or_else(|| BotError::validation(format!("unknown plugin '{}'", name)))?;
        match self.spawn(UnitSpec::Plugin(plugin)).await {
            Err(BotError::Spawn(_)) => Err(BotError::lifecycle(format!("plugin {} is already mounted", name))),
            other => other,
        }
    }

    pub async fn unmount(&self, name: &str) -> Result<(), BotError> {
        let name = name.to_lowercase();
        if self.catalog.get(&name).is_some_and(|p| p.is_core()) {
            return Err(BotError::lifecycle(format!("{} is a core plugin and stays mounted", name)));
        }
        self.destroy(UnitId::Plugin(name.clone()))
            .await
            .map_err(|e| match e {
                BotError::Lifecycle(_) => BotError::lifecycle(format!("plugin {} is not mounted", name)),
                other => other,
            })
    }

    pub async fn reload(&self, name: &str) -> Result<(), BotError> {
        self.unmount(name).await?;
        self.mount(name).await
    }

    pub async fn login(&self, uin: &str) -> Result<(), BotError> {
        let account = self
            .config
            .account(uin)
            .cloned()
            .ok_or_else(|| BotError::validation(format!("no account {} in the configuration", uin)))?;
        self.spawn(UnitSpec::Bot(account)).await
    }

    /// Sign the account off and drop its bot unit
    pub async fn logout(&self, uin: &str) -> Result<(), BotError> {
        let id = UnitId::Bot(uin.to_string());
        self.call(|reply| Command::Terminate { id, logout: true, reply }).await
    }

    /// Report a bot's connection state; going online re-runs its links
    pub fn announce(&self, account: &str, online: bool) -> Result<(), BotError> {
        self.send(Command::Announce {
            account: account.to_string(),
            online,
        })
    }

    pub async fn status(&self) -> Result<Vec<UnitStatus>, BotError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { reply })?;
        rx.await.map_err(|_| BotError::lifecycle("supervisor stopped"))
    }

    /// Ask the supervisor to stop every unit and exit; does not wait
    pub fn shutdown(&self, reason: ShutdownReason) -> Result<(), BotError> {
        self.send(Command::Shutdown(reason))
    }
}

pub struct Supervisor {
    rx: mpsc::UnboundedReceiver<Command>,
    handle: SupervisorHandle,
    config: Arc<Config>,
    factory: Arc<dyn ConnectorFactory>,
    store: Arc<dyn DocumentStore>,
    units: BTreeMap<UnitId, UnitEntry>,
    links: HashMap<(String, String), LinkRecord>,
    next_link: LinkId,
    next_incarnation: u64,
}

impl Supervisor {
    /// Start the actor, mount core and configured plugins, then log in the
    /// auto-login accounts. Returns once the initial mesh is up.
    pub async fn start(
        config: Arc<Config>,
        catalog: Arc<PluginCatalog>,
        factory: Arc<dyn ConnectorFactory>,
        store: Arc<dyn DocumentStore>,
    ) -> Result<(SupervisorHandle, JoinHandle<ShutdownReason>), BotError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SupervisorHandle {
            tx,
            catalog: catalog.clone(),
            config: config.clone(),
        };
        let supervisor = Supervisor {
            rx,
            handle: handle.clone(),
            config: config.clone(),
            factory,
            store,
            units: BTreeMap::new(),
            links: HashMap::new(),
            next_link: 0,
            next_incarnation: 0,
        };
        let task = tokio::spawn(supervisor.run());

        if let Err(e) = boot(&handle, &config, &catalog).await {
            let _ = handle.shutdown(ShutdownReason::Shutdown);
            let _ = task.await;
            return Err(e);
        }

        Ok((handle, task))
    }

    async fn run(mut self) -> ShutdownReason {
        info!("supervisor started");
        let reason = loop {
            match self.rx.recv().await {
                Some(Command::Shutdown(reason)) => break reason,
                Some(command) => self.on_command(command),
                None => break ShutdownReason::Shutdown,
            }
        };
        self.stop_all().await;
        info!(?reason, "supervisor stopped");
        reason
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Spawn { spec, reply } => self.spawn(spec, reply),
            Command::Terminate { id, logout, reply } => self.terminate(id, logout, reply),
            Command::MeshLink { account, plugin, reply } => self.mesh_link(account, plugin, reply),
            Command::Announce { account, online } => self.on_announce(account, online),
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown(_) => {}
            Command::Online { id, incarnation } => {
                if let Some(entry) = self.units.get_mut(&id) {
                    if entry.incarnation == incarnation && entry.state == UnitState::Starting {
                        entry.state = UnitState::Online;
                        entry.online_since = Some(Instant::now());
                        info!(unit = %id, incarnation, "unit online");
                    }
                }
            }
            Command::Exited { id, incarnation, code } => self.on_exit(id, incarnation, code),
            Command::Respawn { id, incarnation } => self.respawn(id, incarnation),
            Command::Removed { id, incarnation, reply } => {
                if self.units.get(&id).is_some_and(|e| e.incarnation == incarnation) {
                    self.units.remove(&id);
                    info!(unit = %id, "unit removed");
                }
                let _ = reply.send(Ok(()));
            }
            Command::LinkFailed { account, plugin, link } => {
                if self.links.get(&(account.clone(), plugin.clone())).map(|r| r.id) == Some(link) {
                    self.unlink(&account, &plugin);
                }
            }
        }
    }

    fn spawn(&mut self, spec: UnitSpec, reply: Reply<()>) {
        let id = spec.id();
        if self.units.contains_key(&id) {
            let _ = reply.send(Err(BotError::Spawn(format!("{} already exists", id))));
            return;
        }
        self.units.insert(
            id.clone(),
            UnitEntry {
                spec,
                state: UnitState::Starting,
                generation: 0,
                incarnation: 0,
                restart_count: 0,
                online_since: None,
                running: None,
            },
        );
        self.start_incarnation(&id, Some(reply));
    }

    /// Start a fresh incarnation of an existing entry and link it up
    fn start_incarnation(&mut self, id: &UnitId, reply: Option<Reply<()>>) {
        let Some(entry) = self.units.get_mut(id) else {
            return;
        };
        entry.generation += 1;
        self.next_incarnation += 1;
        entry.incarnation = self.next_incarnation;
        entry.state = UnitState::Starting;
        entry.online_since = None;
        let incarnation = entry.incarnation;

        let (inbox, unit): (UnitInbox, UnitFuture) = match &entry.spec {
            UnitSpec::Bot(account) => {
                let policy = PermissionPolicy {
                    maintainers: self.config.maintainers.iter().cloned().collect(),
                    masters: account.masters.iter().cloned().collect(),
                    high_activity: self.config.permission.high_activity,
                    low_activity: self.config.permission.low_activity,
                };
                let (unit, tx) = BotUnit::new(
                    account.clone(),
                    policy,
                    self.factory.clone(),
                    self.store.clone(),
                    self.handle.clone(),
                );
                (UnitInbox::Bot(tx), Box::pin(unit.run()))
            }
            UnitSpec::Plugin(descriptor) => {
                let (unit, tx) = PluginUnit::new(descriptor.clone());
                (UnitInbox::Plugin(tx), Box::pin(unit.run()))
            }
        };

        let task = tokio::spawn(unit);
        let abort = task.abort_handle();
        let (exited_tx, exited) = watch::channel(false);
        let handle = self.handle.clone();
        let watched = id.clone();
        tokio::spawn(async move {
            let code = match task.await {
                Ok(Ok(())) => EXIT_OK,
                Ok(Err(e)) => {
                    warn!(unit = %watched, error = %e, "unit failed");
                    EXIT_ERROR
                }
                Err(e) if e.is_panic() => {
                    error!(unit = %watched, "unit panicked");
                    EXIT_PANIC
                }
                Err(_) => EXIT_OK,
            };
            let _ = exited_tx.send(true);
            let _ = handle.send(Command::Exited {
                id: watched,
                incarnation,
                code,
            });
        });

        entry.running = Some(Running { inbox, abort, exited });
        debug!(unit = %id, incarnation, "unit spawned");

        // Peers to link with, computed now; later arrivals link to us themselves
        let peers: Vec<(String, String)> = match id {
            UnitId::Bot(account) => self
                .running_plugins()
                .map(|plugin| (account.clone(), plugin))
                .collect(),
            UnitId::Plugin(plugin) => self
                .running_bots()
                .map(|account| (account, plugin.clone()))
                .collect(),
        };

        let handle = self.handle.clone();
        let id = id.clone();
        tokio::spawn(async move {
            for (account, plugin) in peers {
                if let Err(e) = handle.mesh_link(&account, &plugin).await {
                    warn!(account = %account, plugin = %plugin, error = %e, "initial link failed");
                }
            }
            let _ = handle.send(Command::Online { id, incarnation });
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
        });
    }

    fn running_plugins(&self) -> impl Iterator<Item = String> + '_ {
        self.units.iter().filter_map(|(id, e)| match id {
            UnitId::Plugin(name) if e.accepts_links() => Some(name.clone()),
            _ => None,
        })
    }

    fn running_bots(&self) -> impl Iterator<Item = String> + '_ {
        self.units.iter().filter_map(|(id, e)| match id {
            UnitId::Bot(uin) if e.accepts_links() => Some(uin.clone()),
            _ => None,
        })
    }

    fn mesh_link(&mut self, account: String, plugin: String, reply: Reply<()>) {
        let key = (account.clone(), plugin.clone());
        if self.links.contains_key(&key) {
            let _ = reply.send(Ok(()));
            return;
        }

        let bot = self.units.get(&UnitId::Bot(account.clone()));
        let plug = self.units.get(&UnitId::Plugin(plugin.clone()));
        let (bot_tx, plugin_tx, manifest) = match (bot, plug) {
            (Some(b), Some(p)) if b.accepts_links() && p.accepts_links() => {
                match (&b.running, &p.running, &p.spec) {
                    (
                        Some(Running { inbox: UnitInbox::Bot(bt), .. }),
                        Some(Running { inbox: UnitInbox::Plugin(pt), .. }),
                        UnitSpec::Plugin(descriptor),
                    ) => (bt.clone(), pt.clone(), descriptor.manifest()),
                    _ => {
                        let _ = reply.send(Err(BotError::Internal("unit table out of shape".into())));
                        return;
                    }
                }
            }
            _ => {
                let _ = reply.send(Err(BotError::link(format!(
                    "cannot link {} to {}: both units must be running",
                    account, plugin
                ))));
                return;
            }
        };

        self.next_link += 1;
        let id = self.next_link;
        let (for_bot, for_plugin, alive) = link::connect(
            id,
            &account,
            &plugin,
            bot_tx.clone(),
            plugin_tx.clone(),
            self.config.runtime.remote_timeout(),
        );
        self.links.insert(key, LinkRecord { id, alive });

        let (bot_ack, bot_acked) = oneshot::channel();
        let (plugin_ack, plugin_acked) = oneshot::channel();
        let sent = bot_tx
            .send(BotInbox::Attach {
                endpoint: for_bot,
                manifest,
                ack: bot_ack,
            })
            .is_ok()
            && plugin_tx
                .send(PluginInbox::Attach {
                    endpoint: for_plugin,
                    ack: plugin_ack,
                })
                .is_ok();
        if !sent {
            self.unlink(&account, &plugin);
            let _ = reply.send(Err(BotError::link(format!("{} or {} went away", account, plugin))));
            return;
        }

        let timeout = self.config.runtime.handshake_timeout();
        let handle = self.handle.clone();
        tokio::spawn(async move {
            let acked = tokio::time::timeout(timeout, async {
                bot_acked.await.is_ok() && plugin_acked.await.is_ok()
            })
            .await;
            if matches!(acked, Ok(true)) {
                debug!(account = %account, plugin = %plugin, link = id, "link established");
                let _ = reply.send(Ok(()));
            } else {
                error!(account = %account, plugin = %plugin, link = id, "link handshake failed");
                let _ = handle.send(Command::LinkFailed {
                    account: account.clone(),
                    plugin: plugin.clone(),
                    link: id,
                });
                let _ = reply.send(Err(BotError::link(format!(
                    "handshake between {} and {} failed",
                    account, plugin
                ))));
            }
        });
    }

    /// Mark one link dead and tell both ends
    fn unlink(&mut self, account: &str, plugin: &str) {
        let Some(record) = self.links.remove(&(account.to_string(), plugin.to_string())) else {
            return;
        };
        record.alive.store(false, Ordering::Release);

        if let Some(Running { inbox: UnitInbox::Bot(tx), .. }) =
            self.units.get(&UnitId::Bot(account.to_string())).and_then(|e| e.running.as_ref())
        {
            let _ = tx.send(BotInbox::Detach {
                plugin: plugin.to_string(),
                link: record.id,
            });
        }
        if let Some(Running { inbox: UnitInbox::Plugin(tx), .. }) =
            self.units.get(&UnitId::Plugin(plugin.to_string())).and_then(|e| e.running.as_ref())
        {
            let _ = tx.send(PluginInbox::Detach {
                account: account.to_string(),
                link: record.id,
            });
        }
        debug!(account = %account, plugin = %plugin, link = record.id, "link torn down");
    }

    fn unlink_all(&mut self, id: &UnitId) {
        let keys: Vec<(String, String)> = self
            .links
            .keys()
            .filter(|(account, plugin)| match id {
                UnitId::Bot(uin) => account == uin,
                UnitId::Plugin(name) => plugin == name,
            })
            .cloned()
            .collect();
        for (account, plugin) in keys {
            self.unlink(&account, &plugin);
        }
    }

    fn terminate(&mut self, id: UnitId, logout: bool, reply: Reply<()>) {
        let Some(entry) = self.units.get_mut(&id) else {
            let _ = reply.send(Err(BotError::lifecycle(format!("{} is not running", id))));
            return;
        };
        if entry.state == UnitState::Terminating {
            let _ = reply.send(Err(BotError::lifecycle(format!("{} is already terminating", id))));
            return;
        }
        entry.state = UnitState::Terminating;
        let incarnation = entry.incarnation;
        let running = entry.running.take();
        info!(unit = %id, "terminating unit");

        self.unlink_all(&id);

        let Some(running) = running else {
            // Waiting out a restart delay; nothing to stop
            self.units.remove(&id);
            let _ = reply.send(Ok(()));
            return;
        };
        running.inbox.terminate(logout);

        let timeout = self.config.runtime.shutdown_timeout();
        let handle = self.handle.clone();
        tokio::spawn(async move {
            wait_exit(running, timeout, &id).await;
            let _ = handle.send(Command::Removed { id, incarnation, reply });
        });
    }

    fn on_exit(&mut self, id: UnitId, incarnation: u64, code: i32) {
        let Some(entry) = self.units.get_mut(&id) else {
            return;
        };
        if entry.incarnation != incarnation || entry.state == UnitState::Terminating {
            return;
        }
        entry.running = None;
        let stable = entry
            .online_since
            .is_some_and(|since| since.elapsed() >= self.config.runtime.stable_after());
        self.unlink_all(&id);

        let Some(entry) = self.units.get_mut(&id) else {
            return;
        };
        if code == EXIT_OK {
            info!(unit = %id, "unit exited");
            entry.state = UnitState::Exited;
            self.units.remove(&id);
            return;
        }

        if stable {
            entry.restart_count = 0;
        }
        entry.restart_count += 1;
        if entry.restart_count > self.config.runtime.max_restarts {
            error!(unit = %id, code, restarts = entry.restart_count - 1, "unit keeps failing, giving up");
            entry.state = UnitState::Exited;
            self.units.remove(&id);
            return;
        }

        entry.state = UnitState::Restarting;
        let delay = self.config.runtime.backoff(entry.restart_count);
        warn!(unit = %id, code, attempt = entry.restart_count, ?delay, "unit crashed, restarting");

        let handle = self.handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = handle.send(Command::Respawn { id, incarnation });
        });
    }

    fn respawn(&mut self, id: UnitId, incarnation: u64) {
        let ready = self
            .units
            .get(&id)
            .is_some_and(|e| e.incarnation == incarnation && e.state == UnitState::Restarting);
        if ready {
            info!(unit = %id, "respawning unit");
            self.start_incarnation(&id, None);
        }
    }

    fn on_announce(&mut self, account: String, online: bool) {
        let id = UnitId::Bot(account.clone());
        let Some(entry) = self.units.get_mut(&id) else {
            return;
        };
        if !entry.accepts_links() {
            return;
        }
        if !online {
            entry.state = UnitState::Degraded;
            return;
        }
        if entry.state == UnitState::Degraded {
            entry.state = UnitState::Online;
        }

        // Rebuild whatever went missing while the account was away
        let plugins: Vec<String> = self.running_plugins().collect();
        let handle = self.handle.clone();
        tokio::spawn(async move {
            for plugin in plugins {
                if let Err(e) = handle.mesh_link(&account, &plugin).await {
                    warn!(account = %account, plugin = %plugin, error = %e, "relink failed");
                }
            }
        });
    }

    fn status(&self) -> Vec<UnitStatus> {
        self.units
            .iter()
            .map(|(id, e)| UnitStatus {
                id: id.clone(),
                state: e.state,
                generation: e.generation,
                restart_count: e.restart_count,
                links: self
                    .links
                    .keys()
                    .filter(|(account, plugin)| match id {
                        UnitId::Bot(uin) => account == uin,
                        UnitId::Plugin(name) => plugin == name,
                    })
                    .count(),
            })
            .collect()
    }

    /// Bots first so no new messages reach plugins that are going away
    async fn stop_all(&mut self) {
        let timeout = self.config.runtime.shutdown_timeout();
        for bots in [true, false] {
            let ids: Vec<UnitId> = self
                .units
                .keys()
                .filter(|id| matches!(id, UnitId::Bot(_)) == bots)
                .cloned()
                .collect();

            let mut waits = Vec::new();
            for id in ids {
                self.unlink_all(&id);
                if let Some(mut entry) = self.units.remove(&id) {
                    if let Some(running) = entry.running.take() {
                        running.inbox.terminate(false);
                        waits.push(tokio::spawn(async move { wait_exit(running, timeout, &id).await }));
                    }
                }
            }
            for wait in waits {
                let _ = wait.await;
            }
        }
    }
}

/// Core plugins, then configured plugins, then auto-login accounts
async fn boot(handle: &SupervisorHandle, config: &Config, catalog: &PluginCatalog) -> Result<(), BotError> {
    for plugin in catalog.core_plugins() {
        handle.mount(plugin.name()).await?;
    }
    for name in &config.plugins.mounted {
        if catalog.get(name).is_some_and(|p| p.is_core()) {
            continue;
        }
        handle.mount(name).await.map_err(|e| match e {
            BotError::Validation(msg) => BotError::Config(msg),
            other => other,
        })?;
    }
    for account in config.accounts.iter().filter(|a| a.auto_login) {
        if let Err(e) = handle.login(&account.uin).await {
            error!(account = %account.uin, error = %e, "failed to start bot");
        }
    }
    Ok(())
}

/// Wait for a terminated unit to finish, aborting it after `timeout`
async fn wait_exit(running: Running, timeout: std::time::Duration, id: &UnitId) {
    let mut exited = running.exited;
    let finished = tokio::time::timeout(timeout, exited.wait_for(|done| *done))
        .await
        .map(|seen| seen.is_ok());
    if !matches!(finished, Ok(true)) {
        warn!(unit = %id, ?timeout, "unit did not stop in time, aborting");
        running.abort.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::storage::MemoryStore;

    struct NoConnector;

    impl ConnectorFactory for NoConnector {
        fn connect(&self, account: &AccountConfig) -> Result<crate::domain::traits::ConnectorSession, BotError> {
            Err(BotError::fatal_connector(format!("{} cannot connect", account.uin)))
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.accounts.clear();
        config
    }

    async fn start(config: Config) -> Result<(SupervisorHandle, JoinHandle<ShutdownReason>), BotError> {
        let config = Arc::new(config);
        let catalog = Arc::new(PluginCatalog::builtin(&config)?);
        Supervisor::start(config, catalog, Arc::new(NoConnector), Arc::new(MemoryStore::new())).await
    }

    #[test]
    fn test_unit_id_display() {
        assert_eq!(UnitId::Bot("10001".into()).to_string(), "bot:10001");
        assert_eq!(UnitId::Plugin("dice".into()).to_string(), "plugin:dice");
    }

    #[tokio::test]
    async fn test_boot_mounts_core_and_configured_plugins() {
        let (handle, task) = start(config()).await.unwrap();

        let status = handle.status().await.unwrap();
        let ids: Vec<_> = status.iter().map(|s| s.id.to_string()).collect();
        assert_eq!(ids, vec!["plugin:core", "plugin:dice"]);
        assert!(status.iter().all(|s| s.links == 0 && s.generation == 1));

        handle.shutdown(ShutdownReason::Restart).unwrap();
        assert_eq!(task.await.unwrap(), ShutdownReason::Restart);
    }

    #[tokio::test]
    async fn test_unknown_configured_plugin_aborts_boot() {
        let mut config = config();
        config.plugins.mounted.push("nope".into());
        assert!(matches!(start(config).await, Err(BotError::Config(_))));
    }

    #[tokio::test]
    async fn test_mesh_link_needs_both_units() {
        let (handle, _task) = start(config()).await.unwrap();

        let err = handle.mesh_link("10001", "dice").await.unwrap_err();
        assert!(matches!(err, BotError::Link(_)));

        let err = handle.mount("dice").await.unwrap_err();
        assert!(matches!(err, BotError::Lifecycle(_)));
        let err = handle.reload("core").await.unwrap_err();
        assert!(matches!(err, BotError::Lifecycle(_)));
    }
}
