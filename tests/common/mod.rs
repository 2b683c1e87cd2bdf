//! Shared harness: a scripted connector and a running supervisor

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use meshbot::application::errors::BotError;
use meshbot::domain::entities::{CommandSpec, ConnectorEvent, GroupRole, Message, User};
use meshbot::domain::traits::{
    Connector, ConnectorFactory, ConnectorSession, ConnectorStat, FriendInfo, GroupInfo,
};
use meshbot::infrastructure::config::{AccountConfig, Config};
use meshbot::infrastructure::storage::MemoryStore;
use meshbot::plugins::{PluginCatalog, PluginDescriptor};
use meshbot::runtime::protocol::BotCall;
use meshbot::runtime::{Invocation, ShutdownReason, Supervisor, SupervisorHandle, UnitId, UnitState, UnitStatus};

static INIT: Once = Once::new();

pub fn ensure_init() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub const BOT: &str = "10001";
pub const MASTER: &str = "20001";
pub const GROUP: &str = "300";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Private(String),
    Group(String),
}

#[derive(Debug, Clone)]
pub struct Sent {
    pub account: String,
    pub target: Target,
    pub text: String,
}

type Outbox = Arc<Mutex<Vec<Sent>>>;

pub struct MockConnector {
    uin: String,
    events: mpsc::UnboundedSender<ConnectorEvent>,
    outbox: Outbox,
    groups: Vec<GroupInfo>,
    online: AtomicBool,
    logouts: Arc<AtomicUsize>,
}

impl MockConnector {
    fn push(&self, target: Target, text: &str) -> String {
        self.outbox.lock().unwrap().push(Sent {
            account: self.uin.clone(),
            target,
            text: text.to_string(),
        });
        uuid::Uuid::new_v4().to_string()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn login(&self) -> Result<(), BotError> {
        self.online.store(true, Ordering::SeqCst);
        let _ = self.events.send(ConnectorEvent::Online);
        Ok(())
    }

    async fn logout(&self) -> Result<(), BotError> {
        self.online.store(false, Ordering::SeqCst);
        self.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn terminate(&self) {
        self.online.store(false, Ordering::SeqCst);
    }

    async fn send_private_message(&self, user_id: &str, text: &str) -> Result<String, BotError> {
        Ok(self.push(Target::Private(user_id.to_string()), text))
    }

    async fn send_group_message(&self, group_id: &str, text: &str) -> Result<String, BotError> {
        Ok(self.push(Target::Group(group_id.to_string()), text))
    }

    fn nickname(&self) -> String {
        format!("mock-{}", self.uin)
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    async fn group_list(&self) -> Result<Vec<GroupInfo>, BotError> {
        Ok(self.groups.clone())
    }

    async fn friend_list(&self) -> Result<Vec<FriendInfo>, BotError> {
        Ok(Vec::new())
    }

    fn stat(&self) -> ConnectorStat {
        ConnectorStat::default()
    }
}

/// Hands out mock connectors and keeps the event sender of the latest one
#[derive(Default)]
pub struct MockFactory {
    pub connects: AtomicUsize,
    /// Sign-offs across every connector this factory handed out
    pub logouts: Arc<AtomicUsize>,
    sessions: Mutex<HashMap<String, mpsc::UnboundedSender<ConnectorEvent>>>,
    pub outbox: Outbox,
}

impl ConnectorFactory for MockFactory {
    fn connect(&self, account: &AccountConfig) -> Result<ConnectorSession, BotError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.lock().unwrap().insert(account.uin.clone(), tx.clone());
        let connector = MockConnector {
            uin: account.uin.clone(),
            events: tx,
            outbox: self.outbox.clone(),
            groups: vec![GroupInfo::new(GROUP, "test group")],
            online: AtomicBool::new(false),
            logouts: self.logouts.clone(),
        };
        Ok(ConnectorSession {
            connector: Arc::new(connector),
            events: rx,
        })
    }
}

impl MockFactory {
    pub fn emit(&self, uin: &str, event: ConnectorEvent) {
        let sessions = self.sessions.lock().unwrap();
        sessions[uin].send(event).unwrap();
    }

    pub fn clear(&self) {
        self.outbox.lock().unwrap().clear();
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.outbox.lock().unwrap().clone()
    }
}

pub async fn wait_until<F: FnMut() -> bool>(mut condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Test plugin with a plain and a variadic command
pub fn greeter() -> PluginDescriptor {
    PluginDescriptor::builder("greeter")
        .description("Greets people")
        .command(
            CommandSpec::new("greet <name>").with_handler(|inv: Invocation| async move {
                Ok(Some(format!("Hello, {}!", inv.args.require("name")?)))
            }),
        )
        .command(
            CommandSpec::new("tag <...labels>").with_handler(|inv: Invocation| async move {
                Ok(Some(inv.args.list("labels").join("|")))
            }),
        )
        .build()
        .unwrap()
}

/// Flips dice's apply flag on behalf of whatever message id it is handed
pub fn rogue() -> PluginDescriptor {
    PluginDescriptor::builder("rogue")
        .command(
            CommandSpec::new("hijack <message>").with_handler(|inv: Invocation| async move {
                let message_id = inv.args.require("message")?.to_string();
                let group_id = inv.group_id().unwrap_or(GROUP).to_string();
                inv.call(BotCall::SetApply {
                    group_id,
                    plugin: "dice".into(),
                    apply: false,
                    message_id,
                })
                .await?;
                Ok(Some("hijacked".to_string()))
            }),
        )
        .build()
        .unwrap()
}

pub fn config() -> Config {
    let mut account = AccountConfig::new(BOT).with_masters(vec![MASTER.to_string()]);
    account.connector.platform = "mock".to_string();

    let mut config = Config::default();
    config.accounts = vec![account];
    config.plugins.mounted = vec!["dice".to_string(), "greeter".to_string()];
    config.runtime.restart_delay_ms = 20;
    config.runtime.max_restart_delay_ms = 100;
    config.runtime.remote_timeout_ms = 2_000;
    config
}

pub struct Mesh {
    pub handle: SupervisorHandle,
    pub task: JoinHandle<ShutdownReason>,
    pub factory: Arc<MockFactory>,
    pub store: Arc<MemoryStore>,
}

impl Mesh {
    pub async fn start() -> Self {
        Self::start_with(config()).await
    }

    pub async fn start_with(config: Config) -> Self {
        ensure_init();
        let mut catalog = PluginCatalog::builtin(&config).unwrap();
        catalog.register(greeter()).unwrap();
        catalog.register(rogue()).unwrap();

        let factory = Arc::new(MockFactory::default());
        let store = Arc::new(MemoryStore::new());
        let (handle, task) = Supervisor::start(
            Arc::new(config),
            Arc::new(catalog),
            factory.clone(),
            store.clone(),
        )
        .await
        .unwrap();
        Mesh { handle, task, factory, store }
    }

    /// Send a private message from `user` and wait for the first reply
    pub async fn ask(&self, user: User, text: &str) -> Option<String> {
        self.factory.clear();
        self.factory
            .emit(BOT, ConnectorEvent::Message(Message::private(BOT, user, text)));
        self.first_reply().await
    }

    /// Send a group message and wait for the first reply
    pub async fn ask_group(&self, user: User, text: &str) -> Option<String> {
        self.factory.clear();
        self.factory
            .emit(BOT, ConnectorEvent::Message(Message::group(BOT, GROUP, user, text)));
        self.first_reply().await
    }

    async fn first_reply(&self) -> Option<String> {
        let factory = self.factory.clone();
        if wait_until(|| !factory.sent().is_empty()).await {
            self.factory.sent().first().map(|s| s.text.clone())
        } else {
            None
        }
    }

    /// Wait until the first refresh wrote the test group's settings
    pub async fn settings_ready(&self) {
        let key = meshbot::infrastructure::storage::settings_key(BOT);
        for _ in 0..200 {
            if let Some(doc) = self.store.get(&key).await {
                if doc[GROUP]["plugin"]["dice"].is_object() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("settings never refreshed");
    }

    pub async fn unit(&self, id: &UnitId) -> Option<UnitStatus> {
        self.handle
            .status()
            .await
            .unwrap()
            .into_iter()
            .find(|s| &s.id == id)
    }

    pub async fn wait_state(&self, id: &UnitId, state: UnitState) -> bool {
        for _ in 0..200 {
            if self.unit(id).await.is_some_and(|s| s.state == state) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Settings document of the test account as last written
    pub async fn settings(&self) -> serde_json::Value {
        let key = meshbot::infrastructure::storage::settings_key(BOT);
        self.store.get(&key).await.unwrap_or_default()
    }

    pub async fn stop(self) {
        self.handle.shutdown(ShutdownReason::Shutdown).unwrap();
        let reason = self.task.await.unwrap();
        assert_eq!(reason, ShutdownReason::Shutdown);
    }
}

pub fn master() -> User {
    User::new(MASTER)
}

pub fn member(id: &str) -> User {
    User::new(id)
}

pub fn owner(id: &str) -> User {
    User::new(id).with_role(GroupRole::Owner)
}
