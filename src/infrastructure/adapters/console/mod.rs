//! Console connector for local development
//!
//! Lines typed on stdin arrive as private messages from the account's first
//! master. A line of the form `[group-id] text` arrives as a group message
//! from the group owner instead. Outgoing messages are printed.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::application::errors::BotError;
use crate::domain::entities::{ConnectorEvent, GroupRole, Message, User};
use crate::domain::traits::{
    Connector, ConnectorFactory, ConnectorSession, ConnectorStat, FriendInfo, GroupInfo,
};
use crate::infrastructure::config::AccountConfig;

pub const PLATFORM: &str = "console";

pub struct ConsoleConnector {
    uin: String,
    /// Who typed lines are attributed to
    speaker: String,
    groups: Vec<GroupInfo>,
    interactive: bool,
    events: mpsc::UnboundedSender<ConnectorEvent>,
    online: AtomicBool,
    stat: Mutex<ConnectorStat>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ConsoleConnector {
    pub fn new(account: &AccountConfig) -> (Self, mpsc::UnboundedReceiver<ConnectorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let extra = &account.connector.extra;

        let interactive = extra
            .get("interactive")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        let groups = extra
            .get("groups")
            .and_then(|v| v.as_sequence())
            .map(|seq| {
                seq.iter()
                    .filter_map(|g| match g {
                        serde_yaml::Value::String(s) => Some(s.clone()),
                        serde_yaml::Value::Number(n) => Some(n.to_string()),
                        _ => None,
                    })
                    .map(|id| GroupInfo::new(id.clone(), format!("console-{}", id)))
                    .collect()
            })
            .unwrap_or_default();

        let connector = Self {
            uin: account.uin.clone(),
            speaker: account.masters.first().cloned().unwrap_or_else(|| "console".to_string()),
            groups,
            interactive,
            events: tx,
            online: AtomicBool::new(false),
            stat: Mutex::new(ConnectorStat::default()),
            reader: Mutex::new(None),
        };
        (connector, rx)
    }

    /// Turn one typed line into a message event
    pub fn parse_line(uin: &str, speaker: &str, line: &str) -> Option<Message> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        if let Some(rest) = line.strip_prefix('[') {
            if let Some((group_id, text)) = rest.split_once(']') {
                let sender = User::new(speaker).with_nickname("console").with_role(GroupRole::Owner);
                return Some(Message::group(uin, group_id.trim(), sender, text.trim()));
            }
        }
        Some(Message::private(uin, User::new(speaker).with_nickname("console"), line))
    }

    fn start_reader(&self) {
        let mut reader = self.reader.lock().unwrap_or_else(|p| p.into_inner());
        if reader.is_some() {
            return;
        }

        let (uin, speaker, events) = (self.uin.clone(), self.speaker.clone(), self.events.clone());
        *reader = Some(tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(message) = Self::parse_line(&uin, &speaker, &line) {
                    if events.send(ConnectorEvent::Message(message)).is_err() {
                        break;
                    }
                }
            }
            debug!(account = %uin, "console input closed");
        }));
    }

    fn stop_reader(&self) {
        if let Some(reader) = self.reader.lock().unwrap_or_else(|p| p.into_inner()).take() {
            reader.abort();
        }
    }

    fn record_sent(&self) {
        self.stat.lock().unwrap_or_else(|p| p.into_inner()).sent += 1;
    }
}

#[async_trait]
impl Connector for ConsoleConnector {
    async fn login(&self) -> Result<(), BotError> {
        info!(account = %self.uin, "console login");
        self.online.store(true, Ordering::Release);
        self.stat.lock().unwrap_or_else(|p| p.into_inner()).online_since = Some(Utc::now());
        if self.interactive {
            self.start_reader();
        }
        self.events
            .send(ConnectorEvent::Online)
            .map_err(|_| BotError::connector("event stream closed"))
    }

    async fn logout(&self) -> Result<(), BotError> {
        self.online.store(false, Ordering::Release);
        self.stop_reader();
        let _ = self.events.send(ConnectorEvent::Offline {
            reason: "logged out".to_string(),
        });
        Ok(())
    }

    async fn terminate(&self) {
        self.online.store(false, Ordering::Release);
        self.stop_reader();
    }

    async fn send_private_message(&self, user_id: &str, text: &str) -> Result<String, BotError> {
        println!("[{} -> {}] {}", self.uin, user_id, text);
        self.record_sent();
        Ok(uuid::Uuid::new_v4().to_string())
    }

    async fn send_group_message(&self, group_id: &str, text: &str) -> Result<String, BotError> {
        println!("[{} -> group {}] {}", self.uin, group_id, text);
        self.record_sent();
        Ok(uuid::Uuid::new_v4().to_string())
    }

    fn nickname(&self) -> String {
        format!("console-{}", self.uin)
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    async fn group_list(&self) -> Result<Vec<GroupInfo>, BotError> {
        Ok(self.groups.clone())
    }

    async fn friend_list(&self) -> Result<Vec<FriendInfo>, BotError> {
        Ok(vec![FriendInfo {
            user_id: self.speaker.clone(),
            nickname: "console".to_string(),
        }])
    }

    fn stat(&self) -> ConnectorStat {
        self.stat.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

/// Opens console connectors; rejects accounts configured for other platforms
#[derive(Debug, Default)]
pub struct ConsoleConnectorFactory;

impl ConnectorFactory for ConsoleConnectorFactory {
    fn connect(&self, account: &AccountConfig) -> Result<ConnectorSession, BotError> {
        if account.connector.platform != PLATFORM {
            return Err(BotError::Config(format!(
                "account {} uses unsupported platform '{}'",
                account.uin, account.connector.platform
            )));
        }
        let (connector, events) = ConsoleConnector::new(account);
        Ok(ConnectorSession {
            connector: Arc::new(connector),
            events,
        })
    }
}
