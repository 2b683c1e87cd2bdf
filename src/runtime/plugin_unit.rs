//! Plugin unit - hosts one plugin's commands, jobs and event subscriptions

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

use crate::application::errors::BotError;
use crate::application::messaging::MessageDispatcher;
use crate::plugins::PluginDescriptor;

use super::invocation::{EventContext, JobContext};
use super::link::{BotLink, LinkId};
use super::protocol::{PluginCall, PluginEvent, PluginInbox, RemoteResult, ToPlugin};

pub struct PluginUnit {
    descriptor: Arc<PluginDescriptor>,
    dispatcher: Arc<MessageDispatcher>,
    inbox: mpsc::UnboundedReceiver<PluginInbox>,
    /// Used by job timers to post ticks into this unit's own mailbox
    self_tx: mpsc::UnboundedSender<PluginInbox>,
    links: HashMap<String, BotLink>,
    tasks: JoinSet<()>,
    timers: Vec<JoinHandle<()>>,
}

impl PluginUnit {
    pub fn new(descriptor: Arc<PluginDescriptor>) -> (Self, mpsc::UnboundedSender<PluginInbox>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = MessageDispatcher::new(
            descriptor.name(),
            descriptor.prefix(),
            descriptor.is_core(),
            descriptor.commands(),
        );
        let unit = Self {
            descriptor,
            dispatcher: Arc::new(dispatcher),
            inbox: rx,
            self_tx: tx.clone(),
            links: HashMap::new(),
            tasks: JoinSet::new(),
            timers: Vec::new(),
        };
        (unit, tx)
    }

    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    pub async fn run(mut self) -> Result<(), BotError> {
        self.start_timers();
        info!(plugin = %self.name(), commands = self.dispatcher.commands().len(), "plugin unit started");

        loop {
            tokio::select! {
                msg = self.inbox.recv() => match msg {
                    Some(PluginInbox::Terminate) | None => break,
                    Some(msg) => self.handle(msg),
                },
                Some(done) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = done {
                        if e.is_panic() {
                            warn!(plugin = %self.name(), "plugin task panicked");
                        }
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    fn handle(&mut self, msg: PluginInbox) {
        match msg {
            PluginInbox::Attach { endpoint, ack } => {
                let account = endpoint.account().to_string();
                debug!(plugin = %self.name(), account = %account, link = endpoint.id(), "link attached");
                if let Some(old) = self.links.insert(account, endpoint) {
                    old.close("link replaced");
                }
                let _ = ack.send(());
            }
            PluginInbox::Detach { account, link } => self.detach(&account, link),
            PluginInbox::Frame { link, from, frame } => self.on_frame(link, &from, frame),
            PluginInbox::Tick { job } => self.run_job(job),
            PluginInbox::Terminate => {}
        }
    }

    fn detach(&mut self, account: &str, link: LinkId) {
        match self.links.get(account) {
            Some(current) if current.id() == link => {
                if let Some(old) = self.links.remove(account) {
                    let failed = old.close("link torn down");
                    debug!(plugin = %self.name(), account = %account, link, failed, "link detached");
                }
            }
            _ => debug!(plugin = %self.name(), account = %account, link, "stale detach ignored"),
        }
    }

    fn on_frame(&mut self, link: LinkId, from: &str, frame: ToPlugin) {
        let bot = match self.links.get(from) {
            Some(bot) if bot.id() == link => bot.clone(),
            _ => {
                error!(plugin = %self.name(), account = %from, link, "frame from unlinked bot dropped");
                return;
            }
        };

        match frame {
            ToPlugin::Event(PluginEvent::Message(message)) => {
                if let Some(routed) = self.dispatcher.route(&message) {
                    let plugin = self.name().to_string();
                    self.tasks
                        .spawn(MessageDispatcher::execute(plugin, routed, message, bot));
                }
            }
            ToPlugin::Event(event) => self.on_event(event, bot),
            ToPlugin::Request { id, call } => {
                let result = self.answer(call);
                if let Err(e) = bot.respond(id, result) {
                    error!(plugin = %self.name(), account = %from, error = %e, "failed to answer request");
                }
            }
            ToPlugin::Response { id, result } => {
                if !bot.resolve(id, result) {
                    debug!(plugin = %self.name(), account = %from, call = id, "late reply dropped");
                }
            }
        }
    }

    fn answer(&self, call: PluginCall) -> RemoteResult {
        match call {
            PluginCall::Describe => serde_json::to_value(self.descriptor.summary())
                .map_err(|e| BotError::Internal(e.to_string())),
        }
    }

    fn on_event(&mut self, event: PluginEvent, bot: BotLink) {
        let Some(kind) = event.kind() else {
            return;
        };
        for handler in self.descriptor.handlers(kind) {
            let ctx = EventContext {
                plugin: self.name().to_string(),
                event: event.clone(),
                bot: bot.clone(),
            };
            let handler = handler.clone();
            self.tasks.spawn(async move {
                let plugin = ctx.plugin.clone();
                if let Err(e) = handler(ctx).await {
                    warn!(plugin = %plugin, ?kind, error = %e, "event handler failed");
                }
            });
        }
    }

    fn run_job(&mut self, index: usize) {
        let Some(job) = self.descriptor.jobs().get(index) else {
            return;
        };
        let ctx = JobContext {
            plugin: self.name().to_string(),
            job: job.name.clone(),
            bots: self.links.values().cloned().collect(),
        };
        let handler = job.handler.clone();
        self.tasks.spawn(async move {
            let (plugin, job) = (ctx.plugin.clone(), ctx.job.clone());
            if let Err(e) = handler(ctx).await {
                warn!(plugin = %plugin, job = %job, error = %e, "job failed");
            }
        });
    }

    fn start_timers(&mut self) {
        for (index, job) in self.descriptor.jobs().iter().enumerate() {
            let tx = self.self_tx.clone();
            let period = job.interval;
            self.timers.push(tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                loop {
                    ticker.tick().await;
                    if tx.send(PluginInbox::Tick { job: index }).is_err() {
                        break;
                    }
                }
            }));
        }
    }

    async fn shutdown(&mut self) {
        for timer in self.timers.drain(..) {
            timer.abort();
        }
        for (_, link) in self.links.drain() {
            link.close("plugin unit terminating");
        }
        self.tasks.shutdown().await;
        info!(plugin = %self.name(), "plugin unit stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{CommandSpec, Message, User};
    use crate::runtime::link::connect;
    use crate::runtime::protocol::{BotCall, BotInbox, PluginSummary, ToBot};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn echo() -> Arc<PluginDescriptor> {
        Arc::new(
            PluginDescriptor::builder("echo")
                .command(CommandSpec::new("say <...words>").with_handler(|inv| async move {
                    Ok(Some(inv.args.list("words").join(" ")))
                }))
                .build()
                .unwrap(),
        )
    }

    /// Polls every linked bot for its group list
    fn poller() -> Arc<PluginDescriptor> {
        Arc::new(
            PluginDescriptor::builder("poller")
                .job("groups", Duration::from_millis(10), |ctx: JobContext| async move {
                    for bot in &ctx.bots {
                        bot.request(BotCall::GroupList).await?;
                    }
                    Ok(())
                })
                .build()
                .unwrap(),
        )
    }

    async fn attached() -> (
        mpsc::UnboundedSender<PluginInbox>,
        mpsc::UnboundedReceiver<BotInbox>,
        crate::runtime::PluginLink,
        JoinHandle<Result<(), BotError>>,
    ) {
        attach(echo()).await
    }

    async fn attach(
        descriptor: Arc<PluginDescriptor>,
    ) -> (
        mpsc::UnboundedSender<PluginInbox>,
        mpsc::UnboundedReceiver<BotInbox>,
        crate::runtime::PluginLink,
        JoinHandle<Result<(), BotError>>,
    ) {
        let name = descriptor.name().to_string();
        let (unit, tx) = PluginUnit::new(descriptor);
        let task = tokio::spawn(unit.run());
        let (bot_tx, bot_rx) = mpsc::unbounded_channel();
        let (for_bot, for_plugin, _) = connect(1, "10001", &name, bot_tx, tx.clone(), Duration::from_secs(2));
        let (ack, acked) = oneshot::channel();
        tx.send(PluginInbox::Attach { endpoint: for_plugin, ack }).unwrap();
        acked.await.unwrap();
        (tx, bot_rx, for_bot, task)
    }

    #[tokio::test]
    async fn test_message_reply_goes_back_over_link() {
        let (tx, mut bot_rx, for_bot, task) = attached().await;

        let msg = Message::private("10001", User::new("7"), "/say hello there");
        for_bot.send_event(PluginEvent::Message(Arc::new(msg))).unwrap();

        let Some(BotInbox::Frame { frame: ToBot::Request { id, call }, .. }) = bot_rx.recv().await else {
            panic!("expected a send request");
        };
        assert_eq!(
            call,
            BotCall::SendPrivateMessage { user_id: "7".into(), text: "hello there".into() }
        );
        for_bot.respond(id, Ok(json!("m1"))).unwrap();

        tx.send(PluginInbox::Terminate).unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_describe_request_answered() {
        let (_tx, mut bot_rx, for_bot, _task) = attached().await;

        let caller = for_bot.clone();
        let pending = tokio::spawn(async move { caller.request(PluginCall::Describe).await });

        // The bot loop normally routes replies; do it by hand here
        let Some(BotInbox::Frame { frame: ToBot::Response { id, result }, .. }) = bot_rx.recv().await else {
            panic!("expected a describe response");
        };
        assert!(for_bot.resolve(id, result));

        let summary: PluginSummary = serde_json::from_value(pending.await.unwrap().unwrap()).unwrap();
        assert_eq!(summary.name, "echo");
        assert_eq!(summary.commands[0].signature, "say <...words>");
    }

    #[tokio::test]
    async fn test_job_calls_linked_bots_on_each_tick() {
        let (tx, mut bot_rx, for_bot, task) = attach(poller()).await;

        for _ in 0..2 {
            let frame = tokio::time::timeout(Duration::from_secs(1), bot_rx.recv()).await.unwrap();
            let Some(BotInbox::Frame { from, frame: ToBot::Request { id, call }, .. }) = frame else {
                panic!("expected a group list request");
            };
            assert_eq!(from, "poller");
            assert_eq!(call, BotCall::GroupList);
            for_bot.respond(id, Ok(json!([]))).unwrap();
        }

        tx.send(PluginInbox::Terminate).unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_frames_from_stale_links_are_dropped() {
        let (tx, mut bot_rx, _for_bot, _task) = attached().await;

        let (stale_tx, _stale_rx) = mpsc::unbounded_channel();
        let (stale, _, _) = connect(99, "10001", "echo", stale_tx, tx.clone(), Duration::from_secs(1));
        let msg = Message::private("10001", User::new("7"), "/say hi");
        stale.send_event(PluginEvent::Message(Arc::new(msg))).unwrap();

        let nothing = tokio::time::timeout(Duration::from_millis(100), bot_rx.recv()).await;
        assert!(nothing.is_err());
    }
}
