use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};
use clap::Parser;
use gms::{FnHandler, MembershipConfigBuilder, MembershipManager, Message, SecurityConfig, ViewEvent};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::time;
use tracing::{error, info, warn};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::EnvFilter;

const NODE_NAME: &str = "NODE_1";
const MEMBERSHIP_PORT: u16 = 7948;
const PING_KIND: u16 = 1;
const TICK_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Ping {
    from: String,
    counter: u64,
}

struct Node {
    manager: MembershipManager,
    receiver: mpsc::UnboundedReceiver<Message>,
    events: broadcast::Receiver<ViewEvent>,
}

impl Node {
    async fn new(args: &Args) -> Result<Self> {
        let mut builder = MembershipConfigBuilder::new()
            .with_name(&args.name)
            .with_bind_addr(args.ip)
            .with_membership_port(args.port)
            .with_direct_channel_port(args.direct_port)
            .with_heartbeat_interval(Duration::from_millis(args.heartbeat_ms))
            .with_locators(args.locators.iter().copied());
        if let Some(secret) = &args.secret {
            builder = builder.with_encryption(SecurityConfig::new(secret.as_bytes()));
        }
        let config = builder.build().context("invalid membership configuration")?;

        let manager = MembershipManager::join(config)
            .await
            .context("failed to join the group")?;
        let events = manager.subscribe();

        let (sender, receiver) = mpsc::unbounded_channel();
        manager.add_message_handler(PING_KIND, Arc::new(FnHandler::new(move |message: Message| {
            let sender = sender.clone();
            async move {
                sender.send(message)?;
                Ok(())
            }
        })))?;

        Ok(Self { manager, receiver, events })
    }

    async fn run(&mut self) -> Result<()> {
        let local = self.manager.local_member();
        info!("Local member: {}", local);
        if let Some(view) = self.manager.current_view() {
            info!("Initial view: {:?}", view);
        }

        let mut ticker = time::interval(TICK_INTERVAL);
        let mut counter: u64 = 0;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    counter += 1;
                    self.ping_all(counter).await;
                }
                Some(message) = self.receiver.recv() => self.handle_ping(message),
                event = self.events.recv() => match event {
                    Ok(event) => Self::log_event(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => warn!("Missed {} view events", skipped),
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("Signal received, leaving the group...");
                    self.manager.leave().await?;
                    return Ok(());
                }
            }
        }
    }

    async fn ping_all(&self, counter: u64) {
        let ping = Ping { from: self.manager.local_member().name().to_string(), counter };
        let message = match bincode::serialize(&ping).map_err(anyhow::Error::from)
            .and_then(|data| Message::application(PING_KIND, data).map_err(anyhow::Error::from))
        {
            Ok(message) => message,
            Err(e) => {
                error!("Failed to encode ping: {}", e);
                return;
            }
        };
        if let Err(e) = self.manager.broadcast(message).await {
            error!("Failed to ping every member: {}", e);
        }
    }

    fn handle_ping(&self, message: Message) {
        let Some(data) = message.data() else {
            return;
        };
        match bincode::deserialize::<Ping>(data) {
            Ok(ping) => info!("Ping #{} from {}", ping.counter, ping.from),
            Err(e) => error!("Failed to decode ping: {}", e),
        }
    }

    fn log_event(event: ViewEvent) {
        match event {
            ViewEvent::MemberJoined(member) => info!("Member {} joined", member),
            ViewEvent::MemberLeft(member) => info!("Member {} left", member),
            ViewEvent::MemberCrashed(member) => warn!("Member {} crashed", member),
            ViewEvent::CoordinatorChanged { current, .. } => info!("Coordinator is now {}", current),
            ViewEvent::ViewInstalled(view) => info!("View {} installed with {} members", view.view_id(), view.size()),
            ViewEvent::PartitionDetected { unreachable, lost_weight, total_weight } => warn!(
                "Possible network partition: {} members unreachable, weight {}/{}",
                unreachable.len(),
                lost_weight,
                total_weight
            ),
            ViewEvent::Expelled(view) => error!("Removed from the group in view {}", view.view_id()),
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, default_value = NODE_NAME)]
    name: String,

    #[arg(long, default_value = "127.0.0.1")]
    ip: IpAddr,

    /// Datagram port for heartbeats
    #[arg(long, default_value_t = MEMBERSHIP_PORT)]
    port: u16,

    /// TCP port of the direct channel, 0 picks a free one
    #[arg(long, default_value_t = 0)]
    direct_port: u16,

    /// Direct channel addresses of existing members
    #[arg(long, value_delimiter = ',')]
    locators: Vec<SocketAddr>,

    #[arg(long, default_value_t = 1_000)]
    heartbeat_ms: u64,

    /// Pre-shared secret; enables encrypted datagrams
    #[arg(long)]
    secret: Option<String>,
}

fn setup_tracing() {
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_ansi(true)
        .with_level(true);

    let filter_layer = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_tracing();

    let mut node = Node::new(&args).await?;
    node.run().await?;

    info!("Node stopped. Goodbye!");
    Ok(())
}
