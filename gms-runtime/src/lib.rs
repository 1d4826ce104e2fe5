//! # [`Runtime`] Module
//!
//! A small actor framework the membership service uses to serialize work.
//! Every actor owns an unbounded command queue and runs its handler for one
//! command at a time, so state touched only from inside an actor never races
//! with itself. Recurrent actors also get a `None` command on every tick of
//! their period.
//!
//! An actor handler must not destroy the runtime that runs it: `destroy` waits
//! for every actor to stop, including the caller.

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use futures::future::{pending, BoxFuture};
use futures::stream::{Stream, StreamExt as _};
use pin_project::pin_project;
use std::fmt::Debug;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Interval, MissedTickBehavior};
use tracing::{debug, error, warn};

pub use crate::metrics::RuntimeMetrics;

mod metrics;

const DEFAULT_SHUTDOWN_DURATION: Duration = Duration::from_secs(10);

/// Marker for the command type an actor consumes.
pub trait ActorCommand: Send + 'static {}

type CommandHandler<C> = Box<dyn Fn(Option<C>) -> BoxFuture<'static, ()> + Send + Sync>;

struct RuntimeConfig {
    name: String,
    shutdown_duration: Duration,
}

/// Registry entry of a running actor.
struct ActorSlot<C> {
    commands: mpsc::UnboundedSender<C>,
    stop: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

/// [`Runtime`] owns every actor it spawned and tears them down explicitly; an
/// actor never outlives [`RuntimeExt::destroy`].
pub struct Runtime<T, C>
where
    T: Hash + Eq + Clone + Send + Sync + 'static,
    C: ActorCommand,
{
    actors: DashMap<T, ActorSlot<C>>,
    metrics: Arc<RuntimeMetrics>,
    config: RuntimeConfig,
}

/// Interval adapter yielding one item per elapsed period.
#[pin_project]
struct Ticks {
    #[pin]
    interval: Interval,
}

impl Ticks {
    fn every(period: Duration) -> Self {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }
}

impl Stream for Ticks {
    type Item = Instant;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project()
            .interval
            .poll_tick(cx)
            .map(|tick| Some(tick.into_std()))
    }
}

pub struct RuntimeBuilder {
    config: RuntimeConfig,
}

impl RuntimeBuilder {
    /// Creates a new [`RuntimeBuilder`].
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let runtime = Runtime::builder()
    ///     .with_name("gms")
    ///     .with_shutdown_duration(Duration::from_secs(5))
    ///     .build::<ActorId, Command>();
    /// ```
    fn new() -> Self {
        Self {
            config: RuntimeConfig {
                name: "runtime".to_string(),
                shutdown_duration: DEFAULT_SHUTDOWN_DURATION,
            },
        }
    }

    /// Label of this runtime's metrics.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Longest wait for one actor to stop during shutdown.
    pub fn with_shutdown_duration(mut self, shutdown_duration: Duration) -> Self {
        self.config.shutdown_duration = shutdown_duration;
        self
    }

    pub fn build<T, C>(self) -> Arc<Runtime<T, C>>
    where
        T: Hash + Eq + Clone + Send + Sync + 'static,
        C: ActorCommand,
    {
        Arc::new(Runtime {
            actors: DashMap::new(),
            metrics: Arc::new(RuntimeMetrics::new(&self.config.name)),
            config: self.config,
        })
    }
}

#[async_trait::async_trait]
pub trait RuntimeExt<T, C>: Send + Sync + 'static
where
    T: Hash + Eq + Clone + Send + Sync + 'static,
    C: ActorCommand,
{
    /// Queues `command` for the actor `actor_id`.
    async fn send_command(&self, actor_id: &T, command: C) -> Result<()>;

    /// Spawns an actor that runs `command_handler` for every queued command.
    async fn spawn_actor<F>(&self, actor_id: T, command_handler: F) -> Result<()>
    where
        F: Fn(Option<C>) -> BoxFuture<'static, ()> + Send + Sync + 'static;

    /// Spawns an actor whose handler also runs with `None` once per `period`.
    async fn spawn_recurrent_actor<F>(&self, actor_id: T, period: Duration, command_handler: F) -> Result<()>
    where
        F: Fn(Option<C>) -> BoxFuture<'static, ()> + Send + Sync + 'static;

    /// Stops one actor and waits for it, bounded by the shutdown duration.
    async fn destroy_actor(&self, actor_id: &T) -> Result<()>;

    /// Stops every actor.
    async fn destroy(&self) -> Result<()>;
}

impl<T, C> Runtime<T, C>
where
    T: Hash + Debug + Eq + Clone + Send + Sync + 'static,
    C: ActorCommand,
{
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Synchronous handle for feeding an actor, usable where awaiting is not
    /// possible (scheduler thunks, for instance).
    pub fn command_sender(&self, actor_id: &T) -> Option<mpsc::UnboundedSender<C>> {
        self.actors.get(actor_id).map(|slot| slot.commands.clone())
    }

    pub fn has_actor(&self, actor_id: &T) -> bool {
        self.actors.contains_key(actor_id)
    }

    pub fn metrics(&self) -> Arc<RuntimeMetrics> {
        self.metrics.clone()
    }

    fn launch<F>(&self, actor_id: T, ticks: Option<Ticks>, command_handler: F)
    where
        F: Fn(Option<C>) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let (commands, inbox) = mpsc::unbounded_channel();
        let (stop, _) = broadcast::channel(1);
        let stop_rx = stop.subscribe();

        let task = tokio::spawn(Self::run(
            actor_id.clone(),
            Box::new(command_handler),
            inbox,
            stop_rx,
            ticks,
            self.metrics.clone(),
        ));

        self.metrics.actors.increment(1.0);
        if let Some(previous) = self.actors.insert(actor_id.clone(), ActorSlot { commands, stop, task }) {
            warn!("actor {:?} replaced while still registered, stopping previous instance", actor_id);
            let _ = previous.stop.send(());
        }
    }

    /// Actor loop. A stop signal wins over queued commands; a closed inbox
    /// ends a plain actor but not a recurrent one.
    async fn run(
        actor_id: T,
        handler: CommandHandler<C>,
        mut inbox: mpsc::UnboundedReceiver<C>,
        mut stop: broadcast::Receiver<()>,
        ticks: Option<Ticks>,
        metrics: Arc<RuntimeMetrics>,
    ) {
        let recurrent = ticks.is_some();
        let mut ticks = ticks.map(Box::pin);
        let mut inbox_open = true;

        loop {
            let next_tick = async {
                match ticks.as_mut() {
                    Some(ticks) => ticks.next().await,
                    None => pending().await,
                }
            };
            tokio::select! {
                biased;
                _ = stop.recv() => break,
                command = inbox.recv(), if inbox_open => match command {
                    Some(command) => {
                        let started = Instant::now();
                        handler(Some(command)).await;
                        metrics.commands_handled.increment(1);
                        metrics.command_latency.record(started.elapsed().as_secs_f64());
                    }
                    None if recurrent => inbox_open = false,
                    None => break,
                },
                Some(_) = next_tick => {
                    handler(None).await;
                    metrics.recurrent_ticks.increment(1);
                }
            }
        }
        debug!("actor {:?} stopped", actor_id);
        metrics.actors.decrement(1.0);
    }
}

#[async_trait::async_trait]
impl<T, C> RuntimeExt<T, C> for Runtime<T, C>
where
    T: Hash + Eq + Debug + Clone + Send + Sync + 'static,
    C: ActorCommand,
{
    /// # Examples
    ///
    /// ```ignore
    /// runtime.send_command(&ActorId::FailureDetector, Command::Tick).await?;
    /// ```
    async fn send_command(&self, actor_id: &T, command: C) -> Result<()> {
        let sent = match self.actors.get(actor_id) {
            Some(slot) => slot.commands
                .send(command)
                .map_err(|_| anyhow!("actor {:?} is no longer receiving commands", actor_id)),
            None => Err(anyhow!("actor {:?} not found", actor_id)),
        };
        if sent.is_err() {
            self.metrics.errors.increment(1);
        }
        sent
    }

    /// # Examples
    ///
    /// ```ignore
    /// runtime.spawn_actor(ActorId::FailureDetector, |command| {
    ///     Box::pin(async move {
    ///         // handle command
    ///     })
    /// }).await?;
    /// ```
    async fn spawn_actor<F>(&self, actor_id: T, command_handler: F) -> Result<()>
    where
        F: Fn(Option<C>) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.launch(actor_id, None, command_handler);
        Ok(())
    }

    /// Missed ticks are delayed rather than burst, so a slow handler never
    /// causes a catch-up storm.
    async fn spawn_recurrent_actor<F>(&self, actor_id: T, period: Duration, command_handler: F) -> Result<()>
    where
        F: Fn(Option<C>) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        if period.is_zero() {
            return Err(anyhow!("recurrent actor {:?} needs a non-zero period", actor_id));
        }
        self.launch(actor_id, Some(Ticks::every(period)), command_handler);
        Ok(())
    }

    /// Destroying an unknown actor is a no-op.
    async fn destroy_actor(&self, actor_id: &T) -> Result<()> {
        let Some((_, slot)) = self.actors.remove(actor_id) else {
            return Ok(());
        };
        // the actor may have exited already
        let _ = slot.stop.send(());
        drop(slot.commands);

        let failure = match time::timeout(self.config.shutdown_duration, slot.task).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => anyhow!("actor {:?} terminated abnormally: {}", actor_id, e),
            Err(_) => anyhow!("actor {:?} did not stop within {:?}", actor_id, self.config.shutdown_duration),
        };
        self.metrics.errors.increment(1);
        Err(failure)
    }

    async fn destroy(&self) -> Result<()> {
        let actor_ids: Vec<T> = self.actors.iter().map(|entry| entry.key().clone()).collect();

        let mut failures = 0;
        for actor_id in actor_ids {
            if let Err(e) = self.destroy_actor(&actor_id).await {
                error!("failed to stop actor {:?}: {}", actor_id, e);
                failures += 1;
            }
        }
        if failures > 0 {
            return Err(anyhow!("{} actor(s) failed to shut down cleanly", failures));
        }
        Ok(())
    }
}
