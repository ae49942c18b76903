use crate::client::{Binding, BrokerClient, DeliveryStream};
use crate::supervisor::{BackgroundTask, ConsumerSupervisor, MessageHandler, Outcome};
use crate::topology::{BrokerTopology, TopologyAction, TopologyError, TopologyEvent, TopologyState};
use futures::stream::SelectAll;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Delay before the first background run and between two runs.
pub const BACKGROUND_INTERVAL: Duration = Duration::from_secs(1);

/// One broker connection driven by a [`BrokerTopology`] on a single task.
///
/// The loop executes topology actions one at a time, feeds their completions back,
/// and otherwise waits for deliveries, the resume timer, the background task timer
/// or cancellation.
pub struct BrokerSession {
    name: String,
    client: Arc<dyn BrokerClient>,
    topology: BrokerTopology,
    supervisor: Option<ConsumerSupervisor>,
    background: Option<Box<dyn BackgroundTask>>,
}

#[derive(Default)]
struct Timers {
    resume_at: Option<Instant>,
    background_at: Option<Instant>,
}

impl BrokerSession {
    pub fn new(
        name: impl Into<String>,
        client: Arc<dyn BrokerClient>,
        bindings: Vec<Binding>,
        prefetch: u16,
    ) -> Self {
        Self {
            name: name.into(),
            client,
            topology: BrokerTopology::new(bindings, prefetch, false),
            supervisor: None,
            background: None,
        }
    }

    pub fn with_handler(mut self, handler: Box<dyn MessageHandler>) -> Self {
        self.supervisor = Some(ConsumerSupervisor::new(handler));
        self
    }

    pub fn with_background_task(mut self, task: Box<dyn BackgroundTask>) -> Self {
        let bindings = self.topology.bindings().to_vec();
        self.topology = BrokerTopology::new(bindings, self.prefetch(), true);
        self.background = Some(task);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TopologyState {
        self.topology.state()
    }

    fn prefetch(&self) -> u16 {
        self.topology.prefetch()
    }

    /// Run until cancelled or until the connection fails.
    pub async fn run(&mut self, ctx: CancellationToken) -> Result<(), TopologyError> {
        info!(session = %self.name, "Starting broker session");

        let mut actions: VecDeque<TopologyAction> = self.topology.start().into();
        let mut deliveries: SelectAll<DeliveryStream> = SelectAll::new();
        let mut timers = Timers::default();
        let mut cancelled = false;

        loop {
            while let Some(action) = actions.pop_front() {
                if let Some(event) = self.execute(action, &mut deliveries, &mut timers).await {
                    actions.extend(self.topology.handle(event)?);
                }
            }

            if self.topology.state() == TopologyState::Stopped {
                break;
            }

            tokio::select! {
                _ = ctx.cancelled(), if !cancelled => {
                    info!(session = %self.name, "Received shutdown signal");
                    cancelled = true;
                    timers = Timers::default();
                    actions.extend(self.topology.stop());
                }
                delivery = deliveries.next(), if !deliveries.is_empty() => match delivery {
                    Some(delivery) => {
                        let paused = self.topology.is_paused();
                        let outcome = match self.supervisor.as_mut() {
                            Some(supervisor) => supervisor.on_delivery(delivery, paused).await,
                            None => {
                                warn!(session = %self.name, queue = %delivery.queue, "Delivery without a handler");
                                Outcome::Failed
                            }
                        };
                        if let Outcome::Pause(duration) = outcome {
                            actions.extend(self.topology.pause(duration));
                        }
                    }
                    // Every subscription ended underneath us: the broker is gone.
                    None if self.topology.state() == TopologyState::Consuming => {
                        error!(session = %self.name, "All delivery streams ended");
                        actions.extend(self.topology.handle(TopologyEvent::ConnectionFailed(
                            "delivery streams ended".to_string(),
                        ))?);
                    }
                    None => {}
                },
                _ = wait_until(timers.resume_at) => {
                    timers.resume_at = None;
                    actions.extend(self.topology.handle(TopologyEvent::ResumeTimerFired)?);
                }
                _ = wait_until(timers.background_at) => {
                    if let Some(task) = self.background.as_mut() {
                        if let Err(e) = task.run().await {
                            error!(session = %self.name, error = ?e, "Background task failed");
                        }
                    }
                    timers.background_at = Some(Instant::now() + BACKGROUND_INTERVAL);
                }
            }
        }

        info!(session = %self.name, "Broker session stopped");
        Ok(())
    }

    async fn execute(
        &mut self,
        action: TopologyAction,
        deliveries: &mut SelectAll<DeliveryStream>,
        timers: &mut Timers,
    ) -> Option<TopologyEvent> {
        debug!(session = %self.name, action = ?action, "Executing topology action");

        let result = match action {
            TopologyAction::OpenConnection => self
                .client
                .connect()
                .await
                .map(|_| TopologyEvent::ConnectionOpened),
            TopologyAction::OpenChannel => self
                .client
                .open_channel()
                .await
                .map(|_| TopologyEvent::ChannelOpened),
            TopologyAction::SetPrefetch(prefetch) => self
                .client
                .set_prefetch(prefetch)
                .await
                .map(|_| TopologyEvent::PrefetchApplied),
            TopologyAction::DeclareExchange { name, kind } => self
                .client
                .declare_exchange(&name, kind)
                .await
                .map(|_| TopologyEvent::ExchangeDeclared(name)),
            TopologyAction::DeclareQueue { name } => self
                .client
                .declare_queue(&name)
                .await
                .map(|_| TopologyEvent::QueueDeclared(name)),
            TopologyAction::BindQueue {
                queue,
                exchange,
                kind,
            } => self
                .client
                .bind_queue(&queue, &exchange, kind)
                .await
                .map(|_| TopologyEvent::QueueBound(queue)),
            TopologyAction::Subscribe { queue } => match self.client.subscribe(&queue).await {
                Ok(stream) => {
                    info!(session = %self.name, queue = %queue, "Consuming");
                    deliveries.push(stream);
                    return None;
                }
                Err(e) => Err(e),
            },
            TopologyAction::StartBackgroundTask => {
                timers.background_at = Some(Instant::now() + BACKGROUND_INTERVAL);
                return None;
            }
            TopologyAction::CancelSubscription { queue } => {
                // Buffered deliveries are dropped unsettled and come back later.
                *deliveries = SelectAll::new();
                if let Err(e) = self.client.cancel(&queue).await {
                    warn!(session = %self.name, queue = %queue, error = %e, "Failed to cancel subscription");
                }
                return None;
            }
            TopologyAction::ArmResumeTimer(duration) => {
                timers.resume_at = Some(Instant::now() + duration);
                return None;
            }
            TopologyAction::CloseChannel => {
                if let Err(e) = self.client.close_channel().await {
                    warn!(session = %self.name, error = %e, "Failed to close channel");
                }
                return None;
            }
            TopologyAction::CloseConnection => {
                if let Err(e) = self.client.close().await {
                    warn!(session = %self.name, error = %e, "Failed to close connection");
                }
                return Some(TopologyEvent::Closed);
            }
        };

        Some(result.unwrap_or_else(|e| {
            error!(session = %self.name, error = ?e, "Broker operation failed");
            TopologyEvent::ConnectionFailed(format!("{e:#}"))
        }))
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
