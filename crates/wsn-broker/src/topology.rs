use crate::client::{Binding, ExchangeKind};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// The broker connection could not be opened or was lost. Fatal.
    #[error("Broker connection failed: {0}")]
    Connection(String),

    #[error("Unexpected event {event:?} in state {state}")]
    UnexpectedEvent {
        state: TopologyState,
        event: TopologyEvent,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyState {
    Disconnected,
    Connecting,
    ChannelOpen,
    DeclaringTopology,
    Ready,
    Consuming,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for TopologyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Completions reported back by whoever executes the actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyEvent {
    ConnectionOpened,
    ConnectionFailed(String),
    ChannelOpened,
    PrefetchApplied,
    ExchangeDeclared(String),
    QueueDeclared(String),
    QueueBound(String),
    ResumeTimerFired,
    Closed,
}

/// Work the machine asks for. Executing an action and reporting its completion
/// is left to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyAction {
    OpenConnection,
    OpenChannel,
    SetPrefetch(u16),
    DeclareExchange { name: String, kind: ExchangeKind },
    DeclareQueue { name: String },
    BindQueue { queue: String, exchange: String, kind: ExchangeKind },
    StartBackgroundTask,
    Subscribe { queue: String },
    CancelSubscription { queue: String },
    ArmResumeTimer(Duration),
    CloseChannel,
    CloseConnection,
}

const OPEN_CONNECTION: &str = "open_connection";
const OPEN_CHANNEL: &str = "open_channel";

fn declare_exchange_token(name: &str) -> String {
    format!("declare_exchange:{name}")
}

fn declare_queue_token(name: &str) -> String {
    format!("declare_queue:{name}")
}

fn bind_queue_token(name: &str) -> String {
    format!("bind_queue:{name}")
}

/// Setup and lifecycle of one broker session, free of I/O.
///
/// Every setup step adds a token to the pending set when issued and removes it on
/// completion. All declarations are issued together once the channel is open, so
/// their completions may arrive in any order; the topology is `Ready` exactly when
/// the pending set becomes empty.
#[derive(Debug)]
pub struct BrokerTopology {
    state: TopologyState,
    bindings: Vec<Binding>,
    prefetch: u16,
    background_task: bool,
    pending: BTreeSet<String>,
    paused: bool,
}

impl BrokerTopology {
    pub fn new(bindings: Vec<Binding>, prefetch: u16, background_task: bool) -> Self {
        Self {
            state: TopologyState::Disconnected,
            bindings,
            prefetch,
            background_task,
            pending: BTreeSet::new(),
            paused: false,
        }
    }

    pub fn state(&self) -> TopologyState {
        self.state
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn pending(&self) -> impl Iterator<Item = &str> {
        self.pending.iter().map(String::as_str)
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn prefetch(&self) -> u16 {
        self.prefetch
    }

    pub fn start(&mut self) -> Vec<TopologyAction> {
        if self.state != TopologyState::Disconnected {
            debug!(state = %self.state, "Topology already started");
            return Vec::new();
        }
        self.state = TopologyState::Connecting;
        self.pending.insert(OPEN_CONNECTION.to_string());
        vec![TopologyAction::OpenConnection]
    }

    pub fn handle(&mut self, event: TopologyEvent) -> Result<Vec<TopologyAction>, TopologyError> {
        use TopologyState::*;

        debug!(state = %self.state, event = ?event, "Topology event");

        match (self.state, event) {
            (Stopped | Failed, TopologyEvent::ConnectionFailed(_)) => Ok(Vec::new()),
            (Stopping, TopologyEvent::ConnectionFailed(_) | TopologyEvent::Closed) => {
                info!("Broker connection closed");
                self.state = Stopped;
                self.pending.clear();
                Ok(Vec::new())
            }
            (_, TopologyEvent::ConnectionFailed(reason)) => {
                self.state = Failed;
                self.pending.clear();
                Err(TopologyError::Connection(reason))
            }
            // Late completions while shutting down are harmless.
            (Stopping | Stopped, _) => Ok(Vec::new()),

            (Connecting, TopologyEvent::ConnectionOpened) => {
                info!("Broker connection open");
                self.complete(OPEN_CONNECTION);
                self.state = ChannelOpen;
                self.pending.insert(OPEN_CHANNEL.to_string());
                Ok(vec![TopologyAction::OpenChannel])
            }
            (ChannelOpen, TopologyEvent::ChannelOpened) => {
                info!("Broker channel open");
                self.complete(OPEN_CHANNEL);
                self.state = DeclaringTopology;
                let actions = self.declare_all();
                Ok(self.check_ready(actions))
            }
            (DeclaringTopology, TopologyEvent::PrefetchApplied) => Ok(Vec::new()),
            (DeclaringTopology, TopologyEvent::ExchangeDeclared(name)) => {
                info!(exchange = %name, "Exchange declared");
                self.complete(&declare_exchange_token(&name));
                Ok(self.check_ready(Vec::new()))
            }
            (DeclaringTopology, TopologyEvent::QueueDeclared(name)) => {
                info!(queue = %name, "Queue declared");
                self.complete(&declare_queue_token(&name));
                Ok(self.check_ready(Vec::new()))
            }
            (DeclaringTopology, TopologyEvent::QueueBound(name)) => {
                info!(queue = %name, "Queue bound");
                self.complete(&bind_queue_token(&name));
                Ok(self.check_ready(Vec::new()))
            }
            (Ready, TopologyEvent::ResumeTimerFired) if self.paused => {
                info!("Resuming consumption");
                self.paused = false;
                Ok(self.subscribe_all())
            }
            (_, TopologyEvent::ResumeTimerFired) => Ok(Vec::new()),

            (state, event) => Err(TopologyError::UnexpectedEvent { state, event }),
        }
    }

    /// Stop consuming for `duration`. Only meaningful while consuming.
    pub fn pause(&mut self, duration: Duration) -> Vec<TopologyAction> {
        if self.state != TopologyState::Consuming {
            debug!(state = %self.state, "Pause ignored");
            return Vec::new();
        }

        info!(duration_secs = duration.as_secs_f64(), "Pausing consumption");
        self.paused = true;
        self.state = TopologyState::Ready;

        let mut actions: Vec<TopologyAction> = self
            .queues()
            .map(|queue| TopologyAction::CancelSubscription {
                queue: queue.to_string(),
            })
            .collect();
        actions.push(TopologyAction::ArmResumeTimer(duration));
        actions
    }

    /// Begin an orderly shutdown from any state.
    pub fn stop(&mut self) -> Vec<TopologyAction> {
        use TopologyState::*;

        let actions = match self.state {
            Stopping | Stopped | Failed => return Vec::new(),
            Disconnected => {
                self.state = Stopped;
                return Vec::new();
            }
            Connecting => vec![TopologyAction::CloseConnection],
            Consuming => {
                let mut actions: Vec<TopologyAction> = self
                    .queues()
                    .map(|queue| TopologyAction::CancelSubscription {
                        queue: queue.to_string(),
                    })
                    .collect();
                actions.push(TopologyAction::CloseChannel);
                actions.push(TopologyAction::CloseConnection);
                actions
            }
            ChannelOpen | DeclaringTopology | Ready => {
                vec![TopologyAction::CloseChannel, TopologyAction::CloseConnection]
            }
        };

        info!(state = %self.state, "Stopping broker session");
        self.state = Stopping;
        self.paused = false;
        actions
    }

    fn complete(&mut self, token: &str) {
        if !self.pending.remove(token) {
            debug!(token, "Completion for a step that was not pending");
        }
    }

    fn declare_all(&mut self) -> Vec<TopologyAction> {
        let mut actions = vec![TopologyAction::SetPrefetch(self.prefetch)];
        let mut declared = BTreeSet::new();

        for binding in &self.bindings {
            if declared.insert(binding.exchange.clone()) {
                self.pending.insert(declare_exchange_token(&binding.exchange));
                actions.push(TopologyAction::DeclareExchange {
                    name: binding.exchange.clone(),
                    kind: binding.kind,
                });
            }

            if let Some(queue) = &binding.queue {
                self.pending.insert(declare_queue_token(queue));
                self.pending.insert(bind_queue_token(queue));
                actions.push(TopologyAction::DeclareQueue {
                    name: queue.clone(),
                });
                actions.push(TopologyAction::BindQueue {
                    queue: queue.clone(),
                    exchange: binding.exchange.clone(),
                    kind: binding.kind,
                });
            }
        }

        actions
    }

    fn check_ready(&mut self, mut actions: Vec<TopologyAction>) -> Vec<TopologyAction> {
        if !self.pending.is_empty() {
            return actions;
        }

        info!("Broker topology ready");
        self.state = TopologyState::Ready;
        if self.background_task {
            actions.push(TopologyAction::StartBackgroundTask);
        }
        actions.extend(self.subscribe_all());
        actions
    }

    fn subscribe_all(&mut self) -> Vec<TopologyAction> {
        let actions: Vec<TopologyAction> = self
            .queues()
            .map(|queue| TopologyAction::Subscribe {
                queue: queue.to_string(),
            })
            .collect();
        if !actions.is_empty() {
            self.state = TopologyState::Consuming;
        }
        actions
    }

    fn queues(&self) -> impl Iterator<Item = &str> {
        self.bindings.iter().filter_map(|b| b.queue.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consumer_topology() -> BrokerTopology {
        BrokerTopology::new(
            vec![
                Binding::consume("wsn_raw", ExchangeKind::Fanout, "wsn_raw_cook"),
                Binding::publish("wsn_data", ExchangeKind::Fanout),
            ],
            20,
            false,
        )
    }

    fn open_channel(topology: &mut BrokerTopology) -> Vec<TopologyAction> {
        topology.start();
        topology.handle(TopologyEvent::ConnectionOpened).unwrap();
        topology.handle(TopologyEvent::ChannelOpened).unwrap()
    }

    fn to_consuming(topology: &mut BrokerTopology) {
        open_channel(topology);
        for event in [
            TopologyEvent::PrefetchApplied,
            TopologyEvent::ExchangeDeclared("wsn_raw".into()),
            TopologyEvent::ExchangeDeclared("wsn_data".into()),
            TopologyEvent::QueueDeclared("wsn_raw_cook".into()),
            TopologyEvent::QueueBound("wsn_raw_cook".into()),
        ] {
            topology.handle(event).unwrap();
        }
        assert_eq!(topology.state(), TopologyState::Consuming);
    }

    #[test]
    fn test_channel_open_issues_all_declarations() {
        let mut topology = consumer_topology();

        let actions = open_channel(&mut topology);

        assert_eq!(topology.state(), TopologyState::DeclaringTopology);
        assert_eq!(
            actions,
            vec![
                TopologyAction::SetPrefetch(20),
                TopologyAction::DeclareExchange {
                    name: "wsn_raw".into(),
                    kind: ExchangeKind::Fanout
                },
                TopologyAction::DeclareQueue {
                    name: "wsn_raw_cook".into()
                },
                TopologyAction::BindQueue {
                    queue: "wsn_raw_cook".into(),
                    exchange: "wsn_raw".into(),
                    kind: ExchangeKind::Fanout
                },
                TopologyAction::DeclareExchange {
                    name: "wsn_data".into(),
                    kind: ExchangeKind::Fanout
                },
            ]
        );
        assert_eq!(
            topology.pending().collect::<Vec<_>>(),
            vec![
                "bind_queue:wsn_raw_cook",
                "declare_exchange:wsn_data",
                "declare_exchange:wsn_raw",
                "declare_queue:wsn_raw_cook",
            ]
        );
    }

    fn permutations(events: &[TopologyEvent]) -> Vec<Vec<TopologyEvent>> {
        if events.len() <= 1 {
            return vec![events.to_vec()];
        }
        let mut out = Vec::new();
        for i in 0..events.len() {
            let mut others = events.to_vec();
            let head = others.remove(i);
            for mut tail in permutations(&others) {
                tail.insert(0, head.clone());
                out.push(tail);
            }
        }
        out
    }

    #[test]
    fn test_ready_only_after_every_completion_in_any_order() {
        let completions = [
            TopologyEvent::QueueBound("wsn_raw_cook".into()),
            TopologyEvent::ExchangeDeclared("wsn_data".into()),
            TopologyEvent::QueueDeclared("wsn_raw_cook".into()),
            TopologyEvent::ExchangeDeclared("wsn_raw".into()),
        ];

        let orders = permutations(&completions);
        assert_eq!(orders.len(), 24);

        for order in orders {
            let mut topology = consumer_topology();
            open_channel(&mut topology);

            let (last, first) = order.split_last().unwrap();

            for event in first {
                let actions = topology.handle(event.clone()).unwrap();
                assert!(actions.is_empty());
                assert_eq!(topology.state(), TopologyState::DeclaringTopology);
            }

            let actions = topology.handle(last.clone()).unwrap();
            assert_eq!(
                actions,
                vec![TopologyAction::Subscribe {
                    queue: "wsn_raw_cook".into()
                }]
            );
            assert_eq!(topology.state(), TopologyState::Consuming);
        }
    }

    #[test]
    fn test_publish_only_topology_stays_ready_with_background_task() {
        let mut topology =
            BrokerTopology::new(vec![Binding::publish("wsn_raw", ExchangeKind::Fanout)], 20, true);
        open_channel(&mut topology);

        let actions = topology
            .handle(TopologyEvent::ExchangeDeclared("wsn_raw".into()))
            .unwrap();

        assert_eq!(actions, vec![TopologyAction::StartBackgroundTask]);
        assert_eq!(topology.state(), TopologyState::Ready);
    }

    #[test]
    fn test_pause_and_resume() {
        let mut topology = consumer_topology();
        to_consuming(&mut topology);

        let actions = topology.pause(Duration::from_secs(2));
        assert_eq!(
            actions,
            vec![
                TopologyAction::CancelSubscription {
                    queue: "wsn_raw_cook".into()
                },
                TopologyAction::ArmResumeTimer(Duration::from_secs(2)),
            ]
        );
        assert_eq!(topology.state(), TopologyState::Ready);
        assert!(topology.is_paused());

        // A second pause while paused does nothing.
        assert!(topology.pause(Duration::from_secs(2)).is_empty());

        let actions = topology.handle(TopologyEvent::ResumeTimerFired).unwrap();
        assert_eq!(
            actions,
            vec![TopologyAction::Subscribe {
                queue: "wsn_raw_cook".into()
            }]
        );
        assert_eq!(topology.state(), TopologyState::Consuming);
        assert!(!topology.is_paused());
    }

    #[test]
    fn test_stop_closes_channel_then_connection() {
        let mut topology = consumer_topology();
        to_consuming(&mut topology);

        let actions = topology.stop();

        assert_eq!(
            actions,
            vec![
                TopologyAction::CancelSubscription {
                    queue: "wsn_raw_cook".into()
                },
                TopologyAction::CloseChannel,
                TopologyAction::CloseConnection,
            ]
        );
        assert_eq!(topology.state(), TopologyState::Stopping);
        assert!(topology.stop().is_empty());

        // Late completions are ignored.
        assert!(topology
            .handle(TopologyEvent::ResumeTimerFired)
            .unwrap()
            .is_empty());

        topology.handle(TopologyEvent::Closed).unwrap();
        assert_eq!(topology.state(), TopologyState::Stopped);
    }

    #[test]
    fn test_stop_before_start() {
        let mut topology = consumer_topology();

        assert!(topology.stop().is_empty());
        assert_eq!(topology.state(), TopologyState::Stopped);
    }

    #[test]
    fn test_connection_failure_is_fatal() {
        let mut topology = consumer_topology();
        topology.start();

        let result = topology.handle(TopologyEvent::ConnectionFailed("refused".into()));

        assert_eq!(result, Err(TopologyError::Connection("refused".into())));
        assert_eq!(topology.state(), TopologyState::Failed);
    }

    #[test]
    fn test_unexpected_event() {
        let mut topology = consumer_topology();
        topology.start();

        let result = topology.handle(TopologyEvent::ChannelOpened);

        assert!(matches!(
            result,
            Err(TopologyError::UnexpectedEvent {
                state: TopologyState::Connecting,
                ..
            })
        ));
    }
}
