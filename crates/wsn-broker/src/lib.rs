mod client;
mod handlers;
mod nats;
mod producer;
mod session;
mod supervisor;
mod topology;

pub use client::{Acker, Binding, BrokerClient, Delivery, DeliveryStream, ExchangeKind};
pub use handlers::{CookHandler, ForwardHandler, RawDrainTask};
pub use nats::{filter_for, subject_for, NatsBroker, DEFAULT_ROUTING_KEY};
pub use producer::BrokerPublisher;
pub use session::{BrokerSession, BACKGROUND_INTERVAL};
pub use supervisor::{BackgroundTask, ConsumerSupervisor, HandlerError, MessageHandler, Outcome};
pub use topology::{BrokerTopology, TopologyAction, TopologyError, TopologyEvent, TopologyState};
