pub mod cook_service;
pub mod data_forwarder;
pub mod device_state;
pub mod error;
pub mod raw_frame;
pub mod raw_service;
pub mod repository;
pub mod schedule;

pub use cook_service::{CookService, DEFAULT_MAX_PENDING_BYTES};
pub use data_forwarder::{data_to_json, DataForwarder};
pub use device_state::*;
pub use error::{DomainError, DomainResult};
pub use raw_frame::*;
pub use raw_service::{RawFrameService, RawOutcome};
pub use repository::{CommandSink, DataSink, FramePublisher, RawFramePublisher};
pub use schedule::{Command, Schedule};

#[cfg(any(test, feature = "testing"))]
pub use repository::{MockCommandSink, MockDataSink, MockFramePublisher, MockRawFramePublisher};
