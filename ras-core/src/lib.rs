//! Ranging Service (RAS) on-demand ranging data transfer.
//! Host-driven core: no I/O; host passes events and receives actions.
//! `service` wraps the core in a tokio task for hosts that want one.

pub mod config;
pub mod core;
pub mod ingest;
pub mod protocol;
pub mod ranging;
pub mod requester;
pub mod responder;
pub mod segment;
pub mod service;
pub mod store;
pub mod wire;

pub use config::Config;
pub use core::{CoreError, OutboundAction, RasCore, RasEvent};
pub use ingest::{StepResult, SubeventResult};
pub use protocol::{Channel, ConnId, Pdu, ResponseCode};
pub use requester::GetError;
pub use segment::RecordBuffer;
pub use service::{RasHandle, RasService, SendError, ServiceError, Transport};
pub use store::{RecordStore, StoreError};
