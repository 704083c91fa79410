//! # USB Flash-Hub Controller
//!
//! Controller core for a bank of USB hubs built from I2C GPIO-expander chips.
//! It arbitrates port power, hub LEDs and the shared boot/reset lines, and
//! exposes the resulting state through a small JSON command protocol.
//!
//! ## Features
//!
//! - **Register-level hub control**: shadow registers, full-byte writes, retry with backoff
//! - **Command processing**: closed command table with structured error responses
//! - **Activity log**: fixed-capacity ring sized from available bulk memory
//! - **Emergency stop**: flag-only trigger, non-blocking timed reset hold
//! - **Cooperative scheduling**: one bounded tick, at most one command per tick
//!
//! ## Quick Start
//!
//! ```rust
//! use flashhub::prelude::*;
//!
//! let config = BoardConfig::preset("c3-mini").unwrap();
//! let bus = SimBus::with_devices(&config.hub_addresses);
//! let pins = BoardPins::new(SimPin::new(), SimPin::new(), SimPin::new(), SimPin::new(), SimPin::new());
//! let ctx = HubContext::new(config, bus, SimPlatform::new(), pins, Box::new(MemoryConfigStore::new())).unwrap();
//!
//! let mut agent = HubAgent::new(ctx);
//! agent.start(&mut NoBulkMemory);
//!
//! let mut link = LoopbackTransport::new();
//! link.push_command(r#"{"cmd":"port","port":1,"power":"high"}"#).unwrap();
//! agent.tick(&mut [&mut link as &mut dyn Transport]).unwrap();
//! assert!(link.take_response().unwrap().contains(r#""status":"ok""#));
//! ```
//!
//! ## Architecture
//!
//! - [`agent`] - context bundle and the cooperative tick
//! - [`processor`] - command validation and execution
//! - [`hub`] - register-level hub controller
//! - [`activity`] - activity log ring
//! - [`estop`] - emergency-stop state machine
//! - [`hal`] / [`sim`] - hardware seams and their simulated implementations

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod activity;
pub mod agent;
pub mod config;
pub mod config_store;
pub mod estop;
pub mod hal;
pub mod health;
pub mod hub;
pub mod pins;
pub mod processor;
pub mod protocol;
pub mod sim;
pub mod transport;

pub use agent::{AgentError, HubAgent, HubContext, TickReport};
pub use config::BoardConfig;
pub use hub::{HubController, PowerLevel};
pub use processor::{CommandProcessor, Outcome};
pub use protocol::{CommandError, Request};

/// Everything needed to assemble an agent on simulated hardware.
pub mod prelude {
    pub use crate::activity::{ActivityLogger, BulkStorageProvider};
    pub use crate::agent::{HubAgent, HubContext};
    pub use crate::config::BoardConfig;
    pub use crate::config_store::MemoryConfigStore;
    pub use crate::estop::{EmergencyState, EstopEvent};
    pub use crate::hal::{I2cBus, OutputPin, Platform};
    pub use crate::pins::BoardPins;
    pub use crate::sim::{NoBulkMemory, SimBulkMemory, SimBus, SimPin, SimPlatform};
    pub use crate::transport::{LoopbackTransport, Transport};
}
