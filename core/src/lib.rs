//! # Merx Core
//!
//! Domain primitives and shared contracts for the Merx order/inventory
//! platform.
//!
//! This crate holds what every service agrees on and nothing more:
//!
//! - **Types**: UUID id newtypes, [`types::Quantity`], [`types::Money`]
//! - **Event contract**: the JSON envelope, the `@type`-tagged
//!   [`event::DomainEvent`] union and the contractual topic names
//! - **Event bus**: the [`event_bus::EventBus`] trait services publish and
//!   subscribe through
//! - **Dead letters**: the [`dead_letter::DeadLetterSink`] seam recording
//!   messages that exhausted their retry budget
//! - **Error taxonomy**: [`error::ErrorKind`] and the [`error::Classify`]
//!   seam the web layer translates through
//! - **Configuration**: operator-facing config structs with defaults
//! - **Clock**: injectable time for deterministic tests
//!
//! Aggregates themselves live in their owning service crates
//! (`merx-inventory`, `merx-orders`); cross-aggregate references are ids
//! only, never pointers.

pub mod clock;
pub mod config;
pub mod dead_letter;
pub mod error;
pub mod event;
pub mod event_bus;
pub mod inbox;
pub mod types;

pub use chrono::{DateTime, Utc};
pub use clock::{Clock, SystemClock};
pub use dead_letter::{DeadLetter, DeadLetterSink};
pub use error::{Classify, ErrorKind};
pub use event::{DomainEvent, EventEnvelope};
pub use event_bus::{EventBus, EventBusError, EventStream};
