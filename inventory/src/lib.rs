//! # Merx Inventory
//!
//! The inventory service: a per-product concurrency-safe stock engine with
//! a full reservation lifecycle, driven by order events from the bus.
//!
//! ## Structure
//!
//! - [`product`]: the Product aggregate (stock levels, reservations,
//!   movements ledger, low-stock alerts)
//! - [`store`]: the persistence seam with optimistic versioning
//! - [`engine`]: per-product serialized mutations under the distributed
//!   lock, with version-conflict retries
//! - [`service`]: the bus consumer (all-or-nothing batch reservation,
//!   idempotent release, deduct-on-paid) with inbox dedup and DLQ
//! - [`sweeper`]: the periodic reservation expiry task
//! - [`http`]: the REST surface
//!
//! ## Correctness contract
//!
//! At every externally observable state, `total == available + reserved`
//! and both are non-negative; under concurrent reservation the number of
//! successes never exceeds the available units.

pub mod engine;
pub mod http;
pub mod postgres;
pub mod product;
pub mod service;
pub mod store;
pub mod sweeper;

pub use engine::{EngineError, StockEngine};
pub use product::{InventoryError, Product, Reservation, ReservationState};
pub use service::InventoryService;
