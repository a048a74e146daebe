//! ensemble-dns - Multi-signer DNSSEC provisioning coordinator.
//!
//! This crate coordinates DNSSEC key and nameserver state across a group of
//! authoritative signers jointly serving one or more zones. Each zone is
//! signed independently by two or more signers; ensemble-dns drives each
//! zone through the publication and verification steps that let a new
//! signer safely join the group, or an existing signer safely leave, while
//! the zone stays validatable to resolvers throughout.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                          ensemble-dns                              │
//! │                                                                    │
//! │  ┌──────────────┐   step   ┌──────────────┐   fetch/update         │
//! │  │ Auto-Push    │─────────▶│  FSM Engine  │──────────┐             │
//! │  │ Scheduler    │          │ (processes)  │          ▼             │
//! │  └──────────────┘          └──────┬───────┘   ┌─────────────┐      │
//! │         │                         │           │  Updater    │      │
//! │         │ select auto zones       │ state     │  Registry   │      │
//! │         ▼                         ▼           └──────┬──────┘      │
//! │  ┌─────────────────────────────────────┐             │             │
//! │  │             Zone Store              │      ┌──────┴──────┐      │
//! │  │ (zones, groups, signers, RR rows)   │      │ Rate-Limited│      │
//! │  └─────────────────────────────────────┘      │  Op Manager │      │
//! │                                               └──────┬──────┘      │
//! │                                 DNS UPDATE + TSIG /  │  HTTPS API  │
//! │                                                      ▼             │
//! │                                            signers (s1, s2, …)     │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use ensemble_dns::{Config, Coordinator, MemoryZoneStore};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config: Config = load_config();
//!     config.validate().unwrap();
//!
//!     let store = Arc::new(MemoryZoneStore::new());
//!     let shutdown = CancellationToken::new();
//!
//!     let coordinator = Coordinator::new(config, store);
//!     coordinator.run(shutdown).await.unwrap();
//! }
//! ```

#![warn(missing_docs)]

pub mod api;
pub mod config;
pub mod coordinator;
pub mod dns;
pub mod error;
pub mod fsm;
pub mod metrics;
pub mod model;
pub mod ratelimit;
pub mod store;
pub mod telemetry;
pub mod updater;

// Re-export main types
pub use config::Config;
pub use coordinator::Coordinator;
pub use error::EnsembleError;
pub use fsm::{FsmEngine, StepOutcome};
pub use store::{MemoryZoneStore, ZoneStore};
