//! Armada cluster core.
//!
//! Aggregates many Docker-compatible engine daemons into one virtual
//! engine: per-engine state mirroring ([`engine`]), cluster-wide lookup
//! and placement ([`cluster`], [`scheduler`]), event fan-out ([`event`]),
//! failure-driven rescheduling ([`watchdog`]) and its persistence
//! ([`store`]).

pub mod client;
pub mod cluster;
pub mod container;
pub mod driver_opts;
pub mod engine;
pub mod error;
pub mod event;
pub mod http_client;
pub mod image;
pub mod network;
pub mod scheduler;
pub mod store;
pub mod transport;
pub mod types;
pub mod volume;
pub mod watchdog;

pub use client::EngineClient;
pub use cluster::Cluster;
pub use container::{Container, Containers, ReschedulePolicy};
pub use driver_opts::DriverOpts;
pub use engine::{Engine, EngineInfo, EngineOptions};
pub use error::{ClusterError, Result};
pub use event::{Event, EventHandler, EventQueue, WatchHandle};
pub use http_client::HttpEngineClient;
pub use image::{Image, Images};
pub use network::Network;
pub use scheduler::{Scheduler, SpreadScheduler};
pub use store::Store;
pub use transport::{dial, load_tls_config, EngineStream, TlsConfig};
pub use volume::Volume;
pub use watchdog::Watchdog;
