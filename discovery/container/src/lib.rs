//! Mirrors the resources of a fleet of clusters into the store.
//!
//! The [`Container`] holds one [`DataSource`] per `MigCluster`. Each data source reconciles every
//! [`Collection`] in full when it starts and then applies watch-driven [`ModelEvent`]s in arrival
//! order. Creates and updates whose resource version is not newer than the highest version seen
//! during reconciliation are discarded as already applied.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod collection;
mod container;
mod datasource;
mod event;
mod heartbeat;
mod metrics;
mod tracker;

pub use self::{
    collection::{Collection, Kind, Reconciled},
    container::{ClusterId, Container, Source},
    datasource::{DataSource, DataSourceConfig, EventSink, Phase},
    event::{Action, ModelEvent, Outcome},
    heartbeat::Heartbeat,
    metrics::Metrics,
};
