//! # Geofence Server Library
//!
//! This library provides the server-side engine for real-time GPS
//! geofencing. It ingests position reports from connected principals,
//! evaluates them against circular regions, and pushes the resulting
//! entry/exit events and proximity alerts to subscribed sessions.
//!
//! ## Core Responsibilities
//!
//! ### Location Tracking
//! Every principal's reported positions are kept in a bounded history
//! ring with a monotonic-timestamp "current position" on top, so stale
//! or out-of-order reports can never roll a principal backwards.
//!
//! ### Geofence Evaluation
//! Each accepted position is checked against all active regions using
//! great-circle distance. Membership transitions produce entry and exit
//! events; continued presence produces location updates. A periodic
//! sweep reconciles memberships that event-driven checks cannot see,
//! such as a region created after its occupant last reported.
//!
//! ### Proximity Alerts
//! Regions carrying a pairing key watch for the joint presence of two
//! configured roles. Each member is alerted exactly once per
//! pair-present episode; the alert payload is optionally enriched from
//! an external context backend on a best-effort basis.
//!
//! ### Event Fan-out
//! Sessions subscribe to (principal, pairing context) topics and
//! receive the event stream over the same UDP connection they report
//! on. Delivery is best-effort; a session that disappears mid-delivery
//! is skipped silently.
//!
//! ## Architecture Design
//!
//! ### Single-Threaded Packet Loop
//! All decoded commands are processed sequentially on one main loop.
//! This eliminates race conditions between a principal's own updates
//! and guarantees that events derived from them are delivered in
//! submission order.
//!
//! ### UDP-Based Communication
//! Uses UDP sockets with bincode-encoded packets for low-latency
//! communication. Position reports are frequent and individually
//! droppable; the periodic sweep repairs any membership drift a lost
//! datagram could cause.
//!
//! ## Module Organization
//!
//! - [`location`]: per-principal position history and presence status
//! - [`regions`]: geofence registry with owner-scoped CRUD
//! - [`evaluator`]: membership snapshots and event derivation
//! - [`events`]: bounded in-memory event log
//! - [`proximity`]: pair detection and alert deduplication
//! - [`enrichment`]: best-effort external context lookups
//! - [`connections`]: live sessions, subscriptions and delivery
//! - [`dispatcher`]: orchestrating façade the transport drives
//! - [`network`]: UDP transport, background tasks and the main loop
//! - [`error`]: engine error types

pub mod connections;
pub mod dispatcher;
pub mod enrichment;
pub mod error;
pub mod evaluator;
pub mod events;
pub mod location;
pub mod network;
pub mod proximity;
pub mod regions;
