//! Reliable (at-least-once) messaging between the nodes of a fixed participant list, on top of
//!  UDP datagrams.

pub mod node_id;
pub mod packet;
pub mod ack_tracker;
pub mod transport_config;
pub mod delivery_events;
pub mod transport;
