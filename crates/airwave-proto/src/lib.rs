//! Shared building blocks of the airwave daemon and its UI clients: the wire
//! protocol, the station model and store, persistence, the catalog loader and
//! the message bus that connects contexts.
pub mod bus;
pub mod catalog;
pub mod config;
pub mod error;
pub mod migrate;
pub mod platform;
pub mod protocol;
pub mod station;
pub mod storage;
pub mod store;
