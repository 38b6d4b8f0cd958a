//! Runnel relay: the always-on service between the chat front-end and the
//! polling agents. Commands are durable rows moved through a small state
//! machine; agents never receive inbound connections.

pub mod config;
pub mod routes;
pub mod state;
pub mod watchdog;
