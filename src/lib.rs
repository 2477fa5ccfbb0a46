pub mod api;
pub mod backend;
pub mod client_flow;
pub mod config;
pub mod controller;
pub mod error;
pub mod geo;
pub mod guard;
pub mod models;
pub mod observability;
pub mod presence;
pub mod session;
pub mod state;
pub mod tracking;
