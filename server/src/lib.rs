//! Chatter Server - Real-time chat hub.
//!
//! This crate provides the server side of Chatter, responsible for:
//! - Accepting authenticated WebSocket connections
//! - Fanning out each chat message to every other connected user
//! - Announcing joins and departures
//!
//! # Architecture
//!
//! A single hub task owns the registry of live connections. Connections
//! never touch each other: each one sends requests to the hub and drains its
//! own bounded outbound queue. A connection that cannot keep up is shed by
//! the hub instead of slowing everyone else down. Chat history is handed off
//! to a separate archiver task and never sits on the delivery path.

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod queue;
pub mod routes;
pub mod store;
pub mod types;
