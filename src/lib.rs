//! `dedi-gateway`: a federated-network gateway that admits peer nodes
//! through a signed, proof-of-work-gated handshake, maintains one live
//! transport per approved peer (WebSocket, falling back to SSE, falling
//! back to multi-hop proxy relay), and keeps node/data-index state in
//! sync across the network.

pub mod admission;
pub mod broker;
pub mod config;
pub mod connection;
pub mod db;
pub mod engine;
pub mod error;
pub mod http;
pub mod kms;
pub mod message;
pub mod model;
pub mod pow;
pub mod route;
pub mod routing;
pub mod sync;
pub mod transport;
pub mod user;
