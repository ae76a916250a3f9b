//! # discv5-engine
//!
//! A standalone Node Discovery Protocol v5 (discv5) engine: a UDP-based,
//! Kademlia-style peer discovery protocol used to build and maintain an
//! overlay network of authenticated nodes identified by 256-bit node ids.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Protocol Engine                        │
//! │   dispatch · PING/PONG · FINDNODE/NODES · embedding surface   │
//! └──────────────────────────────────────────────────────────────┘
//!            │                  │                   │
//!            ▼                  ▼                   ▼
//! ┌──────────────────┐ ┌────────────────┐ ┌────────────────────┐
//! │       Codec       │ │ Routing Table  │ │  Request Tracker   │
//! │ handshake/session  │ │ 256 log-dist.  │ │ auth_tag / req_id  │
//! │ AES-GCM framing    │ │ buckets + repl │ │ correlation        │
//! └──────────────────┘ └────────────────┘ └────────────────────┘
//!            │
//!            ▼
//! ┌──────────────────┐ ┌────────────────┐
//! │   Lookup Engine   │ │   Maintenance  │
//! │ α-parallel FINDNODE│ │ revalidation + │
//! │ traversal          │ │ periodic lookup│
//! └──────────────────┘ └────────────────┘
//! ```
//!
//! ## External collaborators (not this crate's concern)
//!
//! The UDP socket transport, ENR encoder/decoder, key/identity store and
//! the RLP wire codec are all treated as opaque dependencies the engine
//! consumes or produces values for — see [`types`] for the thin stand-ins
//! this crate defines where a real deployment would plug in its own.
//!
//! ## Key components
//!
//! - [`engine`]: the single-dispatch-loop `Engine` that owns every other
//!   component and exposes the embedding surface (`ping`, `find_node`,
//!   `lookup`, `resolve`, ...).
//! - [`codec`]: WHOAREYOU / handshake / ordinary packet framing.
//! - [`session`]: handshake key derivation and id-nonce signatures.
//! - [`routing_table`]: the 256-bucket Kademlia table.
//! - [`request_tracker`]: request/response correlation and timeouts.
//! - [`lookup`]: the iterative α-parallel FINDNODE traversal.
//! - [`message`]: wire payloads (`PING`, `PONG`, `FINDNODE`, `NODES`).
//! - [`store`]: the injected session key/value store capability.
//! - [`rng`]: the injected random-source capability.
//!
//! ## Usage
//!
//! ```ignore
//! use discv5_engine::{Config, Engine};
//! use discv5_engine::store::InMemorySessionStore;
//!
//! let config = Config::new(signing_key, tcp_port, udp_port, external_ip);
//! let engine = Engine::new(config, Box::new(InMemorySessionStore::default())).await?;
//! engine.start();
//! let pong = engine.ping(bootstrap_node).await;
//! ```
pub mod codec;
pub mod engine;
pub mod error;
pub mod lookup;
pub mod message;
pub mod request_tracker;
pub mod rng;
pub mod routing_table;
pub mod session;
pub mod store;
pub mod types;

pub use engine::{Config, Engine};
pub use error::EngineError;
pub use types::{Address, Node, NodeId, NodeRecord};
