#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::items_after_statements,
    clippy::manual_let_else,
    clippy::map_unwrap_or,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unused_self
)]

//! omnihub — multi-tenant omnichannel message gateway.
//!
//! Inbound chat events (WhatsApp via the Evolution bridge, Discord via the
//! gateway WebSocket) are normalized, traced, routed to a per-tenant AI agent
//! backend, and the reply is delivered back through the originating channel.

pub mod agent;
pub mod channels;
pub mod config;
pub mod gateway;
pub mod router;
pub mod trace;
pub(crate) mod util;

pub use config::Config;
