//! Channel senders and lifecycle management.
//!
//! WhatsApp delivery goes through the Evolution bridge API (webhook-in,
//! REST-out). Discord owns its own event source: a per-tenant gateway
//! connection managed by [`discord_manager::DiscordBotManager`].

pub mod discord;
pub mod discord_manager;
pub mod traits;
pub mod whatsapp;

pub use traits::Channel;
