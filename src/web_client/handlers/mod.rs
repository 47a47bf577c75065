//! Route handler modules for the chatmirror-web API.

pub mod chats;
pub mod contacts;
pub mod events;
pub mod health;
pub mod media;
pub mod messages;
pub mod websocket;
