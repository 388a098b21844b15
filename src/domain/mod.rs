//! Identifier types shared across the gateway.
//!
//! The relational store keys everything by `BIGINT`, so ids stay plain `i64`
//! aliases rather than newtypes.

pub type UserId = i64;
pub type RoomId = i64;
pub type ChannelId = i64;
pub type ThreadId = i64;
