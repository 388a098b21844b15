//! Internal HTTP triggers: how the application server pushes events into
//! the gateway.

mod http;

pub use http::{
    publish, remove_member, PublishRequest, PublishResponse, PublishTarget, RemovalRequest,
    RemovalResponse,
};
