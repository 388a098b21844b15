//! The `/ws` endpoint: handshake checks, the per-connection reader and
//! writer, and the frame dispatcher.

mod dispatcher;
mod handler;
mod handshake;
mod message;

pub use dispatcher::{Dispatcher, FrameOutcome};
pub use handler::ws_handler;
pub use handshake::{client_ip, extract_bearer_protocol, normalize_origin, BearerProtocol, OriginPolicy};
pub use message::{close_code, ClientMessage, ErrorCode, MemberChange, ProtocolError, ServerMessage};
