// Stream multiplexing over a single device-initiated websocket.
//
// The device dials once; every controller operation then opens its own
// stream on that session and closes it when done.

mod frame;
mod session;

pub use frame::Frame;
pub use session::{Role, Session, Stream, StreamReader, StreamWriter, TunnelError};
