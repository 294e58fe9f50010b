//! The tunnel engine: target resolution, the port-forward transport,
//! per-connection stream multiplexing and the local listener.

mod listener;
mod multiplexer;
mod portforward;
mod resolver;

pub use listener::LocalListener;
pub use multiplexer::{ForwardStreams, StreamMultiplexer};
pub use portforward::{
    PortForwardConnection, PORT_FORWARD_PROTOCOL, STREAM_PROTOCOL_HEADER, STREAM_TYPE_DATA,
    STREAM_TYPE_ERROR,
};
pub use resolver::TargetResolver;

pub(crate) use listener::{run_accept_loop, ConnectionContext, ConnectionCounters};
