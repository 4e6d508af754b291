// Transport module - THE WIRE (abstract)
// Request/response channels between a session initiator and a peer's responder

mod loopback;
mod tcp;
mod traits;

pub use loopback::LoopbackChannel;
pub use tcp::{read_frame, write_frame, TcpChannel, TcpSyncServer};
pub use traits::{PeerChannel, TransportError};
