//! Reference transport: one TCP stream per connection carrying length-prefixed JSON frames.

pub mod frame;
pub mod tcp;

pub use frame::{read_frame, write_frame, Frame, MAX_FRAME_LEN};
pub use tcp::{TcpConnection, TcpConnectionFactory};
