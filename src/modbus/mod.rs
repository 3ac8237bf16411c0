pub mod frame;
pub mod functions;
pub mod protocol;

pub use frame::{FrameError, SplitPacket, TcpFrame};
pub use functions::{FunctionHandler, FunctionTable};
pub use protocol::{ExceptionCode, RegisterType};
