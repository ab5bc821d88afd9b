mod caller;
mod frame;
mod host;

pub use caller::{MIN_CAPACITY, ServiceCaller};
pub use frame::{ControlFrame, MAX_FRAME_BODY, WireError, read_frame, write_frame};
pub use host::{Handler, ServiceHost};
