pub mod clock;
pub mod http_client;
pub mod keyed_lock;
pub mod text;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock, system_clock};
