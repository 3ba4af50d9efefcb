//! Domain value objects.
//!
//! Value objects are immutable objects that represent concepts in the domain
//! and are defined by their attributes rather than identity.

mod channel;
mod priority;
mod quiet_hours;
mod rate_ceiling;
mod retry_policy;

pub use channel::Channel;
pub use priority::Priority;
pub use quiet_hours::QuietHours;
pub use rate_ceiling::{RateCeiling, RatePeriod, RateWindowMode, next_utc_midnight, window_start};
pub use retry_policy::RetryPolicy;
