//! # Platform Abstraction
//!
//! The clock, randomness and timer primitives the policies consume. The crate never
//! implements these against hardware itself; [`crate::runtime::EmbassyPlatform`]
//! adapts them to Embassy and tests substitute a scripted fake.

use embassy_time::{Duration, Instant};

use crate::error::Error;

/// Handle of a platform timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimerId(pub u32);

/// Clock, randomness and one-shot timers.
///
/// Timers are one-shot: when a started timer expires the platform glue hands its
/// id to [`Pipeline::on_timer_expired`](crate::pipeline::Pipeline::on_timer_expired).
/// Restarting a running timer replaces its deadline.
pub trait Platform: Sync {
    /// Monotonic time.
    fn now(&self) -> Result<Instant, Error>;

    /// Blocks the calling thread. Only the synchronous driver loop may call this.
    fn sleep(&self, duration: Duration) -> Result<(), Error> {
        let _ = duration;
        Err(Error::DependencyNotProvided)
    }

    /// A random number, used for retry jitter.
    fn random(&self) -> Result<u32, Error>;

    /// Allocates a timer.
    fn timer_create(&self) -> Result<TimerId, Error>;

    /// Arms `timer` to expire once after `delay`.
    fn timer_start(&self, timer: TimerId, delay: Duration) -> Result<(), Error>;

    /// Disarms and releases `timer`.
    fn timer_destroy(&self, timer: TimerId) -> Result<(), Error>;
}

/// A platform with nothing wired in. Every call fails with
/// [`Error::DependencyNotProvided`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPlatform;

impl Platform for NoPlatform {
    fn now(&self) -> Result<Instant, Error> {
        Err(Error::DependencyNotProvided)
    }

    fn random(&self) -> Result<u32, Error> {
        Err(Error::DependencyNotProvided)
    }

    fn timer_create(&self) -> Result<TimerId, Error> {
        Err(Error::DependencyNotProvided)
    }

    fn timer_start(&self, _timer: TimerId, _delay: Duration) -> Result<(), Error> {
        Err(Error::DependencyNotProvided)
    }

    fn timer_destroy(&self, _timer: TimerId) -> Result<(), Error> {
        Err(Error::DependencyNotProvided)
    }
}

/// Unrecoverable programming error. Logs and halts.
pub fn critical_error(reason: &'static str) -> ! {
    error!("critical error: {}", reason);
    panic!("critical error: {}", reason)
}
