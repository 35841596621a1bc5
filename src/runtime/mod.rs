//! Embassy Runtime Glue
//!
//! [`EmbassyPlatform`] implements [`Platform`] on top of `embassy-time` and drives the
//! pipeline's timers from an async task.
//!
//! # Overview
//!
//! Policies create and start timers synchronously from inside their handlers. The
//! platform keeps the deadlines in a fixed table; [`EmbassyPlatform::run`] sleeps until
//! the earliest one and hands every expired timer to
//! [`Pipeline::on_timer_expired`]. Starting a timer wakes the task so a new, earlier
//! deadline is picked up at once.
//!
//! # Example
//!
//! ```ignore
//! static PLATFORM: EmbassyPlatform = EmbassyPlatform::new(hardware_random);
//!
//! #[embassy_executor::task]
//! async fn timers(pipeline: &'static Pipeline<'static, CriticalSectionRawMutex>) -> ! {
//!     PLATFORM.run(pipeline).await
//! }
//! ```

use core::cell::RefCell;
use core::pin::pin;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::{CriticalSectionRawMutex, RawMutex};
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Timer};
use futures::future::{Either, select};
use heapless::Vec;

use crate::error::Error;
use crate::pipeline::{MAX_TIMERS, Pipeline};
use crate::platform::{Platform, TimerId};

#[derive(Debug, Clone, Copy)]
struct Slot {
    id: TimerId,
    /// `None` while the timer is allocated but not running.
    deadline: Option<Instant>,
}

struct TimerTable<const N: usize> {
    slots: Vec<Slot, N>,
    next_id: u32,
}

impl<const N: usize> TimerTable<N> {
    const fn new() -> Self {
        Self {
            slots: Vec::new(),
            next_id: 0,
        }
    }

    fn slot(&mut self, timer: TimerId) -> Result<&mut Slot, Error> {
        self.slots
            .iter_mut()
            .find(|slot| slot.id == timer)
            .ok_or(Error::NotFound)
    }
}

/// A [`Platform`] backed by the Embassy clock, with room for `N` live timers.
pub struct EmbassyPlatform<const N: usize = MAX_TIMERS> {
    timers: Mutex<CriticalSectionRawMutex, RefCell<TimerTable<N>>>,
    rearmed: Signal<CriticalSectionRawMutex, ()>,
    rng: fn() -> u32,
}

impl<const N: usize> EmbassyPlatform<N> {
    /// Creates the platform. `rng` supplies the jitter for connection retries,
    /// typically from the hardware random number generator.
    pub const fn new(rng: fn() -> u32) -> Self {
        Self {
            timers: Mutex::new(RefCell::new(TimerTable::new())),
            rearmed: Signal::new(),
            rng,
        }
    }

    /// Arms `timer` to expire at `deadline`.
    pub fn arm_at(&self, timer: TimerId, deadline: Instant) -> Result<(), Error> {
        self.timers.lock(|table| {
            table.borrow_mut().slot(timer)?.deadline = Some(deadline);
            Ok::<(), Error>(())
        })?;
        self.rearmed.signal(());
        Ok(())
    }

    /// The earliest deadline of all running timers.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.lock(|table| {
            table
                .borrow()
                .slots
                .iter()
                .filter_map(|slot| slot.deadline)
                .min()
        })
    }

    /// Stops and returns the running timer with the earliest deadline at or before
    /// `now`. The timer stays allocated until destroyed.
    pub fn take_expired(&self, now: Instant) -> Option<TimerId> {
        self.timers.lock(|table| {
            let mut table = table.borrow_mut();
            let slot = table
                .slots
                .iter_mut()
                .filter(|slot| slot.deadline.is_some_and(|deadline| deadline <= now))
                .min_by_key(|slot| slot.deadline)?;
            slot.deadline = None;
            Some(slot.id)
        })
    }

    /// Fires expired timers into `pipeline` forever.
    pub async fn run<M: RawMutex>(&self, pipeline: &Pipeline<'_, M>) -> ! {
        loop {
            while let Some(timer) = self.take_expired(Instant::now()) {
                if let Err(error) = pipeline.on_timer_expired(timer) {
                    warn!("runtime: timer {} not delivered: {:?}", timer.0, error);
                }
            }
            let rearmed = pin!(self.rearmed.wait());
            match self.next_deadline() {
                Some(deadline) => {
                    let sleep = pin!(Timer::at(deadline));
                    if let Either::Left(((), _)) = select(sleep, rearmed).await {
                        trace!("runtime: deadline reached");
                    }
                }
                None => rearmed.await,
            }
        }
    }
}

impl<const N: usize> Platform for EmbassyPlatform<N> {
    fn now(&self) -> Result<Instant, Error> {
        Ok(Instant::now())
    }

    /// Busy-waits; only meant for the synchronous driver loop.
    fn sleep(&self, duration: Duration) -> Result<(), Error> {
        embassy_time::block_for(duration);
        Ok(())
    }

    fn random(&self) -> Result<u32, Error> {
        Ok((self.rng)())
    }

    fn timer_create(&self) -> Result<TimerId, Error> {
        self.timers.lock(|table| {
            let mut table = table.borrow_mut();
            table.next_id = table.next_id.wrapping_add(1);
            let id = TimerId(table.next_id);
            table
                .slots
                .push(Slot { id, deadline: None })
                .map_err(|_| Error::BufferTooSmall)?;
            Ok(id)
        })
    }

    /// Fails with [`Error::InvalidArgument`] if the deadline is not representable.
    fn timer_start(&self, timer: TimerId, delay: Duration) -> Result<(), Error> {
        let deadline = Instant::now()
            .checked_add(delay)
            .ok_or(Error::InvalidArgument)?;
        self.arm_at(timer, deadline)
    }

    fn timer_destroy(&self, timer: TimerId) -> Result<(), Error> {
        self.timers.lock(|table| {
            let mut table = table.borrow_mut();
            let index = table
                .slots
                .iter()
                .position(|slot| slot.id == timer)
                .ok_or(Error::NotFound)?;
            table.slots.swap_remove(index);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: u64) -> Instant {
        Instant::from_millis(ms)
    }

    #[test]
    fn test_expired_timers_in_deadline_order() {
        let platform = EmbassyPlatform::<4>::new(|| 7);
        let slow = platform.timer_create().unwrap();
        let fast = platform.timer_create().unwrap();
        platform.arm_at(slow, at(100)).unwrap();
        platform.arm_at(fast, at(50)).unwrap();

        assert_eq!(platform.next_deadline(), Some(at(50)));
        assert_eq!(platform.take_expired(at(40)), None);
        assert_eq!(platform.take_expired(at(100)), Some(fast));
        assert_eq!(platform.take_expired(at(100)), Some(slow));
        assert_eq!(platform.take_expired(at(100)), None);
        assert_eq!(platform.next_deadline(), None);
    }

    #[test]
    fn test_rearm_replaces_deadline() {
        let platform = EmbassyPlatform::<4>::new(|| 0);
        let timer = platform.timer_create().unwrap();
        platform.arm_at(timer, at(10)).unwrap();
        platform.arm_at(timer, at(30)).unwrap();
        assert_eq!(platform.take_expired(at(20)), None);
        assert_eq!(platform.take_expired(at(30)), Some(timer));
    }

    #[test]
    fn test_destroy_releases_slot() {
        let platform = EmbassyPlatform::<2>::new(|| 0);
        let first = platform.timer_create().unwrap();
        let second = platform.timer_create().unwrap();
        assert_ne!(first, second);
        assert_eq!(platform.timer_create(), Err(Error::BufferTooSmall));

        platform.arm_at(first, at(10)).unwrap();
        platform.timer_destroy(first).unwrap();
        assert_eq!(platform.timer_destroy(first), Err(Error::NotFound));
        assert_eq!(platform.arm_at(first, at(10)), Err(Error::NotFound));
        assert_eq!(platform.take_expired(at(10)), None);
        assert!(platform.timer_create().is_ok());
    }

    #[test]
    fn test_timer_start_arms_relative_deadline() {
        let platform = EmbassyPlatform::<2>::new(|| 0);
        let timer = platform.timer_create().unwrap();
        let before = Instant::now();
        platform.timer_start(timer, Duration::from_secs(60)).unwrap();

        let deadline = platform.next_deadline().unwrap();
        assert!(deadline >= before + Duration::from_secs(60));
        assert_eq!(platform.take_expired(before), None);
        assert_eq!(platform.take_expired(deadline), Some(timer));
    }

    #[test]
    fn test_timer_start_rejects_unrepresentable_deadline() {
        let platform = EmbassyPlatform::<2>::new(|| 0);
        let timer = platform.timer_create().unwrap();
        assert_eq!(
            platform.timer_start(timer, Duration::MAX),
            Err(Error::InvalidArgument)
        );
        assert_eq!(platform.next_deadline(), None);
        assert_eq!(
            platform.timer_start(TimerId(99), Duration::from_millis(1)),
            Err(Error::NotFound)
        );
    }

    #[test]
    fn test_random_uses_supplied_source() {
        let platform = EmbassyPlatform::<1>::new(|| 42);
        assert_eq!(platform.random(), Ok(42));
    }
}
