//! Minimal clock seam, in the shape of the teacher's `common::runtime::Runtime`
//! abstraction, generalized down to the one thing this component needs:
//! "what time is it" for age-based selection (spec.md §4.E). Lets tests
//! fix `now` instead of racing the wall clock.

pub trait Clock: Send + Sync {
    fn now_unix(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_secs() as i64
    }
}

#[cfg(any(test, feature = "fake"))]
pub struct FixedClock(pub i64);

#[cfg(any(test, feature = "fake"))]
impl Clock for FixedClock {
    fn now_unix(&self) -> i64 {
        self.0
    }
}
