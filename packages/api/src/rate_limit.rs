// ABOUTME: Per-client-address limits for room creation and joining
// ABOUTME: Keyed governor limiters; 429 responses carry X-RateLimit headers

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::middleware::StateInformationMiddleware;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};

use crate::response::ApiError;

type KeyedLimiter =
    RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock, StateInformationMiddleware>;

/// Room create: 5 per 15 minutes per address.
const CREATE_BURST: u32 = 5;
const CREATE_PERIOD: Duration = Duration::from_secs(15 * 60 / 5);

/// Room join: 20 per minute per address.
const JOIN_BURST: u32 = 20;
const JOIN_PERIOD: Duration = Duration::from_secs(60 / 20);

/// Address-keyed limiters for the room endpoints. Compile admission has its
/// own per-user window in the dispatcher.
pub struct AddressRateLimits {
    create: KeyedLimiter,
    join: KeyedLimiter,
    clock: DefaultClock,
}

impl Default for AddressRateLimits {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressRateLimits {
    pub fn new() -> Self {
        Self {
            create: keyed(CREATE_PERIOD, CREATE_BURST),
            join: keyed(JOIN_PERIOD, JOIN_BURST),
            clock: DefaultClock::default(),
        }
    }

    pub fn check_create(&self, addr: IpAddr) -> Result<(), ApiError> {
        self.check(&self.create, addr, CREATE_BURST)
    }

    pub fn check_join(&self, addr: IpAddr) -> Result<(), ApiError> {
        self.check(&self.join, addr, JOIN_BURST)
    }

    fn check(&self, limiter: &KeyedLimiter, addr: IpAddr, limit: u32) -> Result<(), ApiError> {
        match limiter.check_key(&addr) {
            Ok(_) => Ok(()),
            Err(not_until) => {
                let reset = not_until.wait_time_from(self.clock.now());
                Err(ApiError::RateLimited {
                    limit,
                    remaining: 0,
                    reset_secs: reset.as_secs().max(1),
                })
            }
        }
    }
}

fn keyed(period: Duration, burst: u32) -> KeyedLimiter {
    let quota = Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_minute(NonZeroU32::new(burst.max(1)).unwrap()))
        .allow_burst(NonZeroU32::new(burst.max(1)).unwrap());
    RateLimiter::keyed(quota).with_middleware::<StateInformationMiddleware>()
}
