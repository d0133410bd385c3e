//! Outbound request throttling
//!
//! One token bucket per platform, shared by every worker, caps how fast the
//! queue calls each platform API. Waiting for a token never touches the
//! database, so a throttled worker holds its lease but no connection.

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::config::Config;
use crate::types::Platform;

pub type PlatformRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const DEFAULT_REQUESTS_PER_MINUTE: u32 = 60;

fn quota(requests_per_minute: u32) -> Quota {
    let rpm = NonZeroU32::new(requests_per_minute).unwrap_or(NonZeroU32::MIN);
    Quota::per_minute(rpm)
}

#[derive(Clone)]
pub struct PlatformThrottle {
    limiters: Arc<HashMap<Platform, Arc<PlatformRateLimiter>>>,
}

impl PlatformThrottle {
    /// Same rate for every platform
    pub fn uniform(requests_per_minute: u32) -> Self {
        let limiters = Platform::ALL
            .into_iter()
            .map(|p| (p, Arc::new(RateLimiter::direct(quota(requests_per_minute)))))
            .collect();
        Self {
            limiters: Arc::new(limiters),
        }
    }

    /// Rates from `[platforms.<name>] requests_per_minute`, 60/min otherwise
    pub fn from_config(config: &Config) -> Self {
        let limiters = Platform::ALL
            .into_iter()
            .map(|p| {
                let rpm = config
                    .platform(p)
                    .map(|c| c.requests_per_minute)
                    .unwrap_or(DEFAULT_REQUESTS_PER_MINUTE);
                (p, Arc::new(RateLimiter::direct(quota(rpm))))
            })
            .collect();
        Self {
            limiters: Arc::new(limiters),
        }
    }

    /// Wait until the platform's bucket has a token
    pub async fn acquire(&self, platform: Platform) {
        if let Some(limiter) = self.limiters.get(&platform) {
            limiter.until_ready().await;
        }
    }

    /// Take a token if one is available right now
    pub fn try_acquire(&self, platform: Platform) -> bool {
        match self.limiters.get(&platform) {
            Some(limiter) => limiter.check().is_ok(),
            None => true,
        }
    }
}

impl Default for PlatformThrottle {
    fn default() -> Self {
        Self::uniform(DEFAULT_REQUESTS_PER_MINUTE)
    }
}
