//! The renewal lease behind continuous jogging.
//!
//! A jog only keeps going as long as the operator keeps asking for it. Each
//! renewal buys one tick's worth of motion: enough distance to cover several
//! renewal periods at the commanded speed, cut into small segments so the
//! controller can stop on a segment boundary almost immediately when the
//! renewals stop. If no renewal arrives before the next tick, the lease
//! expires and motion winds down instead of running away.

use std::time::Duration;

use crate::gcode::{Axis, Directive};

/// How often the session wakes to emit the next motion batch.
pub const T_RENEW: Duration = Duration::from_millis(250);

/// Distance headroom over one renewal period, so buffered motion never runs
/// dry between ticks.
pub const SAFETY_FACTOR: f64 = 5.0;

/// Segments per emitted batch. More segments means finer stopping
/// granularity at the cost of controller queue depth.
pub const RENEW_SEGMENTS: u32 = 8;

#[derive(Debug, Clone)]
pub struct JogLease {
    axis: Axis,
    speed: f64,
    direction: f64,
    renew_distance: f64,
    armed: bool,
}

impl JogLease {
    /// A fresh lease, armed for its first tick. `signed_speed` is in machine
    /// units per minute; its sign picks the direction of travel.
    pub fn new(axis: Axis, signed_speed: f64) -> Self {
        let direction = if signed_speed < 0.0 { -1.0 } else { 1.0 };
        let speed = signed_speed.abs();
        let renew_distance = speed * (T_RENEW.as_millis() as f64 / 60_000.0) * SAFETY_FACTOR;
        JogLease {
            axis,
            speed,
            direction,
            renew_distance,
            armed: true,
        }
    }

    pub fn axis(&self) -> Axis {
        self.axis
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// True when a repeated start request is asking for exactly this motion
    /// and can be folded into a renewal.
    pub fn matches(&self, axis: Axis, signed_speed: f64) -> bool {
        let direction = if signed_speed < 0.0 { -1.0 } else { 1.0 };
        self.axis == axis && self.speed == signed_speed.abs() && self.direction == direction
    }

    /// Arm the lease for the next tick.
    pub fn renew(&mut self) {
        self.armed = true;
    }

    /// Disarm without waiting for expiry.
    pub fn release(&mut self) {
        self.armed = false;
    }

    /// Take this tick's motion batch, disarming the lease. Returns `None`
    /// when the lease has expired: no renewal arrived since the last tick.
    pub fn consume(&mut self) -> Option<Vec<Directive>> {
        if !self.armed {
            return None;
        }
        self.armed = false;

        let segment = self.direction * (self.renew_distance / RENEW_SEGMENTS as f64);
        let mut batch = Vec::with_capacity(RENEW_SEGMENTS as usize + 1);
        batch.push(Directive::RelativeFeed { feed: self.speed });
        for _ in 0..RENEW_SEGMENTS {
            batch.push(Directive::Feed {
                axis: self.axis,
                distance: segment,
                feed: None,
            });
        }
        Some(batch)
    }
}
