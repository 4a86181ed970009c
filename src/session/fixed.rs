//! Fixed-distance moves and the queue that holds them while something else
//! is in flight.

use std::collections::VecDeque;

use crate::gcode::{Axis, Directive};

/// One discrete nudge: a signed distance along an axis, either at a
/// commanded feed rate or as a rapid when no speed is given.
#[derive(Debug, Clone, PartialEq)]
pub struct FixedMove {
    pub axis: Axis,
    pub speed: f64,
    pub distance: f64,
}

impl FixedMove {
    /// The two-line program this move submits: a relative-mode preamble and
    /// the move itself.
    pub fn directives(&self) -> Vec<Directive> {
        let motion = if self.speed != 0.0 {
            Directive::Feed {
                axis: self.axis,
                distance: self.distance,
                feed: Some(self.speed),
            }
        } else {
            Directive::Rapid {
                axis: self.axis,
                distance: self.distance,
            }
        };
        vec![Directive::Relative, motion]
    }
}

/// Strictly first-in-first-out. Moves requested while the tool is busy wait
/// here and run one at a time, in arrival order.
#[derive(Debug, Default)]
pub struct FixedMoveQueue {
    pending: VecDeque<FixedMove>,
}

impl FixedMoveQueue {
    pub fn push(&mut self, mv: FixedMove) {
        self.pending.push_back(mv);
    }

    pub fn pop_next(&mut self) -> Option<FixedMove> {
        self.pending.pop_front()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_move_carries_feed_word() {
        let mv = FixedMove {
            axis: Axis::Y,
            speed: 300.0,
            distance: -5.0,
        };
        let lines: Vec<String> = mv.directives().iter().map(|d| d.to_string()).collect();
        assert_eq!(lines, vec!["G91", "G1 Y-5.00000 F300.000"]);
    }

    #[test]
    fn zero_speed_becomes_a_rapid() {
        let mv = FixedMove {
            axis: Axis::Y,
            speed: 0.0,
            distance: 10.0,
        };
        let lines: Vec<String> = mv.directives().iter().map(|d| d.to_string()).collect();
        assert_eq!(lines, vec!["G91", "G0 Y10.00000"]);
    }

    #[test]
    fn queue_preserves_arrival_order() {
        let mut queue = FixedMoveQueue::default();
        for distance in [1.0, 2.0, 3.0] {
            queue.push(FixedMove {
                axis: Axis::X,
                speed: 0.0,
                distance,
            });
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop_next().map(|m| m.distance), Some(1.0));
        assert_eq!(queue.pop_next().map(|m| m.distance), Some(2.0));
        assert_eq!(queue.pop_next().map(|m| m.distance), Some(3.0));
        assert!(queue.is_empty());
    }

    #[test]
    fn clear_discards_everything_waiting() {
        let mut queue = FixedMoveQueue::default();
        queue.push(FixedMove {
            axis: Axis::X,
            speed: 0.0,
            distance: 1.0,
        });
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.pop_next(), None);
    }
}
