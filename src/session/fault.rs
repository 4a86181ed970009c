//! Sorting incoming status reports into the three reactions the session has:
//! give up, check for a tripped limit, or just fold the report in.

use crate::driver::{ControllerState, StatusReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// Interlock, shutdown or panic. The tool cannot be trusted until it has
    /// been power cycled.
    Fatal { state: ControllerState },
    /// An alarm. Might be a travel limit, might be something we do not
    /// recognize; the stored fault record decides.
    AlarmCheck,
    /// Nothing alarming. Merge and move on.
    Routine,
}

pub fn classify(report: &StatusReport) -> FaultClass {
    match report.stat_state() {
        Some(
            state @ (ControllerState::Interlock
            | ControllerState::Shutdown
            | ControllerState::Panic),
        ) => FaultClass::Fatal { state },
        Some(ControllerState::Alarm) => FaultClass::AlarmCheck,
        _ => FaultClass::Routine,
    }
}

/// Drop the first complete bracketed token from a fault message and tidy the
/// whitespace. Controllers prefix limit messages with the offending command
/// in brackets, which means nothing to an operator. A stray close bracket
/// ahead of the token is left in place; only a matched `[...]` pair goes.
pub fn clean_limit_message(raw: &str) -> String {
    let group = raw
        .match_indices(']')
        .find_map(|(close, _)| raw[..close].rfind('[').map(|open| (open, close)));
    let cleaned = match group {
        Some((open, close)) => {
            let mut out = String::with_capacity(raw.len());
            out.push_str(&raw[..open]);
            out.push_str(raw[close + 1..].trim_start());
            out
        }
        None => raw.to_string(),
    };
    cleaned.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_states_are_fatal() {
        for code in [11, 12, 13] {
            let report: StatusReport =
                serde_json::from_str(&format!(r#"{{"stat":{code}}}"#)).unwrap();
            assert!(matches!(classify(&report), FaultClass::Fatal { .. }));
        }
    }

    #[test]
    fn alarm_asks_for_a_fault_check() {
        let report = StatusReport::with_stat(ControllerState::Alarm);
        assert_eq!(classify(&report), FaultClass::AlarmCheck);
    }

    #[test]
    fn everything_else_is_routine() {
        for code in [0u8, 1, 3, 4, 5, 6, 9] {
            let report: StatusReport =
                serde_json::from_str(&format!(r#"{{"stat":{code}}}"#)).unwrap();
            assert_eq!(classify(&report), FaultClass::Routine);
        }
        let no_stat: StatusReport = serde_json::from_str(r#"{"posx":1.0}"#).unwrap();
        assert_eq!(classify(&no_stat), FaultClass::Routine);
    }

    #[test]
    fn unknown_stat_codes_are_routine() {
        let report: StatusReport = serde_json::from_str(r#"{"stat":42}"#).unwrap();
        assert_eq!(classify(&report), FaultClass::Routine);
    }

    #[test]
    fn limit_message_loses_its_bracketed_prefix() {
        assert_eq!(
            clean_limit_message("[G1] y axis soft limit"),
            "y axis soft limit"
        );
        assert_eq!(clean_limit_message("hard limit hit"), "hard limit hit");
    }

    #[test]
    fn only_the_first_bracket_group_is_removed() {
        assert_eq!(
            clean_limit_message("[G1] limit on [Y]"),
            "limit on [Y]"
        );
    }

    #[test]
    fn unbalanced_brackets_are_left_alone() {
        assert_eq!(clean_limit_message("[G1 limit"), "[G1 limit");
        assert_eq!(clean_limit_message("G1] limit"), "G1] limit");
    }

    #[test]
    fn a_stray_close_bracket_does_not_shield_the_group() {
        assert_eq!(clean_limit_message("x] [G1] limit"), "x] limit");
    }

    #[test]
    fn nested_opens_pick_the_innermost_group() {
        assert_eq!(clean_limit_message("a[b[c]d"), "a[bd");
    }
}
