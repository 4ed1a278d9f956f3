//! Human-readable error descriptions and structured JSON error formatting.

use trialrig_core::error::{BuildError, RigError};
use trialrig_hardware::HwError;

/// Map an eyre::Report to a human-readable explanation with likely causes and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    if let Some(be) = err.downcast_ref::<BuildError>() {
        return match be {
            BuildError::MissingRuntime
            | BuildError::MissingEncoder
            | BuildError::MissingSound
            | BuildError::MissingValve
            | BuildError::MissingSequencer => format!(
                "What happened: The session could not be assembled ({be}).\nLikely causes: A collaborator failed to initialize.\nHow to fix: Re-run with --log-level=debug to see which part failed."
            ),
            BuildError::InvalidConfig(msg) => format!(
                "What happened: Invalid configuration ({msg}).\nLikely causes: Missing or out-of-range values in the TOML.\nHow to fix: Edit the config file, then rerun."
            ),
        };
    }

    if let Some(re) = err.downcast_ref::<RigError>() {
        return match re {
            RigError::Config(msg) => {
                if msg.contains("calibration CSV must have headers") {
                    return "Invalid headers in calibration CSV. Expected 'open_time_ms,volume_ul'."
                        .to_string();
                }
                if msg.contains("not calibrated") {
                    return format!(
                        "What happened: {msg}.\nLikely causes: No [valve.calibration] table and no --calibration file.\nHow to fix: Pass --calibration <csv> or add the samples to the config."
                    );
                }
                format!(
                    "What happened: Configuration error: {msg}.\nHow to fix: Edit the config file (or run `trialrig check-config`), then rerun."
                )
            }
            RigError::Protocol { message, raw } => {
                let visited = raw
                    .as_deref()
                    .map(|r| {
                        r.states
                            .keys()
                            .filter(|s| r.visited(s))
                            .cloned()
                            .collect::<Vec<_>>()
                            .join(", ")
                    })
                    .unwrap_or_default();
                format!(
                    "What happened: The controller broke the trial contract: {message}.\nVisited states: [{visited}]\nHow to fix: Check the state machine sent for this trial with `trialrig fsm`."
                )
            }
            RigError::Domain(msg) => format!(
                "What happened: Value out of range: {msg}.\nHow to fix: Use non-negative volumes and open times."
            ),
            RigError::Collaborator(msg) => format!(
                "What happened: A rig collaborator failed: {msg}.\nLikely causes: Controller or renderer link is down.\nHow to fix: Check the connections and restart the session."
            ),
            RigError::Io(msg) => format!(
                "What happened: File system error: {msg}.\nHow to fix: Check the session directory and its permissions."
            ),
        };
    }

    if let Some(he) = err.downcast_ref::<HwError>() {
        return format!(
            "What happened: Hardware setup failed: {he}.\nHow to fix: Check [hardware] in the config."
        );
    }

    let msg = err.to_string();
    let mut cause = String::new();
    if let Some(src) = err.source() {
        cause = format!(" Cause: {src}");
    }
    format!(
        "Something went wrong.{cause}\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}"
    )
}

/// Short stable name of the error class.
pub fn reason_name(err: &eyre::Report) -> &'static str {
    if err.downcast_ref::<BuildError>().is_some() {
        return "Config";
    }
    if let Some(re) = err.downcast_ref::<RigError>() {
        return match re {
            RigError::Config(_) => "Config",
            RigError::Protocol { .. } => "Protocol",
            RigError::Domain(_) => "Domain",
            RigError::Collaborator(_) => "Collaborator",
            RigError::Io(_) => "Io",
        };
    }
    if err.downcast_ref::<HwError>().is_some() {
        return "Collaborator";
    }
    "Error"
}

/// Exit codes: 2 configuration, 3 protocol, 4 domain, 5 collaborator, 1 otherwise.
pub fn exit_code_for_error(err: &eyre::Report) -> i32 {
    match reason_name(err) {
        "Config" => 2,
        "Protocol" => 3,
        "Domain" => 4,
        "Collaborator" => 5,
        _ => 1,
    }
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    use serde_json::json;

    let mut obj = json!({
        "reason": reason_name(err),
        "exit_code": exit_code_for_error(err),
        "message": humanize(err),
    });
    if let Some(raw) = err.downcast_ref::<RigError>().and_then(RigError::raw) {
        let visited: Vec<&str> = raw
            .states
            .keys()
            .filter(|s| raw.visited(s))
            .map(String::as_str)
            .collect();
        obj["details"] = json!({ "visited_states": visited });
    }
    obj.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use trialrig_traits::RawTrialData;

    #[rstest]
    #[case(RigError::Config("x".into()), 2)]
    #[case(RigError::protocol("two outcomes", &RawTrialData::default()), 3)]
    #[case(RigError::Domain("negative volume".into()), 4)]
    #[case(RigError::Collaborator("link down".into()), 5)]
    #[case(RigError::Io("denied".into()), 1)]
    fn exit_codes_follow_error_class(#[case] e: RigError, #[case] code: i32) {
        assert_eq!(exit_code_for_error(&eyre::Report::new(e)), code);
    }

    #[test]
    fn untyped_errors_exit_1() {
        assert_eq!(exit_code_for_error(&eyre::eyre!("boom")), 1);
    }

    #[test]
    fn protocol_json_lists_visited_states() {
        let mut raw = RawTrialData::default();
        raw.states.insert("closed_loop".into(), vec![[1.0, 1.4]]);
        raw.states.insert("no_go".into(), vec![[f64::NAN, f64::NAN]]);
        let err = eyre::Report::new(RigError::protocol("no outcome", &raw));
        let v: serde_json::Value = serde_json::from_str(&format_error_json(&err)).unwrap();
        assert_eq!(v["reason"], "Protocol");
        assert_eq!(v["exit_code"], 3);
        assert_eq!(v["details"]["visited_states"], serde_json::json!(["closed_loop"]));
    }

    #[test]
    fn csv_header_message_is_specific() {
        let err = eyre::Report::new(RigError::Config(
            "calibration CSV must have headers 'open_time_ms,volume_ul', got: a,b".into(),
        ));
        assert!(humanize(&err).starts_with("Invalid headers"));
    }
}
