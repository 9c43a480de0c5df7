use remedy_agent::event::parse_stream;

#[test]
fn parses_session_id_from_system_event() {
    let stream = r#"{"type":"system","subtype":"init","session_id":"abc-123"}
{"type":"result","subtype":"success","result":"all done","is_error":false}"#;
    let summary = parse_stream(stream);
    assert_eq!(summary.session_id.as_deref(), Some("abc-123"));
    assert_eq!(summary.output, "all done");
    assert!(!summary.is_error);
}

#[test]
fn result_event_carries_cost_and_turns() {
    let stream = r#"{"type":"result","subtype":"success","result":"ok","total_cost_usd":0.0321,"num_turns":7,"session_id":"s1"}"#;
    let summary = parse_stream(stream);
    assert!((summary.cost_usd - 0.0321).abs() < 1e-9);
    assert_eq!(summary.num_turns, 7);
}

#[test]
fn falls_back_to_legacy_cost_field() {
    let stream = r#"{"type":"result","result":"ok","cost_usd":0.5}"#;
    let summary = parse_stream(stream);
    assert!((summary.cost_usd - 0.5).abs() < 1e-9);
}

#[test]
fn assistant_text_is_fallback_output() {
    let stream = r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"first"}]}}
{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"second"}]}}"#;
    let summary = parse_stream(stream);
    assert_eq!(summary.output, "first\nsecond");
    assert_eq!(summary.num_turns, 2);
}

#[test]
fn error_result_is_flagged() {
    let stream = r#"{"type":"result","subtype":"error_max_turns","result":"","is_error":true,"num_turns":50}"#;
    let summary = parse_stream(stream);
    assert!(summary.is_error);
    assert_eq!(summary.num_turns, 50);
}

#[test]
fn malformed_lines_are_skipped() {
    let stream = "not json\n{\"type\":\"result\",\"result\":\"survived\"}\nalso not json";
    let summary = parse_stream(stream);
    assert_eq!(summary.output, "survived");
}

#[test]
fn unknown_event_types_are_tolerated() {
    let stream = r#"{"type":"some_future_event","payload":{"x":1}}
{"type":"result","result":"ok"}"#;
    let summary = parse_stream(stream);
    assert_eq!(summary.output, "ok");
}
