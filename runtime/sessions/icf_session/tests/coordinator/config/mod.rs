use googletest::{
    assert_that,
    prelude::{eq, some},
};
use icf_session::IcfSessionConfig;
use icf_session::config::SessionCookieConfig;

#[test]
fn all_fields_have_a_default_value() {
    let config: IcfSessionConfig = serde_json::from_str("{}").unwrap();
    assert_eq!(config, IcfSessionConfig::default());
    assert!(config.state.retry_on_context_expiry);
    assert_that!(
        config.state.session_inactivity_timeout,
        eq(Some(std::time::Duration::from_secs(30 * 60)))
    );
}

#[test]
fn timeouts_are_parsed_as_human_readable_durations() {
    let config: IcfSessionConfig = serde_json::from_str(
        r#"{
            "cookie": { "system_id": "A4H", "client": "001" },
            "state": { "session_inactivity_timeout": "1h", "context_timeout": "90s" }
        }"#,
    )
    .unwrap();
    assert_that!(
        config.state.session_inactivity_timeout,
        eq(Some(std::time::Duration::from_secs(3600)))
    );
    assert_that!(
        config.state.context_timeout,
        eq(Some(std::time::Duration::from_secs(90)))
    );
    assert_that!(
        config.cookie.session_cookie_name().as_deref(),
        some(eq("SAP_SESSIONID_A4H_001"))
    );
}

#[test]
fn clients_are_three_digits() {
    for valid in ["000", "001", "999"] {
        assert!(
            SessionCookieConfig::new("A4H", valid).is_ok(),
            "Expected client {valid} to be valid"
        );
    }
    for invalid in ["", "01", "0001", "ABC"] {
        assert!(
            SessionCookieConfig::new("A4H", invalid).is_err(),
            "Expected client {invalid} to be invalid"
        );
    }
}

#[test]
fn unpinned_configuration_accepts_any_session_cookie() {
    let config = SessionCookieConfig::default();
    assert!(config.is_session_cookie("SAP_SESSIONID_A4H_001"));
    assert!(config.is_session_cookie("SAP_SESSIONID_XYZ_100"));
    assert!(!config.is_session_cookie("SAP_SESSIONID_"));
    assert!(!config.is_session_cookie("sap-contextid"));

    let pinned = SessionCookieConfig::new("A4H", "001").unwrap();
    assert!(pinned.is_session_cookie("SAP_SESSIONID_A4H_001"));
    assert!(!pinned.is_session_cookie("SAP_SESSIONID_XYZ_100"));
}
