use httptest::matchers::{all_of, contains, request, url_decoded};
use httptest::responders::{json_encoded, status_code};
use httptest::{Expectation, Server};
use secrecy::SecretString;
use serde_json::json;
use tempfile::tempdir;

use spotmap::{AppConfig, MapSession, SpotRecord};

fn spot(id: &str, city: &str, country: &str) -> SpotRecord {
    SpotRecord {
        id: id.into(),
        brand: "Ferrari".into(),
        model: "F40".into(),
        year: "1989".into(),
        city: city.into(),
        country: country.into(),
        user_id: "user-1".into(),
        username: "spotter".into(),
        image_public_ids: vec!["img-1".into(), "img-2".into()],
        post_id: format!("post-{id}"),
    }
}

#[tokio::test]
async fn resolves_spots_through_env_configured_provider() {
    let server = Server::run();

    // Exactly one provider call per distinct key across both generations;
    // the server verifies the counts on drop.
    server.expect(
        Expectation::matching(all_of!(
            request::method("GET"),
            request::path("/geocode"),
            request::query(url_decoded(contains(("q", "Zagreb,Croatia")))),
            request::query(url_decoded(contains(("key", "test-key"))))
        ))
        .respond_with(json_encoded(json!({
            "results": [{ "geometry": { "lat": 45.8, "lng": 15.9 } }]
        }))),
    );
    server.expect(
        Expectation::matching(all_of!(
            request::method("GET"),
            request::path("/geocode"),
            request::query(url_decoded(contains(("q", "Atlantis,Nowhere"))))
        ))
        .respond_with(json_encoded(json!({ "results": [] }))),
    );

    std::env::set_var("OPENCAGE_API_KEY", "test-key");
    std::env::set_var("GEOCODE_ENDPOINT", server.url("/geocode").to_string());
    std::env::set_var("GEOCODE_MIN_INTERVAL_MS", "10");

    let dir = tempdir().unwrap();
    let session = MapSession::initialize(dir.path()).expect("session init");
    assert!(session.snapshot().loading);

    let records = vec![
        spot("a", "Zagreb", "Croatia"),
        spot("b", "Zagreb", "Croatia"),
        spot("c", "Atlantis", "Nowhere"),
    ];
    let stats = session.refresh(&records).await;

    assert_eq!(stats.distinct_keys, 2);
    assert_eq!(stats.resolver_calls, 2);
    assert_eq!(stats.resolved_keys, 1);
    assert_eq!(stats.unresolved_keys, 1);

    let snapshot = session.snapshot();
    assert!(!snapshot.loading);
    assert_eq!(snapshot.annotated.len(), 2);
    for annotated in &snapshot.annotated {
        assert_eq!(annotated.latitude, 45.8);
        assert_eq!(annotated.longitude, 15.9);
    }

    // Second generation: one more record in an already-cached city stays
    // off the wire and picks up the memoized coordinate.
    let mut grown = records.clone();
    grown.push(spot("d", "Zagreb", "Croatia"));
    let stats = session.refresh(&grown).await;

    assert_eq!(stats.resolver_calls, 0);
    assert_eq!(stats.cache_hits, 2);
    assert_eq!(session.snapshot().annotated.len(), 3);

    let buffer = std::fs::read_to_string(session.telemetry().buffer_path()).unwrap();
    assert!(buffer.contains("session_start"));
    assert!(buffer.contains("pipeline_run"));
}

#[tokio::test]
async fn provider_errors_hide_markers_for_the_whole_session() {
    let server = Server::run();

    server.expect(
        Expectation::matching(all_of!(
            request::method("GET"),
            request::path("/geocode"),
            request::query(url_decoded(contains(("q", "Springfield,USA"))))
        ))
        .respond_with(status_code(500)),
    );
    server.expect(
        Expectation::matching(all_of!(
            request::method("GET"),
            request::path("/geocode"),
            request::query(url_decoded(contains(("q", "Maranello,Italy"))))
        ))
        .respond_with(json_encoded(json!({
            "results": [{ "geometry": { "lat": 44.53, "lng": 10.86 } }]
        }))),
    );

    let config = AppConfig {
        geocode_endpoint: server.url("/geocode").to_string(),
        geocode_min_interval_ms: 5,
        geocode_http_timeout_secs: 5,
        opencage_api_key: Some(SecretString::from("test-key".to_string())),
        telemetry_enabled_by_default: false,
        telemetry_batch_size: 25,
    };
    let dir = tempdir().unwrap();
    let session = MapSession::with_config(dir.path(), config).expect("session init");

    let records = vec![
        spot("a", "Springfield", "USA"),
        spot("b", "Maranello", "Italy"),
    ];
    let stats = session.refresh(&records).await;

    assert_eq!(stats.resolver_calls, 2);
    assert_eq!(stats.unresolved_keys, 1);

    let snapshot = session.snapshot();
    assert_eq!(snapshot.annotated.len(), 1);
    assert_eq!(snapshot.annotated[0].spot.city, "Maranello");

    // The 500 is memoized as unresolvable; re-running never retries it
    // (the server would flag a second call to either key).
    let stats = session.refresh(&records).await;
    assert_eq!(stats.resolver_calls, 0);
    assert_eq!(session.snapshot().annotated.len(), 1);
}
