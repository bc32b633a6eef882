//! HTTP behaviour of the metadata fetcher against a mock endpoint.

use nowplaying_proto::config::{MetadataConfig, StreamConfig};
use nowplaying_proto::metadata::{MetadataClient, MetadataError, MetadataSource};
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer, max_retries: u32) -> MetadataClient {
    let metadata = MetadataConfig {
        url: format!("{}/api/nowplaying", server.uri()),
        request_timeout_secs: 2,
        max_retries,
        retry_backoff_ms: 10,
        ..MetadataConfig::default()
    };
    MetadataClient::new(&metadata, &StreamConfig::default()).expect("client")
}

#[tokio::test]
async fn test_fetch_sends_user_agent_and_parses_song() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/nowplaying"))
        .and(header("user-agent", "NowPlayingTest/1.0.0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "now_playing": { "song": {
                "title": "Sueño Latino", "artist": "Sueño Latino", "art": "https://img/sl.jpg"
            }}}
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let song = client_for(&server, 0).fetch().await.unwrap();
    assert_eq!(song.title, "Sueño Latino");
    assert_eq!(song.artwork_url, "https://img/sl.jpg");
}

#[tokio::test]
async fn test_fetch_retries_server_errors_then_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/nowplaying"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/nowplaying"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "now_playing": { "song": { "title": "After Retry" } } }
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let song = client_for(&server, 2).fetch().await.unwrap();
    assert_eq!(song.title, "After Retry");
    assert_eq!(song.artist, "Live Stream");
}

#[tokio::test]
async fn test_fetch_gives_up_after_bounded_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/nowplaying"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let err = client_for(&server, 2).fetch().await.unwrap_err();
    assert!(matches!(err, MetadataError::Status(s) if s.as_u16() == 500));
}

#[tokio::test]
async fn test_malformed_payload_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/nowplaying"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "listeners": 12 }])))
        .expect(1)
        .mount(&server)
        .await;

    let err = client_for(&server, 3).fetch().await.unwrap_err();
    assert!(matches!(err, MetadataError::Malformed(_)));
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/nowplaying"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let err = client_for(&server, 3).fetch().await.unwrap_err();
    assert!(matches!(err, MetadataError::Status(_)));
}
