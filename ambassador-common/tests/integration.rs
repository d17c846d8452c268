//! Integration tests for ambassador-common.

use std::io::Write;

use ambassador_common::{
    EncodingTag, RouteTable, ScrapeTimeout, SubjectFormat, SubjectResolver, append_query,
    decode_request_query, encode_request_query, encoding_from_subject, load_subscriptions,
    tagged_subject,
};

#[test]
fn test_pull_subject_matches_subscription_topic() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"[{{
            "pubsubname": "zenoh",
            "topic": "io.prometheus.exporter.com.example.target1.9100",
            "route": {{ "default": "http://127.0.0.1:9100/metrics" }}
        }}]"#
    )
    .unwrap();

    let subs = load_subscriptions(file.path()).unwrap();
    let table = RouteTable::from_subscriptions(&subs).unwrap();

    // The bridge side derives the same subject the exporter side subscribed to
    let resolver = SubjectResolver::new("io.prometheus.exporter.", SubjectFormat::Rev);
    let subject = resolver.resolve("TARGET1.example.COM:9100").unwrap();

    let route = table.get(&subject).expect("route for resolved subject");
    assert_eq!(route.target.as_str(), "http://127.0.0.1:9100/metrics");
}

#[test]
fn test_timeout_survives_both_legs() {
    // Bridge leg: header value goes into the payload
    let timeout = ScrapeTimeout::parse(Some("42"));
    let payload = encode_request_query(Some("module=http_2xx&target=example.org"), timeout);

    // Responder leg: payload yields the same timeout and a clean query
    let (decoded, query) = decode_request_query(&payload);
    assert_eq!(decoded, timeout);
    assert_eq!(decoded.as_duration(), std::time::Duration::from_secs(42));

    let url = append_query("http://127.0.0.1:9115/probe", &query);
    assert_eq!(
        url,
        "http://127.0.0.1:9115/probe?module=http_2xx&target=example.org"
    );
}

#[test]
fn test_push_subject_round_trip() {
    for tag in [EncodingTag::Snappy, EncodingTag::Zstd] {
        let subject = tagged_subject("io.prometheus.remotewrite", &tag);
        assert_eq!(encoding_from_subject(&subject).unwrap(), Some(tag));
    }
}

#[test]
fn test_load_subscriptions_missing_file() {
    assert!(load_subscriptions("/nonexistent/subscriptions.json").is_err());
}
