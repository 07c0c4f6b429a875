//! End-to-end ingestion over HTTP: configuration, conditional GET, SQLite
//! dedup state and JSON Lines output wired together as the daemon does.

use std::path::Path;
use std::sync::Arc;

use skimd::config::Config;
use skimd::engine::{Engine, PollOutcome};
use skimd::feed::HttpFetcher;
use skimd::sink::JsonLinesSink;
use skimd::storage::Database;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const RSS_V1: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>News</title>
    <item><guid>post-1</guid><title>First</title><link>https://news.example.com/1</link>
        <pubDate>Mon, 01 Jan 2024 10:00:00 GMT</pubDate></item>
    <item><guid>post-2</guid><title>Second</title><link>https://news.example.com/2</link>
        <pubDate>Tue, 02 Jan 2024 10:00:00 GMT</pubDate></item>
</channel></rss>"#;

const RSS_V2: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>News</title>
    <item><guid>post-3</guid><title>Third</title><link>https://news.example.com/3</link>
        <pubDate>Wed, 03 Jan 2024 10:00:00 GMT</pubDate></item>
    <item><guid>post-2</guid><title>Second</title><link>https://news.example.com/2</link>
        <pubDate>Tue, 02 Jan 2024 10:00:00 GMT</pubDate></item>
</channel></rss>"#;

fn config_for(server: &MockServer, db_path: &Path) -> Config {
    let content = format!(
        r#"
database_path = "{db}"
allow_private_hosts = true
fetch_timeout_secs = 5
concurrency = 2

[[sources]]
id = "news"
url = "{uri}/rss"

[[sources]]
id = "broken"
url = "{uri}/missing"
"#,
        db = db_path.display(),
        uri = server.uri()
    );
    Config::from_toml(&content).unwrap()
}

async fn build_engine(config: &Config, out: &Path) -> (Arc<Engine>, Database) {
    let db = Database::open(config.database_path.to_str().unwrap())
        .await
        .unwrap();
    let sink = JsonLinesSink::append_to(out).await.unwrap();
    let engine = Arc::new(Engine::new(
        config.engine_settings(),
        Arc::new(HttpFetcher::new().unwrap()),
        Arc::new(sink),
        Arc::new(db.clone()),
    ));
    engine.load(config.sources()).await.unwrap();
    (engine, db)
}

fn output_lines(out: &Path) -> Vec<serde_json::Value> {
    std::fs::read_to_string(out)
        .unwrap_or_default()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

fn summary_for<'a>(
    summaries: &'a [skimd::engine::PollSummary],
    id: &str,
) -> &'a skimd::engine::PollSummary {
    summaries.iter().find(|s| s.source_id == id).unwrap()
}

#[tokio::test]
async fn test_http_ingestion_across_restarts() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("entries.jsonl");
    let config = config_for(&server, &dir.path().join("state.db"));

    Mock::given(method("GET"))
        .and(path("/rss"))
        .and(header("If-None-Match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rss"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(RSS_V1)
                .insert_header("ETag", "\"v1\""),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    // First run: both entries delivered oldest first, the broken source fails alone
    {
        let (engine, db) = build_engine(&config, &out).await;
        let summaries = engine.run_once().await;
        assert_eq!(summary_for(&summaries, "news").delivered, 2);
        assert!(matches!(
            summary_for(&summaries, "broken").outcome,
            PollOutcome::Error(_)
        ));

        let lines = output_lines(&out);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["source"], "news");
        assert_eq!(lines[0]["identity"], "post-1");
        assert_eq!(lines[1]["identity"], "post-2");
        assert_eq!(lines[1]["title"], "Second");

        // Second pass sends the stored ETag and gets a 304
        let summaries = engine.run_once().await;
        assert_eq!(summary_for(&summaries, "news").outcome, PollOutcome::Unchanged);
        assert_eq!(output_lines(&out).len(), 2);
        db.close().await;
    }

    // The feed changes while the daemon is down
    server.reset().await;
    Mock::given(method("GET"))
        .and(path("/rss"))
        .respond_with(ResponseTemplate::new(200).set_body_string(RSS_V2))
        .mount(&server)
        .await;

    let (engine, db) = build_engine(&config, &out).await;
    let broken = engine
        .snapshot()
        .into_iter()
        .find(|s| s.id == "broken")
        .unwrap();
    assert_eq!(broken.consecutive_failures, 2);

    let summaries = engine.run_once().await;
    assert_eq!(summary_for(&summaries, "news").delivered, 1);

    let lines = output_lines(&out);
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[2]["identity"], "post-3");
    db.close().await;
}
