// tests/newsapi_fixture.rs
use chrono::{TimeZone, Utc};
use keyword_notifier::sources::newsapi::NewsApiSource;
use keyword_notifier::sources::ArticleSource;
use std::fs;

#[tokio::test]
async fn fixture_parses_normalizes_and_filters() {
    let body = fs::read_to_string("tests/fixtures/newsapi_everything.json")
        .expect("missing tests/fixtures/newsapi_everything.json");
    let source = NewsApiSource::from_fixture(&body);

    let since = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let articles = source.find_articles("bitcoin", since).await.expect("fixture parse ok");

    let titles: Vec<&str> = articles.iter().map(|a| a.title.as_str()).collect();
    assert_eq!(
        titles,
        vec!["ETF Approved", "Exchange Outage Resolved", "Fees Spike & Mempool Clears"]
    );

    let etf = &articles[0];
    assert_eq!(etf.source, "CoinDesk");
    assert_eq!(etf.image_url, "https://news.example.com/etf.png");
    assert_eq!(
        etf.published_at,
        Some(Utc.with_ymd_and_hms(2024, 1, 1, 5, 0, 0).unwrap())
    );

    // zero timestamp means "unknown", and unknown is kept
    assert_eq!(articles[1].published_at, None);
    assert_eq!(articles[1].author, "");

    assert_eq!(articles[2].description, "Halving talk \"heats up\" again");
}

#[tokio::test]
async fn later_bound_keeps_only_newer_and_undated() {
    let body = include_str!("fixtures/newsapi_everything.json");
    let source = NewsApiSource::from_fixture(body);

    let since = Utc.with_ymd_and_hms(2024, 1, 1, 6, 0, 0).unwrap();
    let titles: Vec<String> = source
        .find_articles("bitcoin", since)
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.title)
        .collect();
    assert_eq!(titles, vec!["Exchange Outage Resolved", "Fees Spike & Mempool Clears"]);
}

#[tokio::test]
async fn bound_is_exclusive() {
    let body = include_str!("fixtures/newsapi_everything.json");
    let source = NewsApiSource::from_fixture(body);

    let exactly = Utc.with_ymd_and_hms(2024, 1, 1, 5, 0, 0).unwrap();
    let articles = source.find_articles("bitcoin", exactly).await.unwrap();
    assert!(articles.iter().all(|a| a.title != "ETF Approved"));
}
