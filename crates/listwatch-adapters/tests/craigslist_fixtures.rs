use std::path::PathBuf;

use chrono::{TimeZone, Utc};
use listwatch_adapters::{
    parse_detail_page, parse_search_page, stable_listing_id, FixtureSource, ListingSource,
    SearchQuery, SourceError,
};

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/craigslist")
        .join(name)
}

fn read_fixture(name: &str) -> String {
    std::fs::read_to_string(fixture(name)).expect("fixture exists")
}

fn page_url() -> reqwest::Url {
    reqwest::Url::parse(
        "https://sfbay.craigslist.org/search/sss?query=road+bike&postal=94105&search_distance=15\
         &sort=date",
    )
    .unwrap()
}

#[test]
fn json_ld_results_are_preferred_and_joined_with_dom_links() {
    let listings = parse_search_page(&read_fixture("search_page.html"), &page_url()).unwrap();
    assert_eq!(listings.len(), 3);

    let trek = &listings[0];
    assert_eq!(trek.id, "7712345678");
    assert_eq!(trek.title, "Trek Domane AL2 54cm road bike");
    assert_eq!(trek.price.as_deref(), Some("650.00"));
    assert_eq!(trek.location.as_deref(), Some("Oakland"));
    assert_eq!(trek.description, "Lightly used, Shimano Claris, new tires.");

    let allez = &listings[1];
    assert_eq!(allez.id, "7712340001");
    assert_eq!(allez.price.as_deref(), Some("900"));
    assert_eq!(
        allez.url,
        concat!(
            "https://sfbay.craigslist.org/sfc/bik/d/",
            "san-francisco-specialized-allez-56cm/7712340001.html"
        )
    );

    let vintage = &listings[2];
    assert_eq!(vintage.id, stable_listing_id("Vintage steel frame 54cm", Some("200.00")));
    assert!(vintage.url.starts_with("https://sfbay.craigslist.org/search/sss?query="));
    assert!(vintage.location.is_none());
}

fn search_result_row(title: &str, id: &str) -> String {
    format!(
        r#"<li class="cl-static-search-result" title="{title}">
  <a href="https://sfbay.craigslist.org/eby/bik/d/oakland-road-bike/{id}.html">
    <div class="title">{title}</div>
  </a>
</li>"#
    )
}

#[test]
fn json_ld_join_claims_each_dom_row_once_by_exact_title() {
    let names = ["Road bike 54cm Trek", "Road bike", "Road bike", "Road"];
    let items: Vec<String> = names
        .iter()
        .map(|name| format!(r#"{{"item":{{"name":"{name}","offers":{{"price":"100"}}}}}}"#))
        .collect();
    let rows = [
        search_result_row("Road bike 54cm Trek", "1111111111"),
        search_result_row("Road bike", "2222222222"),
        search_result_row("Road bike", "3333333333"),
    ];
    let html = format!(
        r#"<html><head>
<script type="application/ld+json" id="ld_searchpage_results">{{"itemListElement":[{}]}}</script>
</head>
<body><ol>{}</ol></body></html>"#,
        items.join(","),
        rows.join("\n")
    );

    let listings = parse_search_page(&html, &page_url()).unwrap();
    let ids: Vec<String> = listings.iter().map(|l| l.id.clone()).collect();
    assert_eq!(
        ids,
        vec![
            "1111111111".to_string(),
            "2222222222".to_string(),
            "3333333333".to_string(),
            stable_listing_id("Road", Some("100")),
        ]
    );
    assert!(listings[3].url.starts_with("https://sfbay.craigslist.org/search/sss?query="));
}

#[test]
fn dom_fallback_keeps_page_order_and_skips_unidentifiable_rows() {
    let html = read_fixture("search_page_dom_only.html");
    let listings = parse_search_page(&html, &page_url()).unwrap();
    let ids: Vec<_> = listings.iter().map(|l| l.id.as_str()).collect();
    assert_eq!(ids, vec!["7799990001", "7799990002"]);
    assert_eq!(listings[0].title, "Cannondale CAAD12 54");
    assert_eq!(listings[0].price.as_deref(), Some("$1,100"));
    assert_eq!(listings[0].location.as_deref(), Some("palo alto"));
    assert_eq!(
        listings[1].url,
        "https://sfbay.craigslist.org/sby/bik/d/san-jose-fuji-roubaix-55cm/7799990002.html"
    );
    assert!(listings.iter().all(|l| l.description.is_empty()));
}

#[test]
fn empty_results_page_is_not_an_error() {
    let html = "<html><body><p>no results</p></body></html>";
    let listings = parse_search_page(html, &page_url()).unwrap();
    assert!(listings.is_empty());
}

#[test]
fn detail_page_strips_print_block_and_finds_zip() {
    let detail = parse_detail_page(&read_fixture("detail_page.html")).unwrap();
    assert_eq!(
        detail.description.as_deref(),
        Some(concat!(
            "Lightly used Trek Domane AL2, 54cm frame. ",
            "Shimano Claris drivetrain, new tires last month."
        ))
    );
    assert_eq!(detail.price.as_deref(), Some("$650"));
    assert_eq!(detail.postal_code.as_deref(), Some("94607"));
    assert_eq!(
        detail.posted_at,
        Some(Utc.with_ymd_and_hms(2026, 2, 20, 17, 15, 0).single().unwrap())
    );
}

#[tokio::test]
async fn fixture_source_applies_limit_in_file_order() {
    let source = FixtureSource::new(fixture("listings.json"));
    let query = SearchQuery {
        keywords: "road bike".into(),
        postal_code: "94105".into(),
        radius_miles: 15,
        limit: Some(2),
    };
    let listings = source.search(&query).await.unwrap();
    let ids: Vec<_> = listings.iter().map(|l| l.id.as_str()).collect();
    assert_eq!(ids, vec!["7712345678", "7712340001"]);
}

#[tokio::test]
async fn unreadable_fixture_is_a_source_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.json");
    std::fs::write(&path, "{ not json").unwrap();

    let err = FixtureSource::new(&path)
        .search(&SearchQuery {
            keywords: "x".into(),
            postal_code: "94105".into(),
            radius_miles: 5,
            limit: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SourceError::Fixture { .. }));
}
