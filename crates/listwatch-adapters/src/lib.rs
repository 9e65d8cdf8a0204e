//! External collaborators: listing sources, relevance scorers and notifiers.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use listwatch_core::{Listing, MatchResult, Task};
use listwatch_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "listwatch-adapters";

pub const DEFAULT_REGION: &str = "sfbay";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub keywords: String,
    pub postal_code: String,
    pub radius_miles: u32,
    /// Upper bound on listings the caller will process. Sources may use it
    /// to skip per-listing work past the cut.
    pub limit: Option<usize>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("parse failed: {0}")]
    Parse(String),
    #[error("fixture {path}: {message}")]
    Fixture { path: PathBuf, message: String },
}

/// Marketplace search. A failure means the whole page could not be
/// retrieved or understood; individual bad listings are dropped instead.
#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn search(&self, query: &SearchQuery) -> Result<Vec<Listing>, SourceError>;
}

const REGION_RANGES: &[(u32, u32, &str)] = &[
    (33000, 34999, "miami"),
    (10000, 14999, "newyork"),
    (90000, 96699, "sfbay"),
    (75000, 79999, "dallas"),
    (60000, 62999, "chicago"),
    (98000, 99499, "seattle"),
    (1000, 5599, "boston"),
    (30000, 31999, "atlanta"),
    (80000, 81699, "denver"),
    (97000, 97999, "portland"),
    (89000, 89899, "lasvegas"),
    (85000, 86599, "phoenix"),
    (27000, 28999, "raleigh"),
    (22000, 24699, "norfolk"),
    (15000, 19699, "philadelphia"),
    (43000, 45999, "columbus"),
    (48000, 49999, "detroit"),
    (55000, 56999, "minneapolis"),
    (63000, 65899, "kansascity"),
    (37000, 38599, "nashville"),
    (70000, 71499, "neworleans"),
    (35000, 36999, "birmingham"),
    (38600, 39799, "jackson"),
    (71600, 72999, "littlerock"),
    (73000, 74999, "oklahomacity"),
    (66000, 67999, "wichita"),
    (68000, 69399, "omaha"),
    (50000, 52899, "desmoines"),
    (53000, 54999, "milwaukee"),
    (46000, 47999, "indianapolis"),
    (40000, 42999, "louisville"),
    (24700, 26999, "charlestonwv"),
    (20600, 21999, "baltimore"),
    (19700, 19999, "delaware"),
    (7000, 8999, "newjersey"),
    (6000, 6999, "hartford"),
    (2800, 2999, "providence"),
    (5000, 5999, "burlington"),
    (3000, 3999, "nh"),
    (3900, 4999, "maine"),
    (99500, 99999, "anchorage"),
    (96700, 96899, "honolulu"),
    (84000, 84799, "saltlakecity"),
    (83200, 83899, "boise"),
    (59000, 59999, "montana"),
    (82000, 83199, "wyoming"),
    (58000, 58899, "fargo"),
    (57000, 57799, "siouxfalls"),
    (87000, 88499, "albuquerque"),
];

/// Craigslist subdomain for a US postal code. First matching range wins;
/// unknown or malformed codes fall back to [`DEFAULT_REGION`].
pub fn region_for_postal_code(postal_code: &str) -> &'static str {
    let Ok(zip) = postal_code.trim().parse::<u32>() else {
        debug!(postal_code, "unparseable postal code; using default region");
        return DEFAULT_REGION;
    };
    REGION_RANGES
        .iter()
        .find(|(lo, hi, _)| (*lo..=*hi).contains(&zip))
        .map(|(_, _, region)| *region)
        .unwrap_or(DEFAULT_REGION)
}

pub fn build_search_url(query: &SearchQuery) -> Result<reqwest::Url, SourceError> {
    let region = region_for_postal_code(&query.postal_code);
    let radius = query.radius_miles.to_string();
    reqwest::Url::parse_with_params(
        &format!("https://{region}.craigslist.org/search/sss"),
        &[
            ("query", query.keywords.trim()),
            ("postal", query.postal_code.trim()),
            ("search_distance", radius.as_str()),
            ("sort", "date"),
        ],
    )
    .map_err(|e| SourceError::Parse(format!("search url: {e}")))
}

/// Numeric posting id from a listing URL such as
/// `https://sfbay.craigslist.org/pen/bia/d/some-title/7712345678.html`.
pub fn extract_listing_id_from_url(url: &str) -> Option<String> {
    url.match_indices(".html").find_map(|(idx, _)| {
        let head = &url[..idx];
        let (_, digits) = head.rsplit_once('/')?;
        let numeric = !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit());
        numeric.then(|| digits.to_string())
    })
}

/// Position-independent id for listings without a marketplace URL.
pub fn stable_listing_id(title: &str, price: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.trim().to_lowercase().as_bytes());
    hasher.update([0x1f]);
    hasher.update(price.unwrap_or_default().trim().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("ld-{}", &digest[..16])
}

fn selector(css: &str) -> Result<Selector, SourceError> {
    Selector::parse(css).map_err(|e| SourceError::Parse(format!("selector `{css}`: {e}")))
}

fn normalize_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn text_or_none(value: String) -> Option<String> {
    let value = normalize_ws(&value);
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn element_text(el: ElementRef<'_>) -> Option<String> {
    text_or_none(el.text().collect::<String>())
}

fn select_first_text(scope: ElementRef<'_>, sel: &Selector) -> Option<String> {
    scope.select(sel).next().and_then(element_text)
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

fn json_scalar_string(value: &JsonValue, path: &[&str]) -> Option<String> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    match cur {
        JsonValue::String(s) => text_or_none(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn absolutize(page_url: &reqwest::Url, href: &str) -> Option<String> {
    page_url.join(href).ok().map(|u| u.to_string())
}

#[derive(Debug, Clone)]
struct DomHit {
    title: String,
    url: String,
    price: Option<String>,
    location: Option<String>,
}

fn parse_dom_hits(document: &Html, page_url: &reqwest::Url) -> Result<Vec<DomHit>, SourceError> {
    let item_sel = selector("li.cl-static-search-result")?;
    let link_sel = selector("a[href]")?;
    let title_sel = selector("div.title")?;
    let price_sel = selector("div.price")?;
    let location_sel = selector("div.location")?;

    let mut hits = Vec::new();
    for item in document.select(&item_sel) {
        let Some(link) = item.select(&link_sel).next() else {
            continue;
        };
        let Some(url) = link.value().attr("href").and_then(|h| absolutize(page_url, h)) else {
            continue;
        };
        let title = select_first_text(item, &title_sel)
            .or_else(|| item.value().attr("title").and_then(|t| text_or_none(t.to_string())))
            .or_else(|| element_text(link));
        let Some(title) = title else {
            continue;
        };
        hits.push(DomHit {
            title,
            url,
            price: select_first_text(item, &price_sel),
            location: select_first_text(item, &location_sel),
        });
    }
    Ok(hits)
}

fn parse_json_ld(
    document: &Html,
    page_url: &reqwest::Url,
    dom: &[DomHit],
) -> Result<Vec<Listing>, SourceError> {
    let script_sel = selector("script#ld_searchpage_results")?;
    let Some(script) = document.select(&script_sel).next() else {
        return Ok(Vec::new());
    };
    let raw = script.text().collect::<String>();
    let data: JsonValue = match serde_json::from_str(&raw) {
        Ok(data) => data,
        Err(err) => {
            warn!(error = %err, "unreadable JSON-LD search results; falling back to DOM");
            return Ok(Vec::new());
        }
    };
    let Some(items) = data.get("itemListElement").and_then(JsonValue::as_array) else {
        return Ok(Vec::new());
    };

    // Each DOM row backs at most one JSON-LD entry, claimed in page order.
    let mut unclaimed: Vec<&DomHit> = dom.iter().collect();
    let mut listings = Vec::with_capacity(items.len());
    for entry in items {
        let Some(product) = entry.get("item") else {
            continue;
        };
        let title = json_str(product, &["name"]).and_then(|t| text_or_none(t.to_string()));
        let Some(title) = title else {
            continue;
        };
        let price = json_scalar_string(product, &["offers", "price"]);
        let location = json_scalar_string(
            product,
            &["offers", "availableAtOrFrom", "address", "addressLocality"],
        );
        let description = json_str(product, &["description"])
            .map(normalize_ws)
            .unwrap_or_default();

        let dom_url = unclaimed
            .iter()
            .position(|hit| hit.title == title)
            .map(|idx| unclaimed.remove(idx).url.clone());
        let id = dom_url
            .as_deref()
            .and_then(extract_listing_id_from_url)
            .unwrap_or_else(|| stable_listing_id(&title, price.as_deref()));
        let url = match dom_url {
            Some(url) => url,
            None => {
                let mut fallback = page_url.clone();
                fallback.set_query(None);
                fallback.query_pairs_mut().append_pair("query", &title);
                fallback.to_string()
            }
        };

        listings.push(Listing {
            id,
            title,
            price,
            location,
            url,
            description,
            posted_at: None,
        });
    }
    Ok(listings)
}

/// Extracts listings from a search results page in page order (newest first
/// when the search was sorted by date). The embedded JSON-LD block is
/// preferred; the static result list is the fallback.
pub fn parse_search_page(html: &str, page_url: &reqwest::Url) -> Result<Vec<Listing>, SourceError> {
    let document = Html::parse_document(html);
    let dom = parse_dom_hits(&document, page_url)?;

    let from_json_ld = parse_json_ld(&document, page_url, &dom)?;
    if !from_json_ld.is_empty() {
        debug!(count = from_json_ld.len(), "using JSON-LD search results");
        return Ok(from_json_ld);
    }

    debug!(count = dom.len(), "using DOM search results");
    Ok(dom
        .into_iter()
        .filter_map(|hit| {
            let Some(id) = extract_listing_id_from_url(&hit.url) else {
                debug!(url = %hit.url, "search result without a posting id; skipped");
                return None;
            };
            Some(Listing {
                id,
                title: hit.title,
                price: hit.price,
                location: hit.location,
                url: hit.url,
                description: String::new(),
                posted_at: None,
            })
        })
        .collect())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetailFields {
    pub description: Option<String>,
    pub price: Option<String>,
    pub postal_code: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
}

/// First standalone five digit group, e.g. the zip in "Oakland, CA 94607".
pub fn find_postal_code(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let is_word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    let mut i = 0;
    while i < bytes.len() {
        if !bytes[i].is_ascii_digit() {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        let bounded_left = start == 0 || !is_word(bytes[start - 1]);
        let bounded_right = i == bytes.len() || !is_word(bytes[i]);
        if i - start == 5 && bounded_left && bounded_right {
            return Some(text[start..i].to_string());
        }
    }
    None
}

pub fn parse_detail_page(html: &str) -> Result<DetailFields, SourceError> {
    let document = Html::parse_document(html);
    let root = document.root_element();
    let body_sel = selector("section#postingbody")?;
    let print_sel = selector("div.print-information")?;

    let description = root.select(&body_sel).next().and_then(|body| {
        let mut text = body.text().collect::<String>();
        for noise in body.select(&print_sel) {
            let noise_text = noise.text().collect::<String>();
            if !noise_text.is_empty() {
                text = text.replacen(&noise_text, "", 1);
            }
        }
        text_or_none(text)
    });

    let price_sel = selector("span.price")?;
    let priceinfo_sel = selector("span.priceinfo")?;
    let price = select_first_text(root, &price_sel)
        .or_else(|| select_first_text(root, &priceinfo_sel));

    let postal_code = ["div.mapAndAttrs", "div.postingtitle"]
        .into_iter()
        .map(selector)
        .collect::<Result<Vec<_>, _>>()?
        .iter()
        .filter_map(|sel| root.select(sel).next())
        .find_map(|el| find_postal_code(&el.text().collect::<String>()));

    let posted_at = root
        .select(&selector("time.date.timeago[datetime], time[datetime]")?)
        .next()
        .and_then(|el| el.value().attr("datetime"))
        .and_then(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z"))
                .ok()
        })
        .map(|dt| dt.with_timezone(&Utc));

    Ok(DetailFields {
        description,
        price,
        postal_code,
        posted_at,
    })
}

/// Live Craigslist search over the shared polite fetcher.
#[derive(Debug, Clone)]
pub struct CraigslistSource {
    fetcher: Arc<HttpFetcher>,
    fetch_details: bool,
}

impl CraigslistSource {
    pub fn new(fetcher: Arc<HttpFetcher>, fetch_details: bool) -> Self {
        Self {
            fetcher,
            fetch_details,
        }
    }

    async fn enrich(&self, listing: &mut Listing) -> Result<(), SourceError> {
        let page = self.fetcher.fetch_text(&listing.url).await?;
        let detail = parse_detail_page(&page.body)?;
        if let Some(description) = detail.description {
            listing.description = description;
        }
        if listing.price.is_none() {
            listing.price = detail.price;
        }
        if let Some(zip) = detail.postal_code {
            listing.location = Some(match listing.location.take() {
                Some(loc) if !loc.contains(&zip) => format!("{loc} {zip}"),
                Some(loc) => loc,
                None => zip,
            });
        }
        listing.posted_at = listing.posted_at.or(detail.posted_at);
        Ok(())
    }
}

#[async_trait]
impl ListingSource for CraigslistSource {
    fn source_id(&self) -> &'static str {
        "craigslist"
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<Listing>, SourceError> {
        let url = build_search_url(query)?;
        info!(url = %url, "searching craigslist");
        let page = self.fetcher.fetch_text(url.as_str()).await?;
        let mut listings = parse_search_page(&page.body, &url)?;
        if let Some(limit) = query.limit {
            listings.truncate(limit);
        }
        if !self.fetch_details {
            return Ok(listings);
        }

        let mut out = Vec::with_capacity(listings.len());
        for mut listing in listings {
            let has_detail_page = extract_listing_id_from_url(&listing.url).is_some();
            if !listing.description.is_empty() || !has_detail_page {
                out.push(listing);
                continue;
            }
            match self.enrich(&mut listing).await {
                Ok(()) => out.push(listing),
                Err(err) => {
                    warn!(
                        listing_id = %listing.id,
                        error = %err,
                        "detail page failed; listing skipped"
                    );
                }
            }
        }
        Ok(out)
    }
}

/// Serves listings from a JSON array on disk, re-read on every search.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    path: PathBuf,
}

impl FixtureSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl ListingSource for FixtureSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<Listing>, SourceError> {
        let fixture_err = |message: String| SourceError::Fixture {
            path: self.path.clone(),
            message,
        };
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| fixture_err(e.to_string()))?;
        let mut listings: Vec<Listing> =
            serde_json::from_str(&raw).map_err(|e| fixture_err(e.to_string()))?;
        if let Some(limit) = query.limit {
            listings.truncate(limit);
        }
        Ok(listings)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Score {
    pub value: f64,
    pub rationale: String,
}

#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("api error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("malformed scorer output: {0}")]
    Malformed(String),
}

/// Relevance judgement of a listing against a free-text description. The
/// returned value is authoritative; callers only clamp it to `[0, 1]`.
#[async_trait]
pub trait Scorer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn score(&self, description: &str, listing: &Listing) -> Result<Score, ScoreError>;

    /// Condenses a description into marketplace search keywords.
    async fn refine_query(&self, description: &str) -> Result<String, ScoreError> {
        Ok(description.trim().to_string())
    }
}

const DESCRIPTION_PROMPT_CHARS: usize = 1000;

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

fn refine_prompt(description: &str) -> String {
    format!(
        "You are a marketplace search optimizer. Extract only the 2-4 most critical keywords \
         from this user query that would work as a literal classifieds search.\n\n\
         User Query: \"{description}\"\n\n\
         Rules:\n\
         - Drop filler such as \"with\", \"comparable to\", \"within\", \"miles\"\n\
         - Keep model names, sizes and key descriptors\n\
         - Return ONLY the keywords as a single line, no quotes\n\n\
         Example: \"54cm frame road bike with components comparable to Shimano 105's\" \
         -> \"54cm road bike shimano 105\"\n\n\
         Keywords:"
    )
}

fn score_prompt(description: &str, listing: &Listing) -> String {
    format!(
        "You are a professional appraiser and expert buyer. Compare the classified ad against \
         the buyer's requirements and judge its authenticity and quality. Treat near-identical \
         sizes and specs (for example 54cm vs 55cm) as acceptable.\n\n\
         LISTING:\nTitle: {title}\nPrice: {price}\nLocation: {location}\nDescription: {body}\n\n\
         BUYER REQUIREMENTS:\n{description}\n\n\
         Respond with JSON only:\n\
         {{\"match_score\": <float 0.0-1.0>, \"reasoning\": \"<brief explanation>\"}}",
        title = listing.title,
        price = listing.price.as_deref().unwrap_or("n/a"),
        location = listing.location.as_deref().unwrap_or("n/a"),
        body = truncate_chars(&listing.description, DESCRIPTION_PROMPT_CHARS),
    )
}

/// Reads `{"match_score": .., "reasoning": ..}` out of a model reply,
/// tolerating prose around the JSON object.
pub fn parse_score_response(text: &str) -> Result<Score, ScoreError> {
    let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) else {
        return Err(ScoreError::Malformed("no JSON object in response".into()));
    };
    if end < start {
        return Err(ScoreError::Malformed("no JSON object in response".into()));
    }
    let value: JsonValue = serde_json::from_str(&text[start..=end])
        .map_err(|e| ScoreError::Malformed(e.to_string()))?;
    let score = match value.get("match_score") {
        Some(JsonValue::Number(n)) => n.as_f64(),
        Some(JsonValue::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite())
    .ok_or_else(|| ScoreError::Malformed("match_score missing or not a number".into()))?;
    let rationale = json_str(&value, &["reasoning"])
        .unwrap_or("no reasoning provided")
        .to_string();
    Ok(Score {
        value: score,
        rationale,
    })
}

/// Chat-completions backed scorer.
#[derive(Debug, Clone)]
pub struct OpenAiScorer {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiScorer {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn complete(&self, prompt: String, max_tokens: u32) -> Result<String, ScoreError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": 0.1,
            "max_tokens": max_tokens,
        });

        debug!(model = %self.model, "chat completion request");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ScoreError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let resp: JsonValue = response.json().await?;
        resp["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.trim().to_string())
            .ok_or_else(|| ScoreError::Malformed("missing choices[0].message.content".into()))
    }
}

#[async_trait]
impl Scorer for OpenAiScorer {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn score(&self, description: &str, listing: &Listing) -> Result<Score, ScoreError> {
        let reply = self.complete(score_prompt(description, listing), 300).await?;
        parse_score_response(&reply)
    }

    async fn refine_query(&self, description: &str) -> Result<String, ScoreError> {
        let reply = self.complete(refine_prompt(description), 50).await?;
        let keywords = normalize_ws(reply.trim_matches(|c| c == '"' || c == '\''));
        if keywords.is_empty() {
            return Err(ScoreError::Malformed("empty keyword reply".into()));
        }
        Ok(keywords)
    }
}

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "the", "with", "for", "in", "of", "or", "to", "within", "miles", "comparable",
    "looking", "want", "need",
];

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '.')
        .map(|t| t.trim_matches('.').to_lowercase())
        .filter(|t| !t.is_empty() && !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// `"54cm"` -> `(54.0, "cm")`; tokens without a leading number or unit are `None`.
fn measurement(token: &str) -> Option<(f64, &str)> {
    let split = token.find(|c: char| !c.is_ascii_digit() && c != '.')?;
    let (num, unit) = token.split_at(split);
    if num.is_empty() || !unit.chars().all(|c| c.is_alphabetic()) {
        return None;
    }
    Some((num.parse().ok()?, unit))
}

/// Deterministic scorer based on keyword overlap. Sizes within three units
/// of the wanted one count as a near match.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordScorer;

impl KeywordScorer {
    const SIZE_TOLERANCE: f64 = 3.0;
    const FUZZY_FLOOR: f64 = 0.9;

    fn token_similarity(wanted: &str, candidates: &[String]) -> f64 {
        let mut best = 0.0_f64;
        for candidate in candidates {
            if candidate == wanted {
                return 1.0;
            }
            if let (Some((a, unit_a)), Some((b, unit_b))) =
                (measurement(wanted), measurement(candidate))
            {
                if unit_a == unit_b && (a - b).abs() <= Self::SIZE_TOLERANCE {
                    best = best.max(0.8);
                    continue;
                }
            }
            let sim = strsim::jaro_winkler(wanted, candidate);
            if sim >= Self::FUZZY_FLOOR {
                best = best.max(sim * 0.9);
            }
        }
        best
    }
}

#[async_trait]
impl Scorer for KeywordScorer {
    fn name(&self) -> &'static str {
        "keyword"
    }

    async fn score(&self, description: &str, listing: &Listing) -> Result<Score, ScoreError> {
        let mut wanted = tokenize(description);
        let mut unique = HashSet::new();
        wanted.retain(|token| unique.insert(token.clone()));
        if wanted.is_empty() {
            return Ok(Score {
                value: 0.0,
                rationale: "no keywords in description".into(),
            });
        }
        let haystack = tokenize(&format!("{} {}", listing.title, listing.description));

        let mut matched = Vec::new();
        let mut total = 0.0;
        for token in &wanted {
            let sim = Self::token_similarity(token, &haystack);
            if sim > 0.0 {
                matched.push(token.as_str());
            }
            total += sim;
        }
        let value = total / wanted.len() as f64;
        Ok(Score {
            value,
            rationale: format!(
                "matched {} of {} keywords: {}",
                matched.len(),
                wanted.len(),
                if matched.is_empty() { "none".to_string() } else { matched.join(", ") }
            ),
        })
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook rejected delivery with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("configuration error: {0}")]
    Config(String),
}

/// Delivers one matched listing to the task's notification target.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        task: &Task,
        listing: &Listing,
        result: &MatchResult,
    ) -> Result<(), NotifyError>;

    fn channel_name(&self) -> &str;
}

const EMBED_TITLE_MAX: usize = 250;
const EMBED_FIELD_MAX: usize = 1000;

/// Discord webhook body for a single matched listing.
pub fn discord_payload(
    task: &Task,
    listing: &Listing,
    result: &MatchResult,
    sent_at: DateTime<Utc>,
) -> JsonValue {
    let score_pct = format!("{:.0}%", result.score * 100.0);
    let price = listing.price.as_deref().unwrap_or("n/a");
    let location = listing.location.as_deref().unwrap_or("n/a");
    let reasoning = truncate_chars(&result.rationale, EMBED_FIELD_MAX);
    json!({
        "content": format!("New listing alert for '{}'", task.name),
        "embeds": [{
            "title": truncate_chars(&listing.title, EMBED_TITLE_MAX),
            "url": listing.url,
            "color": 0x00ff00,
            "fields": [
                {"name": "Price", "value": price, "inline": true},
                {"name": "Location", "value": location, "inline": true},
                {"name": "Match Score", "value": score_pct, "inline": true},
                {"name": "Reasoning", "value": reasoning, "inline": false},
                {"name": "URL", "value": listing.url, "inline": false},
            ],
            "footer": {"text": format!("listwatch • {}", task.description)},
            "timestamp": sent_at.to_rfc3339(),
        }],
    })
}

#[derive(Debug, Clone, Default)]
pub struct DiscordNotifier {
    client: reqwest::Client,
}

impl DiscordNotifier {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    async fn send(
        &self,
        task: &Task,
        listing: &Listing,
        result: &MatchResult,
    ) -> Result<(), NotifyError> {
        let target = reqwest::Url::parse(&task.notification_target)
            .map_err(|e| NotifyError::Config(format!("invalid webhook url: {e}")))?;
        if !matches!(target.scheme(), "http" | "https") {
            return Err(NotifyError::Config(format!(
                "unsupported webhook scheme `{}`",
                target.scheme()
            )));
        }

        let payload = discord_payload(task, listing, result, Utc::now());
        let response = self.client.post(target).json(&payload).send().await?;
        let status = response.status();
        if status.is_success() {
            debug!(task_id = %task.id, listing_id = %listing.id, "discord notification delivered");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(NotifyError::Rejected {
            status: status.as_u16(),
            body,
        })
    }

    fn channel_name(&self) -> &str {
        "discord"
    }
}

/// Writes matches to the operator log instead of delivering them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(
        &self,
        task: &Task,
        listing: &Listing,
        result: &MatchResult,
    ) -> Result<(), NotifyError> {
        info!(
            task_id = %task.id,
            listing_id = %listing.id,
            score = result.score,
            title = %listing.title,
            url = %listing.url,
            "match (dry run)"
        );
        Ok(())
    }

    fn channel_name(&self) -> &str {
        "log"
    }
}
