//! RSS-backed content source. The feed URL is a template with a `{username}`
//! placeholder (e.g. a Nitter or RSSHub instance); only the first `<item>` is
//! considered.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quick_xml::escape::resolve_html5_entity;
use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::reader::Reader;
use reqwest::Client;
use std::borrow::Cow;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::ContentSource;
use crate::model::{ContentItem, Platform};

pub struct FeedSource {
    platform: Platform,
    url_template: String,
    http: Client,
}

impl FeedSource {
    pub fn new(platform: Platform, url_template: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .user_agent("social-relay/0.1")
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            platform,
            url_template: url_template.into(),
            http,
        })
    }

    pub fn feed_url(&self, username: &str) -> String {
        self.url_template.replace("{username}", username)
    }

    async fn fetch(&self, username: &str) -> Result<String> {
        let url = self.feed_url(username);
        debug!(%url, "fetching feed");
        let res = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to reach {url}"))?;
        let res = res
            .error_for_status()
            .with_context(|| format!("feed request to {url} failed"))?;
        res.text().await.context("failed to read feed body")
    }
}

#[async_trait]
impl ContentSource for FeedSource {
    fn platform(&self) -> Platform {
        self.platform
    }

    #[instrument(skip_all, fields(platform = %self.platform, username = %username))]
    async fn check_latest(
        &self,
        username: &str,
        last_seen_item_id: Option<&str>,
    ) -> Option<ContentItem> {
        let body = match self.fetch(username).await {
            Ok(body) => body,
            Err(err) => {
                warn!(?err, "content source unavailable");
                return None;
            }
        };
        let Some(item) = parse_latest(self.platform, username, &body) else {
            debug!("feed has no usable items");
            return None;
        };
        if last_seen_item_id == Some(item.id.as_str()) {
            return None;
        }
        Some(item)
    }
}

/// Parse the first item of an RSS document into a [`ContentItem`].
pub fn parse_latest(platform: Platform, username: &str, xml: &str) -> Option<ContentItem> {
    let item = read_first_item(xml)?;

    let id = item
        .guid
        .as_deref()
        .and_then(id_from_reference)
        .or_else(|| item.link.as_deref().and_then(id_from_reference))?;

    let (summary, inline_image) = item
        .description
        .as_deref()
        .map(summarize_html)
        .unwrap_or_default();
    let image_url = item.enclosure.or(inline_image);

    let content = item
        .title
        .filter(|t| !t.is_empty())
        .or_else(|| (!summary.is_empty()).then_some(summary))
        .unwrap_or_else(|| format!("New {} post", platform.label()));

    let timestamp = item
        .pub_date
        .and_then(|d| DateTime::parse_from_rfc2822(&d).ok())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Some(ContentItem {
        url: canonical_url(platform, username, &id),
        id,
        platform,
        content,
        username: username.to_string(),
        image_url,
        timestamp,
    })
}

#[derive(Debug, Default)]
struct RawItem {
    guid: Option<String>,
    link: Option<String>,
    title: Option<String>,
    description: Option<String>,
    pub_date: Option<String>,
    enclosure: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Guid,
    Link,
    Title,
    Description,
    PubDate,
}

impl Field {
    fn from_tag(name: &[u8]) -> Option<Self> {
        match name {
            b"guid" => Some(Self::Guid),
            b"link" => Some(Self::Link),
            b"title" => Some(Self::Title),
            b"description" => Some(Self::Description),
            b"pubDate" => Some(Self::PubDate),
            _ => None,
        }
    }

    fn tag(self) -> &'static [u8] {
        match self {
            Self::Guid => b"guid",
            Self::Link => b"link",
            Self::Title => b"title",
            Self::Description => b"description",
            Self::PubDate => b"pubDate",
        }
    }
}

impl RawItem {
    fn slot(&mut self, field: Field) -> &mut Option<String> {
        match field {
            Field::Guid => &mut self.guid,
            Field::Link => &mut self.link,
            Field::Title => &mut self.title,
            Field::Description => &mut self.description,
            Field::PubDate => &mut self.pub_date,
        }
    }
}

/// Collect the fields of the first `<item>`. Returns `None` when the document
/// has no complete item or is not well-formed before the item closes.
fn read_first_item(xml: &str) -> Option<RawItem> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut item: Option<RawItem> = None;
    let mut field: Option<Field> = None;
    let mut text = String::new();

    loop {
        let event = match reader.read_event() {
            Ok(event) => event,
            Err(err) => {
                debug!(?err, position = reader.buffer_position(), "malformed feed");
                return None;
            }
        };
        match event {
            Event::Start(e) => {
                let name = e.name();
                if let Some(raw) = item.as_mut() {
                    if field.is_none() {
                        if name.as_ref() == b"enclosure" && raw.enclosure.is_none() {
                            raw.enclosure = attribute(&e, b"url");
                        }
                        field = Field::from_tag(name.as_ref());
                        text.clear();
                    }
                } else if name.as_ref() == b"item" {
                    item = Some(RawItem::default());
                }
            }
            Event::Empty(e) => {
                if let Some(raw) = item.as_mut() {
                    if e.name().as_ref() == b"enclosure" && raw.enclosure.is_none() {
                        raw.enclosure = attribute(&e, b"url");
                    }
                }
            }
            Event::Text(t) if field.is_some() => text.push_str(&decode_text(&t)),
            Event::CData(c) if field.is_some() => {
                text.push_str(&String::from_utf8_lossy(&c.into_inner()));
            }
            Event::End(e) => {
                let name = e.name();
                match (item.as_mut(), field) {
                    (Some(raw), Some(current)) if name.as_ref() == current.tag() => {
                        let slot = raw.slot(current);
                        if slot.is_none() {
                            *slot = Some(text.trim().to_string());
                        }
                        field = None;
                    }
                    (Some(_), None) if name.as_ref() == b"item" => break,
                    _ => {}
                }
            }
            Event::Eof => return None,
            _ => {}
        }
    }
    item
}

/// Visible text and first `<img src>` of an HTML fragment. Parsing is lenient:
/// it stops at the first construct quick-xml rejects and keeps what it has.
fn summarize_html(html: &str) -> (String, Option<String>) {
    let mut reader = Reader::from_str(html);
    reader.config_mut().check_end_names = false;

    let mut words: Vec<String> = Vec::new();
    let mut image = None;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.name().as_ref() == b"img" => {
                if image.is_none() {
                    image = attribute(&e, b"src");
                }
            }
            Ok(Event::Text(t)) => words.push(decode_text(&t).into_owned()),
            Ok(Event::CData(c)) => words.push(String::from_utf8_lossy(&c.into_inner()).into_owned()),
            Ok(Event::Eof) | Err(_) => break,
            Ok(_) => {}
        }
    }
    let summary = words
        .iter()
        .flat_map(|w| w.split_whitespace())
        .collect::<Vec<_>>()
        .join(" ");
    (summary, image)
}

/// Resolve numeric character references and named entities. Feeds embed HTML,
/// so the HTML5 entity table is used rather than the five XML ones.
fn decode_text<'a>(text: &'a BytesText<'_>) -> Cow<'a, str> {
    match text.unescape_with(resolve_html5_entity) {
        Ok(decoded) => decoded,
        Err(err) => {
            debug!(?err, "keeping undecodable text as is");
            String::from_utf8_lossy(text)
        }
    }
}

fn attribute(element: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    let attr = element.try_get_attribute(name).ok()??;
    attr.unescape_value().ok().map(Cow::into_owned)
}

/// Last path segment of a guid or link, without fragment or query.
fn id_from_reference(reference: &str) -> Option<String> {
    let without_suffix = reference.split(['#', '?']).next().unwrap_or(reference);
    without_suffix
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn canonical_url(platform: Platform, username: &str, id: &str) -> String {
    match platform {
        Platform::Twitter => format!("https://twitter.com/{username}/status/{id}"),
        Platform::Instagram => format!("https://www.instagram.com/p/{id}"),
    }
}
