//! Provider-quirks layer: per-vendor XML extraction, URL normalization, and
//! sync-token-invalidation heuristics, abstracted behind one capability set
//! so `CalDavClient` and `PullStrategy` never branch on provider identity
//! directly.

pub mod generic;
pub mod icloud;

use crate::calendar::model::{Account, AccountProvider};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuirksError {
    #[error("malformed multistatus response: {0}")]
    MalformedXml(String),
}

pub type QuirksResult<T> = Result<T, QuirksError>;

#[derive(Debug, Clone)]
pub struct ParsedCalendarEntry {
    pub href: String,
    pub display_name: String,
    pub ctag: Option<String>,
    pub supported_components: Vec<String>,
    pub color: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IcalItem {
    pub href: String,
    pub etag: Option<String>,
    pub ical_text: String,
}

#[derive(Debug, Clone, Default)]
pub struct ChangedItem {
    pub href: String,
    pub etag: Option<String>,
}

/// Collection names that carry no VEVENT data and must be filtered out of
/// `extractCalendars` (VTODO-only, reminders, inbox, outbox, notifications,
/// tasks).
const NON_EVENT_COLLECTION_HINTS: &[&str] = &[
    "inbox", "outbox", "notification", "task", "todo", "reminder",
];

/// The capability set every CalDAV server dialect implements, per
/// `spec.md` §4.3.
pub trait Quirks: Send + Sync {
    fn extract_principal_url(&self, xml: &str) -> QuirksResult<Option<String>>;
    fn extract_calendar_home_url(&self, xml: &str) -> QuirksResult<Option<String>>;
    fn extract_calendars(&self, xml: &str, base_host: &str) -> QuirksResult<Vec<ParsedCalendarEntry>>;
    fn extract_ical_data(&self, xml: &str) -> QuirksResult<Vec<IcalItem>>;
    fn extract_sync_token(&self, xml: &str) -> Option<String>;
    fn extract_ctag(&self, xml: &str) -> Option<String>;
    fn extract_deleted_hrefs(&self, xml: &str) -> Vec<String>;
    fn extract_changed_items(&self, xml: &str) -> Vec<ChangedItem>;
    fn build_calendar_url(&self, href: &str, base_host: &str) -> String;
    fn build_event_url(&self, href: &str, calendar_url: &str) -> String;
    fn is_sync_token_invalid(&self, status_code: u16, body: &str) -> bool;
    fn additional_headers(&self) -> Vec<(&'static str, String)>;
    fn format_date_for_query(&self, epoch_ms: i64) -> String;
    fn requires_app_specific_password(&self) -> bool;
    fn discovery_root(&self) -> Option<&str>;
}

/// Shared XML helpers used by every `Quirks` implementation. Namespace
/// prefixes vary across servers (`D:`, `d:`, `dav:`, unprefixed with a
/// default namespace) so extraction always matches on the local name.
pub(crate) mod xml_util {
    use quick_xml::events::Event as XmlEvent;
    use quick_xml::reader::Reader;

    /// Local name ignoring any namespace prefix, e.g. `"D:getctag"` -> `"getctag"`.
    pub fn local_name(qualified: &str) -> &str {
        qualified.rsplit(':').next().unwrap_or(qualified)
    }

    /// Walk every element (including self-closing ones) whose local name
    /// matches `target` and return the value of its `attr` attribute.
    /// `<C:comp name="VEVENT"/>` carries its payload this way rather than as
    /// text content, which `collect_text_by_local_name` cannot see.
    pub fn collect_attr_by_local_name(xml: &str, target: &str, attr: &str) -> Vec<String> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);
        let mut buf = Vec::new();
        let mut results = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(XmlEvent::Start(e)) | Ok(XmlEvent::Empty(e)) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    if local_name(&name) == target {
                        if let Some(value) = e
                            .attributes()
                            .with_checks(false)
                            .flatten()
                            .find(|a| local_name(&String::from_utf8_lossy(a.key.as_ref())) == attr)
                            .and_then(|a| a.unescape_value().ok())
                        {
                            results.push(value.into_owned());
                        }
                    }
                }
                Ok(XmlEvent::Eof) => break,
                Err(_) => break,
                _ => {}
            }
            buf.clear();
        }
        results
    }

    /// Walk every `<local_name>text</local_name>` occurrence and return the
    /// text content of each, namespace-agnostic.
    pub fn collect_text_by_local_name(xml: &str, target: &str) -> Vec<String> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);
        let mut buf = Vec::new();
        let mut results = Vec::new();
        let mut capturing = false;
        let mut current = String::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(XmlEvent::Start(e)) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    if local_name(&name) == target {
                        capturing = true;
                        current.clear();
                    }
                }
                Ok(XmlEvent::Text(t)) | Ok(XmlEvent::CData(t)) => {
                    if capturing {
                        if let Ok(text) = t.decode() {
                            current.push_str(&text);
                        }
                    }
                }
                Ok(XmlEvent::End(e)) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    if local_name(&name) == target && capturing {
                        results.push(current.clone());
                        capturing = false;
                    }
                }
                Ok(XmlEvent::Eof) => break,
                Err(_) => break,
                _ => {}
            }
            buf.clear();
        }
        results
    }

    /// Returns the text of the first `target`-named element nested anywhere
    /// inside the first `container`-named element, scanning the whole
    /// document with an explicit element stack (not whole-document substring
    /// containment, which would match an unrelated `<href>` sitting anywhere
    /// near the marker text). Used to pull the href out of
    /// `<current-user-principal>`/`<calendar-home-set>` specifically, since a
    /// PROPFIND response's `<response>` element carries other `<href>`s too.
    pub fn first_text_within_container(xml: &str, container: &str, target: &str) -> Option<String> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);
        let mut buf = Vec::new();
        let mut stack: Vec<String> = Vec::new();
        let mut capturing = false;
        let mut current = String::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(XmlEvent::Start(e)) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    let local = local_name(&name).to_string();
                    let inside_container = stack.iter().any(|s| s == container);
                    stack.push(local.clone());
                    if inside_container && local == target {
                        capturing = true;
                        current.clear();
                    }
                }
                Ok(XmlEvent::Text(t)) | Ok(XmlEvent::CData(t)) => {
                    if capturing {
                        if let Ok(text) = t.decode() {
                            current.push_str(&text);
                        }
                    }
                }
                Ok(XmlEvent::End(_)) => {
                    if capturing {
                        capturing = false;
                        let text = current.trim();
                        if !text.is_empty() {
                            return Some(text.to_string());
                        }
                    }
                    stack.pop();
                }
                Ok(XmlEvent::Eof) => break,
                Err(_) => break,
                _ => {}
            }
            buf.clear();
        }
        None
    }

    /// Split a multistatus document into each `<response>` element's raw
    /// inner XML, so callers can re-scan each response independently
    /// (needed for `extractICalData`/`extractChangedItems`, which must pair
    /// an `href` with its sibling `etag`/`calendar-data`).
    pub fn split_responses(xml: &str) -> Vec<String> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(false);
        let mut buf = Vec::new();
        let mut depth = 0i32;
        let mut current = String::new();
        let mut responses = Vec::new();
        let mut capturing = false;

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(XmlEvent::Start(e)) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    if local_name(&name) == "response" && depth == 0 {
                        capturing = true;
                        current.clear();
                    }
                    if capturing {
                        depth += 1;
                        current.push_str(&format!("<{}>", String::from_utf8_lossy(e.name().as_ref())));
                    }
                }
                Ok(XmlEvent::Empty(e)) => {
                    if capturing {
                        let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                        current.push_str(&format!("<{name}/>"));
                    }
                }
                Ok(XmlEvent::Text(t)) | Ok(XmlEvent::CData(t)) => {
                    if capturing {
                        if let Ok(text) = t.decode() {
                            current.push_str(&text);
                        }
                    }
                }
                Ok(XmlEvent::End(e)) => {
                    if capturing {
                        depth -= 1;
                        current.push_str(&format!("</{}>", String::from_utf8_lossy(e.name().as_ref())));
                        let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                        if local_name(&name) == "response" && depth == 0 {
                            responses.push(current.clone());
                            capturing = false;
                        }
                    }
                }
                Ok(XmlEvent::Eof) => break,
                Err(_) => break,
                _ => {}
            }
            buf.clear();
        }
        responses
    }
}

pub use generic::DefaultQuirks;
pub use icloud::ICloudQuirks;

/// Returns the adapter for the account's provider, or `None` for non-syncing
/// providers (`LOCAL`, `ICS`, `CONTACTS`).
pub struct ProviderRegistry;

impl ProviderRegistry {
    pub fn quirks_for_account(account: &Account) -> Option<Arc<dyn Quirks>> {
        match account.provider {
            AccountProvider::ICloud => Some(Arc::new(ICloudQuirks::new())),
            AccountProvider::CalDav => {
                let base = account
                    .home_set_url
                    .clone()
                    .or_else(|| account.principal_url.clone())
                    .unwrap_or_default();
                Some(Arc::new(DefaultQuirks::new(base)))
            }
            AccountProvider::Local | AccountProvider::Ics | AccountProvider::Contacts => None,
        }
    }

    pub fn is_non_event_collection(display_name: &str, supported_components: &[String]) -> bool {
        if !supported_components.is_empty()
            && supported_components.iter().any(|c| c.eq_ignore_ascii_case("VEVENT"))
        {
            return false;
        }
        let lowered = display_name.to_lowercase();
        NON_EVENT_COLLECTION_HINTS.iter().any(|hint| lowered.contains(hint))
            || (!supported_components.is_empty()
                && !supported_components.iter().any(|c| c.eq_ignore_ascii_case("VEVENT")))
    }
}
