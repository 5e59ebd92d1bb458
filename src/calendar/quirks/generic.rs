//! `DefaultQuirks`: the namespace-agnostic adapter covering Nextcloud,
//! Baikal, Radicale, SOGo, FastMail, Zoho, and plain RFC-4791 servers. These
//! vendors differ only in namespace-prefix choice and calendar-collection
//! filtering heuristics, both handled generically here rather than by one
//! struct per vendor.

use super::xml_util::{
    collect_attr_by_local_name, collect_text_by_local_name, first_text_within_container,
    split_responses,
};
use super::{ChangedItem, IcalItem, ParsedCalendarEntry, ProviderRegistry, Quirks, QuirksResult};
use chrono::{DateTime, Utc};

pub struct DefaultQuirks {
    base_host: String,
}

impl DefaultQuirks {
    pub fn new(base_host: String) -> Self {
        Self { base_host }
    }
}

impl Quirks for DefaultQuirks {
    fn extract_principal_url(&self, xml: &str) -> QuirksResult<Option<String>> {
        Ok(first_text_within_container(xml, "current-user-principal", "href"))
    }

    fn extract_calendar_home_url(&self, xml: &str) -> QuirksResult<Option<String>> {
        Ok(first_text_within_container(xml, "calendar-home-set", "href"))
    }

    fn extract_calendars(&self, xml: &str, base_host: &str) -> QuirksResult<Vec<ParsedCalendarEntry>> {
        let mut calendars = Vec::new();
        for response in split_responses(xml) {
            if !response.contains("VEVENT") && !response.contains("resourcetype") {
                continue;
            }
            let href = collect_text_by_local_name(&response, "href")
                .into_iter()
                .next()
                .unwrap_or_default();
            if href.is_empty() {
                continue;
            }
            let display_name = collect_text_by_local_name(&response, "displayname")
                .into_iter()
                .next()
                .unwrap_or_else(|| href.clone());
            let ctag = collect_text_by_local_name(&response, "getctag").into_iter().next();
            let supported_components = collect_attr_by_local_name(&response, "comp", "name");
            let color = collect_text_by_local_name(&response, "calendar-color")
                .into_iter()
                .next();

            if !response.contains("calendar") {
                continue;
            }
            if ProviderRegistry::is_non_event_collection(&display_name, &supported_components) {
                continue;
            }

            calendars.push(ParsedCalendarEntry {
                href: self.build_calendar_url(&href, base_host),
                display_name,
                ctag,
                supported_components,
                color,
            });
        }
        Ok(calendars)
    }

    fn extract_ical_data(&self, xml: &str) -> QuirksResult<Vec<IcalItem>> {
        let mut items = Vec::new();
        for response in split_responses(xml) {
            let href = collect_text_by_local_name(&response, "href")
                .into_iter()
                .next()
                .unwrap_or_default();
            if href.is_empty() {
                continue;
            }
            let etag = collect_text_by_local_name(&response, "getetag").into_iter().next();
            let ical_text = collect_text_by_local_name(&response, "calendar-data")
                .into_iter()
                .next()
                .unwrap_or_default();
            if ical_text.is_empty() {
                continue;
            }
            items.push(IcalItem { href, etag, ical_text });
        }
        Ok(items)
    }

    fn extract_sync_token(&self, xml: &str) -> Option<String> {
        collect_text_by_local_name(xml, "sync-token").into_iter().next()
    }

    fn extract_ctag(&self, xml: &str) -> Option<String> {
        collect_text_by_local_name(xml, "getctag").into_iter().next()
    }

    fn extract_deleted_hrefs(&self, xml: &str) -> Vec<String> {
        split_responses(xml)
            .into_iter()
            .filter(|r| r.contains("404"))
            .filter_map(|r| collect_text_by_local_name(&r, "href").into_iter().next())
            .collect()
    }

    fn extract_changed_items(&self, xml: &str) -> Vec<ChangedItem> {
        split_responses(xml)
            .into_iter()
            .filter(|r| !r.contains("404"))
            .filter_map(|r| {
                let href = collect_text_by_local_name(&r, "href").into_iter().next()?;
                let etag = collect_text_by_local_name(&r, "getetag").into_iter().next();
                Some(ChangedItem { href, etag })
            })
            .collect()
    }

    fn build_calendar_url(&self, href: &str, base_host: &str) -> String {
        normalize_url(href, base_host)
    }

    fn build_event_url(&self, href: &str, calendar_url: &str) -> String {
        normalize_url(href, calendar_url)
    }

    fn is_sync_token_invalid(&self, status_code: u16, body: &str) -> bool {
        status_code == 410 || body.contains("valid-sync-token")
    }

    fn additional_headers(&self) -> Vec<(&'static str, String)> {
        vec![("User-Agent", "caldav-sync-core/1.0".to_string())]
    }

    fn format_date_for_query(&self, epoch_ms: i64) -> String {
        DateTime::<Utc>::from_timestamp_millis(epoch_ms)
            .unwrap_or_default()
            .format("%Y%m%dT000000Z")
            .to_string()
    }

    fn requires_app_specific_password(&self) -> bool {
        false
    }

    fn discovery_root(&self) -> Option<&str> {
        Some(&self.base_host)
    }
}

/// Normalize a possibly-relative `href` against a base, deduplicating
/// slashes while preserving scheme.
pub(crate) fn normalize_url(href: &str, base: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return dedup_slashes(href);
    }
    let base = base.trim_end_matches('/');
    if let Ok(parsed_base) = url::Url::parse(base) {
        if let Ok(joined) = parsed_base.join(href) {
            return dedup_slashes(joined.as_str());
        }
    }
    dedup_slashes(&format!("{base}/{}", href.trim_start_matches('/')))
}

fn dedup_slashes(url: &str) -> String {
    if let Some(idx) = url.find("://") {
        let (scheme, rest) = url.split_at(idx + 3);
        let mut out = String::from(scheme);
        let mut last_was_slash = false;
        for ch in rest.chars() {
            if ch == '/' {
                if last_was_slash {
                    continue;
                }
                last_was_slash = true;
            } else {
                last_was_slash = false;
            }
            out.push(ch);
        }
        out
    } else {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_ctag_regardless_of_namespace_prefix() {
        let quirks = DefaultQuirks::new("https://dav.example.com".to_string());
        let xml = r#"<?xml version="1.0"?>
<d:multistatus xmlns:d="DAV:" xmlns:cs="http://calendarserver.org/ns/">
  <d:response>
    <d:href>/cal/</d:href>
    <d:propstat><d:prop><cs:getctag>"abc123"</cs:getctag></d:prop></d:propstat>
  </d:response>
</d:multistatus>"#;
        assert_eq!(quirks.extract_ctag(xml), Some("\"abc123\"".to_string()));
    }

    fn multistatus_calendar_list(comp: &str, name: &str) -> String {
        format!(
            r#"<?xml version="1.0"?>
<D:multistatus xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav" xmlns:CS="http://calendarserver.org/ns/">
  <D:response>
    <D:href>/cal/{name}/</D:href>
    <D:propstat><D:prop>
      <D:resourcetype><D:collection/><C:calendar/></D:resourcetype>
      <D:displayname>{name}</D:displayname>
      <CS:getctag>"ctag-1"</CS:getctag>
      <C:supported-calendar-component-set><C:comp name="{comp}"/></C:supported-calendar-component-set>
    </D:prop></D:propstat>
  </D:response>
</D:multistatus>"#
        )
    }

    #[test]
    fn filters_out_vtodo_only_collections() {
        let quirks = DefaultQuirks::new("https://dav.example.com".to_string());
        let xml = multistatus_calendar_list("VTODO", "tasks");
        let calendars = quirks.extract_calendars(&xml, "https://dav.example.com").unwrap();
        assert!(calendars.is_empty());
    }

    #[test]
    fn build_calendar_url_dedups_slashes() {
        let quirks = DefaultQuirks::new("https://dav.example.com/".to_string());
        let url = quirks.build_calendar_url("//cal//personal/", "https://dav.example.com/");
        assert_eq!(url, "https://dav.example.com/cal/personal/");
    }

    #[test]
    fn bare_403_is_not_sync_token_invalid() {
        let quirks = DefaultQuirks::new("https://dav.example.com".to_string());
        assert!(!quirks.is_sync_token_invalid(403, "Forbidden"));
        assert!(quirks.is_sync_token_invalid(410, ""));
        assert!(quirks.is_sync_token_invalid(403, "valid-sync-token"));
    }

    /// A real discovery response carries the requested `<href>` alongside
    /// several others (the response's own resource href, sibling props) — the
    /// extraction must pick the one actually nested inside
    /// `current-user-principal`/`calendar-home-set`, not the first href in
    /// document order.
    #[test]
    fn principal_and_home_set_hrefs_are_picked_from_their_own_element_not_the_first_href() {
        let quirks = DefaultQuirks::new("https://dav.example.com".to_string());
        let xml = r#"<?xml version="1.0"?>
<D:multistatus xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <D:response>
    <D:href>/principals/users/alice/</D:href>
    <D:propstat><D:prop>
      <D:current-user-principal><D:href>/principals/users/alice/</D:href></D:current-user-principal>
      <C:calendar-home-set><D:href>/calendars/alice/</D:href></C:calendar-home-set>
    </D:prop></D:propstat>
  </D:response>
</D:multistatus>"#;
        assert_eq!(
            quirks.extract_principal_url(xml).unwrap(),
            Some("/principals/users/alice/".to_string())
        );
        assert_eq!(
            quirks.extract_calendar_home_url(xml).unwrap(),
            Some("/calendars/alice/".to_string())
        );
    }

    #[test]
    fn principal_url_ignores_unrelated_hrefs_preceding_it() {
        let quirks = DefaultQuirks::new("https://dav.example.com".to_string());
        let xml = r#"<?xml version="1.0"?>
<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>/some/unrelated/resource/</D:href>
    <D:propstat><D:prop>
      <D:displayname>decoy</D:displayname>
    </D:prop></D:propstat>
  </D:response>
  <D:response>
    <D:href>/principals/users/alice/</D:href>
    <D:propstat><D:prop>
      <D:current-user-principal><D:href>/principals/users/alice/</D:href></D:current-user-principal>
    </D:prop></D:propstat>
  </D:response>
</D:multistatus>"#;
        assert_eq!(
            quirks.extract_principal_url(xml).unwrap(),
            Some("/principals/users/alice/".to_string())
        );
    }
}
