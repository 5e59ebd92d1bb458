//! `ICloudQuirks`: hard-codes the `https://caldav.icloud.com` discovery
//! root and iCloud's app-specific-password requirement. Grounded in
//! `other_examples/…common-src-calendar-icloud.rs.rs`'s principal-discovery
//! PROPFIND against the same root.

use super::generic::normalize_url;
use super::xml_util::{
    collect_attr_by_local_name, collect_text_by_local_name, first_text_within_container,
    split_responses,
};
use super::{ChangedItem, IcalItem, ParsedCalendarEntry, ProviderRegistry, Quirks, QuirksResult};
use chrono::{DateTime, Utc};

const ICLOUD_ROOT: &str = "https://caldav.icloud.com";

pub struct ICloudQuirks;

impl ICloudQuirks {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ICloudQuirks {
    fn default() -> Self {
        Self::new()
    }
}

impl Quirks for ICloudQuirks {
    fn extract_principal_url(&self, xml: &str) -> QuirksResult<Option<String>> {
        Ok(first_text_within_container(xml, "current-user-principal", "href"))
    }

    fn extract_calendar_home_url(&self, xml: &str) -> QuirksResult<Option<String>> {
        Ok(first_text_within_container(xml, "calendar-home-set", "href"))
    }

    fn extract_calendars(&self, xml: &str, base_host: &str) -> QuirksResult<Vec<ParsedCalendarEntry>> {
        let mut calendars = Vec::new();
        for response in split_responses(xml) {
            let href = collect_text_by_local_name(&response, "href")
                .into_iter()
                .next()
                .unwrap_or_default();
            if href.is_empty() || !response.contains("calendar") {
                continue;
            }
            let display_name = collect_text_by_local_name(&response, "displayname")
                .into_iter()
                .next()
                .unwrap_or_else(|| href.clone());
            let supported_components = collect_attr_by_local_name(&response, "comp", "name");
            if ProviderRegistry::is_non_event_collection(&display_name, &supported_components) {
                continue;
            }
            // iCloud publishes scheduling inbox/outbox collections that
            // never carry a displayname matching our generic hint list.
            if href.contains("/inbox/") || href.contains("/outbox/") || href.contains("/notification/") {
                continue;
            }
            calendars.push(ParsedCalendarEntry {
                href: self.build_calendar_url(&href, base_host),
                display_name,
                ctag: collect_text_by_local_name(&response, "getctag").into_iter().next(),
                supported_components,
                color: collect_text_by_local_name(&response, "calendar-color").into_iter().next(),
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
            let ical_text = collect_text_by_local_name(&response, "calendar-data")
                .into_iter()
                .next()
                .unwrap_or_default();
            if href.is_empty() || ical_text.is_empty() {
                continue;
            }
            items.push(IcalItem {
                href,
                etag: collect_text_by_local_name(&response, "getetag").into_iter().next(),
                ical_text,
            });
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
                Some(ChangedItem {
                    href,
                    etag: collect_text_by_local_name(&r, "getetag").into_iter().next(),
                })
            })
            .collect()
    }

    fn build_calendar_url(&self, href: &str, _base_host: &str) -> String {
        normalize_url(href, ICLOUD_ROOT)
    }

    fn build_event_url(&self, href: &str, calendar_url: &str) -> String {
        normalize_url(href, calendar_url)
    }

    fn is_sync_token_invalid(&self, status_code: u16, body: &str) -> bool {
        status_code == 410 || body.contains("valid-sync-token")
    }

    fn additional_headers(&self) -> Vec<(&'static str, String)> {
        vec![("User-Agent", "caldav-sync-core/1.0 (+iCloud)".to_string())]
    }

    fn format_date_for_query(&self, epoch_ms: i64) -> String {
        DateTime::<Utc>::from_timestamp_millis(epoch_ms)
            .unwrap_or_default()
            .format("%Y%m%dT000000Z")
            .to_string()
    }

    fn requires_app_specific_password(&self) -> bool {
        true
    }

    fn discovery_root(&self) -> Option<&str> {
        Some(ICLOUD_ROOT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_root_is_hardcoded() {
        let quirks = ICloudQuirks::new();
        assert_eq!(quirks.discovery_root(), Some(ICLOUD_ROOT));
    }

    #[test]
    fn requires_app_specific_password() {
        assert!(ICloudQuirks::new().requires_app_specific_password());
    }

    #[test]
    fn scheduling_inbox_is_filtered_out() {
        let quirks = ICloudQuirks::new();
        let xml = r#"<?xml version="1.0"?>
<D:multistatus xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <D:response>
    <D:href>/123/calendars/inbox/</D:href>
    <D:propstat><D:prop>
      <D:resourcetype><D:collection/><C:schedule-inbox/></D:resourcetype>
      <D:displayname>inbox</D:displayname>
    </D:prop></D:propstat>
  </D:response>
  <D:response>
    <D:href>/123/calendars/home/</D:href>
    <D:propstat><D:prop>
      <D:resourcetype><D:collection/><C:calendar/></D:resourcetype>
      <D:displayname>Home</D:displayname>
      <C:supported-calendar-component-set><C:comp name="VEVENT"/></C:supported-calendar-component-set>
    </D:prop></D:propstat>
  </D:response>
</D:multistatus>"#;
        let calendars = quirks.extract_calendars(xml, ICLOUD_ROOT).unwrap();
        assert_eq!(calendars.len(), 1);
        assert_eq!(calendars[0].display_name, "Home");
    }

    #[test]
    fn principal_href_is_scoped_to_its_own_element() {
        let quirks = ICloudQuirks::new();
        let xml = r#"<?xml version="1.0"?>
<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>/123/principal/</D:href>
    <D:propstat><D:prop>
      <D:current-user-principal><D:href>/123/principal/</D:href></D:current-user-principal>
    </D:prop></D:propstat>
  </D:response>
</D:multistatus>"#;
        assert_eq!(
            quirks.extract_principal_url(xml).unwrap(),
            Some("/123/principal/".to_string())
        );
    }
}
