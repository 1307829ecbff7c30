//! Topic parsing, encoding and filter matching
//!
//! Cloud topics follow `[<ctrl>/]<account>/<client>/<appId>[/<subTopic...>]`.
//! Outbound topics carry the account and client placeholders from the
//! connection options; the transport substitutes them before the broker sees them.

use crate::config::ConnectionOptions;
use std::fmt;

/// Sub-topic segment that marks a response to a control request
pub const REPLY_SEGMENT: &str = "REPLY";

/// Parsed view of a cloud topic
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Topic {
    pub full: String,
    pub prefix: Option<String>,
    pub account: String,
    pub client: String,
    pub app_id: String,
    pub sub_topic: String,
    pub request_id: Option<String>,
}

impl Topic {
    /// Split a topic into its segments. Never fails: missing levels are left empty.
    pub fn parse(full: &str, options: &ConnectionOptions) -> Self {
        let sep = options.topic_separator.as_str();
        let mut topic = Topic {
            full: full.to_string(),
            ..Default::default()
        };
        if full.is_empty() || full == options.topic_wildcard {
            return topic;
        }

        let mut rest = full;

        let first_is_prefix = rest
            .split(sep)
            .next()
            .is_some_and(|first| first == options.control_prefix || first.starts_with('$'));
        if first_is_prefix {
            topic.prefix = next_level(&mut rest, sep);
        }
        topic.account = next_level(&mut rest, sep).unwrap_or_default();
        topic.client = next_level(&mut rest, sep).unwrap_or_default();
        topic.app_id = next_level(&mut rest, sep).unwrap_or_default();
        topic.sub_topic = rest.to_string();

        if topic.is_control(options) {
            let segments: Vec<&str> = topic.sub_topic.split(sep).collect();
            if segments.len() >= 2 {
                topic.request_id = segments.last().map(|s| s.to_string());
            }
        }

        topic
    }

    /// True when the topic carries the configured control prefix
    pub fn is_control(&self, options: &ConnectionOptions) -> bool {
        self.prefix.as_deref() == Some(options.control_prefix.as_str())
    }

    /// True for `<appId>/REPLY/...` sub-topics, which are responses rather than requests
    pub fn is_reply(&self, options: &ConnectionOptions) -> bool {
        self.sub_topic
            .split(options.topic_separator.as_str())
            .next()
            .is_some_and(|first| first == REPLY_SEGMENT)
    }

    /// Request method named by the first sub-topic segment
    pub fn request_method(&self, options: &ConnectionOptions) -> Option<RequestMethod> {
        self.sub_topic
            .split(options.topic_separator.as_str())
            .next()
            .and_then(RequestMethod::parse)
    }

    /// Sub-topic segments after the method, without the trailing request id
    pub fn resource(&self, options: &ConnectionOptions) -> Vec<String> {
        let mut segments: Vec<String> = self
            .sub_topic
            .split(options.topic_separator.as_str())
            .skip(1)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if self.request_id.is_some() {
            segments.pop();
        }
        segments
    }
}

fn next_level(rest: &mut &str, sep: &str) -> Option<String> {
    let current: &str = *rest;
    if current.is_empty() {
        return None;
    }
    match current.split_once(sep) {
        Some((head, tail)) => {
            let level = head.to_string();
            *rest = tail;
            Some(level)
        }
        None => {
            let level = current.to_string();
            *rest = "";
            Some(level)
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

/// Method carried by a control request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMethod {
    Get,
    Put,
    Post,
    Del,
    Exec,
}

impl RequestMethod {
    pub fn parse(segment: &str) -> Option<Self> {
        match segment {
            "GET" => Some(RequestMethod::Get),
            "PUT" => Some(RequestMethod::Put),
            "POST" => Some(RequestMethod::Post),
            "DEL" => Some(RequestMethod::Del),
            "EXEC" => Some(RequestMethod::Exec),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestMethod::Get => "GET",
            RequestMethod::Put => "PUT",
            RequestMethod::Post => "POST",
            RequestMethod::Del => "DEL",
            RequestMethod::Exec => "EXEC",
        }
    }
}

/// Build an outbound topic.
///
/// `device_id` defaults to the client id placeholder; replies pass the
/// requester's client id instead.
pub fn encode_topic(
    options: &ConnectionOptions,
    device_id: Option<&str>,
    app_id: &str,
    app_topic: &str,
    control: bool,
) -> String {
    let sep = options.topic_separator.as_str();
    let mut topic = String::new();
    if control {
        topic.push_str(&options.control_prefix);
        topic.push_str(sep);
    }
    topic.push_str(&options.account_token);
    topic.push_str(sep);
    topic.push_str(device_id.unwrap_or(&options.client_id_token));
    topic.push_str(sep);
    topic.push_str(app_id);
    if !app_topic.is_empty() {
        topic.push_str(sep);
        topic.push_str(app_topic);
    }
    topic
}

/// `<ctrl>/<account>/<client>/#`, the device-wide control subscription
pub fn default_subscription(options: &ConnectionOptions) -> String {
    let sep = options.topic_separator.as_str();
    [
        options.control_prefix.as_str(),
        options.account_token.as_str(),
        options.client_id_token.as_str(),
        options.topic_wildcard.as_str(),
    ]
    .join(sep)
}

/// Replace the account and client placeholders with single-level wildcards so a
/// registered filter can be matched against concrete inbound topics.
pub fn localize_filter(options: &ConnectionOptions, filter: &str) -> String {
    filter
        .split(options.topic_separator.as_str())
        .map(|level| {
            if level == options.account_token || level == options.client_id_token {
                "+"
            } else {
                level
            }
        })
        .collect::<Vec<_>>()
        .join(&options.topic_separator)
}

/// Broker filter matching: `+` matches one level, the configured multi-level
/// wildcard the remainder (including the parent level itself).
pub fn topic_matches(filter: &str, topic: &str, options: &ConnectionOptions) -> bool {
    let separator = options.topic_separator.as_str();
    let remainder = options.topic_wildcard.as_str();
    let mut filter_levels = filter.split(separator);
    let mut topic_levels = topic.split(separator);

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some(f), _) if f == remainder => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn options() -> ConnectionOptions {
        ConnectionOptions::default()
    }

    #[test]
    fn test_parse_control_topic() {
        let topic = Topic::parse("$EDC/acme/gw-01/CONF-V1/GET/configurations/req-17", &options());

        assert_eq!(topic.prefix.as_deref(), Some("$EDC"));
        assert_eq!(topic.account, "acme");
        assert_eq!(topic.client, "gw-01");
        assert_eq!(topic.app_id, "CONF-V1");
        assert_eq!(topic.sub_topic, "GET/configurations/req-17");
        assert_eq!(topic.request_id.as_deref(), Some("req-17"));
        assert!(topic.is_control(&options()));
        assert_eq!(topic.request_method(&options()), Some(RequestMethod::Get));
        assert_eq!(topic.resource(&options()), vec!["configurations".to_string()]);
    }

    #[test]
    fn test_parse_data_topic() {
        let topic = Topic::parse("acme/gw-01/heater/data/temperature", &options());

        assert_eq!(topic.prefix, None);
        assert_eq!(topic.account, "acme");
        assert_eq!(topic.client, "gw-01");
        assert_eq!(topic.app_id, "heater");
        assert_eq!(topic.sub_topic, "data/temperature");
        assert_eq!(topic.request_id, None);
        assert!(!topic.is_control(&options()));
    }

    #[test]
    fn test_parse_short_topics() {
        let topic = Topic::parse("acme/gw-01", &options());
        assert_eq!(topic.account, "acme");
        assert_eq!(topic.client, "gw-01");
        assert_eq!(topic.app_id, "");
        assert_eq!(topic.sub_topic, "");

        let topic = Topic::parse("$EDC", &options());
        assert_eq!(topic.prefix.as_deref(), Some("$EDC"));
        assert_eq!(topic.account, "");

        let topic = Topic::parse("", &options());
        assert_eq!(topic, Topic::default());

        let topic = Topic::parse("#", &options());
        assert_eq!(topic.account, "");
    }

    #[test]
    fn test_request_id_needs_two_sub_topic_segments() {
        let topic = Topic::parse("$EDC/acme/gw-01/CONF-V1/GET", &options());
        assert_eq!(topic.request_id, None);
        assert_eq!(topic.request_method(&options()), Some(RequestMethod::Get));
    }

    #[test]
    fn test_reply_detection() {
        let topic = Topic::parse("$EDC/acme/gw-01/CONF-V1/REPLY/req-17", &options());
        assert!(topic.is_reply(&options()));

        let topic = Topic::parse("$EDC/acme/gw-01/CONF-V1/GET/REPLY", &options());
        assert!(!topic.is_reply(&options()));
    }

    #[test]
    fn test_encode_topic() {
        let opts = options();
        assert_eq!(
            encode_topic(&opts, None, "heater", "data", false),
            "#account-name/#client-id/heater/data"
        );
        assert_eq!(
            encode_topic(&opts, None, "MQTT", "BIRTH", true),
            "$EDC/#account-name/#client-id/MQTT/BIRTH"
        );
        assert_eq!(
            encode_topic(&opts, Some("console-7"), "CONF-V1", "REPLY/req-17", true),
            "$EDC/#account-name/console-7/CONF-V1/REPLY/req-17"
        );
        assert_eq!(
            encode_topic(&opts, None, "heater", "", false),
            "#account-name/#client-id/heater"
        );
    }

    #[test]
    fn test_default_subscription() {
        assert_eq!(
            default_subscription(&options()),
            "$EDC/#account-name/#client-id/#"
        );
    }

    #[test]
    fn test_localize_filter() {
        assert_eq!(
            localize_filter(&options(), "$EDC/#account-name/#client-id/#"),
            "$EDC/+/+/#"
        );
        assert_eq!(localize_filter(&options(), "a/b/c"), "a/b/c");
    }

    #[test]
    fn test_custom_multi_level_wildcard() {
        let opts = ConnectionOptions {
            topic_wildcard: "*".to_string(),
            ..Default::default()
        };

        assert!(topic_matches("a/*", "a/b/c", &opts));
        assert!(topic_matches(
            &default_subscription(&opts),
            "$EDC/#account-name/#client-id/X/Y",
            &opts
        ));
        assert!(!topic_matches("a/#", "a/b/c", &opts));
    }

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("a/b/c", "a/b/c", &options()));
        assert!(topic_matches("a/+/c", "a/b/c", &options()));
        assert!(topic_matches("a/#", "a/b/c", &options()));
        assert!(topic_matches("a/#", "a", &options()));
        assert!(topic_matches("#", "a/b", &options()));
        assert!(topic_matches("$EDC/+/+/#", "$EDC/acme/gw-01/CONF-V1/GET", &options()));

        assert!(!topic_matches("a/+/c", "a/b/d", &options()));
        assert!(!topic_matches("a/+", "a/b/c", &options()));
        assert!(!topic_matches("a/b", "a", &options()));
        assert!(!topic_matches("a/#/c", "a/b/c", &options()));
    }

    proptest! {
        #[test]
        fn exact_filter_matches_itself(topic in "[a-z0-9]{1,8}(/[a-z0-9]{1,8}){0,5}") {
            prop_assert!(topic_matches(&topic, &topic, &options()));
        }

        #[test]
        fn hash_matches_everything(topic in "[a-z0-9]{1,8}(/[a-z0-9]{1,8}){0,5}") {
            prop_assert!(topic_matches("#", &topic, &options()));
        }

        #[test]
        fn plus_replaces_any_single_level(
            levels in proptest::collection::vec("[a-z0-9]{1,8}", 1..6),
            index in 0usize..6,
        ) {
            let index = index % levels.len();
            let topic = levels.join("/");
            let mut filter_levels = levels.clone();
            filter_levels[index] = "+".to_string();
            prop_assert!(topic_matches(&filter_levels.join("/"), &topic, &options()));
        }

        #[test]
        fn parse_never_panics_and_keeps_full_topic(topic in ".*") {
            let parsed = Topic::parse(&topic, &ConnectionOptions::default());
            prop_assert_eq!(parsed.full, topic);
        }

        #[test]
        fn encoded_topics_parse_back(
            app_id in "[A-Z][A-Z0-9-]{0,10}",
            app_topic in "[a-z]{1,6}(/[a-z]{1,6}){0,3}",
        ) {
            let opts = ConnectionOptions::default();
            let parsed = Topic::parse(&encode_topic(&opts, None, &app_id, &app_topic, true), &opts);
            prop_assert_eq!(parsed.account, opts.account_token.clone());
            prop_assert_eq!(parsed.client, opts.client_id_token.clone());
            prop_assert_eq!(parsed.app_id, app_id);
            prop_assert_eq!(parsed.sub_topic, app_topic);
        }
    }
}
