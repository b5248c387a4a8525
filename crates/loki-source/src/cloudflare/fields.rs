// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Logpull field sets.
//!
//! Each tier includes every field of the tier below it. `custom` contains only
//! the fields the user asks for.

use crate::cloudflare::CloudflareError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const DEFAULT_FIELDS: &[&str] = &[
    "ClientIP",
    "ClientRequestHost",
    "ClientRequestMethod",
    "ClientRequestURI",
    "EdgeEndTimestamp",
    "EdgeResponseBytes",
    "EdgeRequestHost",
    "EdgeResponseStatus",
    "EdgeStartTimestamp",
    "RayID",
];

const MINIMAL_FIELDS: &[&str] = &[
    "ZoneID",
    "ClientSSLProtocol",
    "ClientRequestProtocol",
    "ClientRequestPath",
    "ClientRequestUserAgent",
    "ClientRequestReferer",
    "EdgeColoCode",
    "ClientCountry",
    "CacheCacheStatus",
    "CacheResponseStatus",
    "EdgeResponseContentType",
];

const EXTENDED_FIELDS: &[&str] = &[
    "ClientSSLCipher",
    "ClientASN",
    "ClientIPClass",
    "CacheResponseBytes",
    "EdgePathingOp",
    "EdgePathingSrc",
    "EdgePathingStatus",
    "ParentRayID",
    "WorkerCPUTime",
    "WorkerStatus",
    "WorkerSubrequest",
    "WorkerSubrequestCount",
    "OriginIP",
    "OriginResponseStatus",
    "OriginSSLProtocol",
    "OriginResponseHTTPExpires",
    "OriginResponseHTTPLastModified",
];

const ALL_FIELDS: &[&str] = &[
    "BotScore",
    "BotScoreSrc",
    "BotTags",
    "ClientRequestBytes",
    "ClientSrcPort",
    "ClientXRequestedWith",
    "CacheTieredFill",
    "EdgeResponseCompressionRatio",
    "EdgeServerIP",
    "FirewallMatchesSources",
    "FirewallMatchesActions",
    "FirewallMatchesRuleIDs",
    "OriginResponseBytes",
    "OriginResponseTime",
    "ClientDeviceType",
    "WAFFlags",
    "WAFMatchedVar",
    "EdgeColoID",
    "RequestHeaders",
    "ResponseHeaders",
    "ClientRequestSource",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldsType {
    #[default]
    Default,
    Minimal,
    Extended,
    All,
    Custom,
}

impl FieldsType {
    fn tier(self) -> Vec<&'static str> {
        let layers: &[&[&str]] = match self {
            FieldsType::Default => &[DEFAULT_FIELDS],
            FieldsType::Minimal => &[DEFAULT_FIELDS, MINIMAL_FIELDS],
            FieldsType::Extended => &[DEFAULT_FIELDS, MINIMAL_FIELDS, EXTENDED_FIELDS],
            FieldsType::All => &[DEFAULT_FIELDS, MINIMAL_FIELDS, EXTENDED_FIELDS, ALL_FIELDS],
            FieldsType::Custom => &[],
        };
        layers.iter().flat_map(|layer| layer.iter().copied()).collect()
    }
}

impl FromStr for FieldsType {
    type Err = CloudflareError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" | "" => Ok(FieldsType::Default),
            "minimal" => Ok(FieldsType::Minimal),
            "extended" => Ok(FieldsType::Extended),
            "all" => Ok(FieldsType::All),
            "custom" => Ok(FieldsType::Custom),
            other => Err(CloudflareError::InvalidFieldsType(other.to_string())),
        }
    }
}

impl fmt::Display for FieldsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FieldsType::Default => "default",
            FieldsType::Minimal => "minimal",
            FieldsType::Extended => "extended",
            FieldsType::All => "all",
            FieldsType::Custom => "custom",
        })
    }
}

/// Fields to request for `fields_type` plus `additional`, sorted and without
/// duplicates.
pub fn fields_for_type(fields_type: FieldsType, additional: &[String]) -> Vec<String> {
    let mut fields: Vec<String> = fields_type
        .tier()
        .into_iter()
        .map(str::to_string)
        .chain(additional.iter().filter(|f| !f.is_empty()).cloned())
        .collect();
    fields.sort();
    fields.dedup();
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_tiers_are_nested() {
        let default = fields_for_type(FieldsType::Default, &[]);
        let minimal = fields_for_type(FieldsType::Minimal, &[]);
        let extended = fields_for_type(FieldsType::Extended, &[]);
        let all = fields_for_type(FieldsType::All, &[]);

        assert_eq!(default.len(), 10);
        assert_eq!(minimal.len(), 21);
        assert_eq!(extended.len(), 38);
        assert_eq!(all.len(), 59);
        for (lower, upper) in [(&default, &minimal), (&minimal, &extended), (&extended, &all)] {
            assert!(lower.iter().all(|f| upper.contains(f)));
        }
    }

    #[test]
    fn test_additional_fields_are_merged() {
        let fields = fields_for_type(
            FieldsType::Default,
            &["ZoneID".to_string(), "RayID".to_string(), "ClientIP".to_string()],
        );
        assert_eq!(fields.len(), 11);
        assert!(fields.contains(&"ZoneID".to_string()));
    }

    #[test]
    fn test_custom_is_exactly_additional() {
        let fields = fields_for_type(
            FieldsType::Custom,
            &["RayID".to_string(), "ClientIP".to_string(), "RayID".to_string()],
        );
        assert_eq!(fields, vec!["ClientIP", "RayID"]);
        assert!(fields_for_type(FieldsType::Custom, &[]).is_empty());
    }

    #[test]
    fn test_parse_fields_type() {
        assert_eq!("extended".parse::<FieldsType>().unwrap(), FieldsType::Extended);
        assert_eq!("".parse::<FieldsType>().unwrap(), FieldsType::Default);
        assert!(matches!(
            "everything".parse::<FieldsType>(),
            Err(CloudflareError::InvalidFieldsType(t)) if t == "everything"
        ));
        for t in [
            FieldsType::Default,
            FieldsType::Minimal,
            FieldsType::Extended,
            FieldsType::All,
            FieldsType::Custom,
        ] {
            assert_eq!(t.to_string().parse::<FieldsType>().unwrap(), t);
        }
    }

    fn fields_type() -> impl Strategy<Value = FieldsType> {
        prop_oneof![
            Just(FieldsType::Default),
            Just(FieldsType::Minimal),
            Just(FieldsType::Extended),
            Just(FieldsType::All),
            Just(FieldsType::Custom),
        ]
    }

    proptest! {
        #[test]
        fn prop_fields_sorted_and_unique(
            t in fields_type(),
            extra in proptest::collection::vec("[A-Z][a-zA-Z]{0,12}", 0..12),
        ) {
            let fields = fields_for_type(t, &extra);
            prop_assert!(fields.windows(2).all(|w| w[0] < w[1]));
            for f in &extra {
                prop_assert!(fields.contains(f));
            }
            if t == FieldsType::Custom {
                let mut expected = extra.clone();
                expected.sort();
                expected.dedup();
                prop_assert_eq!(fields, expected);
            }
        }
    }
}
