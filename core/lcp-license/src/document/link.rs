//! Links shared by License and Status Documents.
//!
//! A link's `rel` may be a single string or an array of strings. Templated
//! links carry RFC 6570 expressions such as `{?id,name}` which are expanded
//! with URL-encoded parameters by [`Link::url`].

use crate::error::{LcpError, LcpResult};
use serde::{Deserialize, Deserializer, Serialize};
use url::Url;

/// Well-known link relations.
pub mod rel {
    pub const HINT: &str = "hint";
    pub const PUBLICATION: &str = "publication";
    pub const SELF: &str = "self";
    pub const SUPPORT: &str = "support";
    pub const STATUS: &str = "status";
    pub const LICENSE: &str = "license";
    pub const REGISTER: &str = "register";
    pub const RENEW: &str = "renew";
    pub const RETURN: &str = "return";
}

/// Media types the engine looks for on links.
pub mod media_type {
    pub const LCP_LICENSE: &str = "application/vnd.readium.lcp.license.v1.0+json";
    pub const LCP_STATUS: &str = "application/vnd.readium.license.status.v1.0+json";
    pub const HTML: &str = "text/html";
    pub const XHTML: &str = "application/xhtml+xml";
    pub const EPUB: &str = "application/epub+zip";
    pub const PDF: &str = "application/pdf";
    pub const LCP_PDF: &str = "application/pdf+lcp";
    pub const AUDIOBOOK: &str = "application/audiobook+zip";
    pub const LCP_AUDIOBOOK: &str = "application/audiobook+lcp";
}

/// A link to an external resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    /// Target URL, or URI template when `templated` is set.
    pub href: String,
    /// Relations of the link.
    #[serde(rename = "rel", deserialize_with = "one_or_many")]
    pub rels: Vec<String>,
    /// Expected media type of the target.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Whether `href` is a URI template.
    #[serde(default)]
    pub templated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    /// Content length in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    /// SHA-256 of the target, base64 or hex encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(rel) => vec![rel],
        OneOrMany::Many(rels) => rels,
    })
}

impl Link {
    /// Returns true if the link has the given relation.
    #[must_use]
    pub fn has_rel(&self, rel: &str) -> bool {
        self.rels.iter().any(|r| r == rel)
    }

    /// Returns true if the link's media type matches `expected`, ignoring
    /// parameters and case.
    #[must_use]
    pub fn has_media_type(&self, expected: &str) -> bool {
        self.media_type.as_deref().is_some_and(|mt| {
            let essence = mt.split(';').next().unwrap_or_default().trim();
            essence.eq_ignore_ascii_case(expected)
        })
    }

    /// Returns true if the target is an HTML page.
    #[must_use]
    pub fn is_html(&self) -> bool {
        self.has_media_type(media_type::HTML) || self.has_media_type(media_type::XHTML)
    }

    /// Returns the names of the template variables, in order of appearance.
    #[must_use]
    pub fn template_parameters(&self) -> Vec<String> {
        if !self.templated {
            return Vec::new();
        }
        expressions(&self.href)
            .flat_map(|expr| {
                expr.trim_start_matches(['?', '&', '+', '#', '/', ';', '.'])
                    .split(',')
                    .map(|name| name.trim().to_string())
                    .filter(|name| !name.is_empty())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Builds the target URL.
    ///
    /// Templated links are expanded with `params`, undefined variables are
    /// dropped. Plain links get `params` appended to their query.
    pub fn url(&self, params: &[(&str, &str)]) -> LcpResult<String> {
        let href = if self.templated {
            expand_template(&self.href, params)
        } else {
            self.href.clone()
        };

        let mut url = Url::parse(&href).map_err(|e| self.invalid(format!("{href}: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(self.invalid(format!("not an HTTP URL: {href}")));
        }
        if !self.templated && !params.is_empty() {
            let mut query = url.query_pairs_mut();
            for (name, value) in params {
                query.append_pair(name, value);
            }
        }
        Ok(url.into())
    }

    fn invalid(&self, reason: String) -> LcpError {
        LcpError::InvalidLink {
            rel: self.rels.join(" "),
            reason,
        }
    }
}

/// Iterates over the `{...}` expressions of a template.
fn expressions(template: &str) -> impl Iterator<Item = &str> {
    template
        .split('{')
        .skip(1)
        .filter_map(|part| part.split_once('}').map(|(expr, _)| expr))
}

fn lookup<'a>(params: &'a [(&str, &str)], name: &str) -> Option<&'a str> {
    params.iter().find(|(k, _)| *k == name).map(|(_, v)| *v)
}

fn expand_template(template: &str, params: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let Some(len) = rest[start..].find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let expr = &rest[start + 1..start + len];
        rest = &rest[start + len + 1..];

        let (prefix, names) = match expr.chars().next() {
            Some('?') => (Some('?'), &expr[1..]),
            Some('&') => (Some('&'), &expr[1..]),
            _ => (None, expr),
        };

        match prefix {
            Some(first) => {
                let pairs: Vec<String> = names
                    .split(',')
                    .filter_map(|name| {
                        let name = name.trim();
                        lookup(params, name)
                            .map(|value| format!("{name}={}", urlencoding::encode(value)))
                    })
                    .collect();
                if !pairs.is_empty() {
                    out.push(first);
                    out.push_str(&pairs.join("&"));
                }
            }
            None => {
                let values: Vec<String> = names
                    .split(',')
                    .filter_map(|name| lookup(params, name.trim()))
                    .map(|value| urlencoding::encode(value).into_owned())
                    .collect();
                out.push_str(&values.join(","));
            }
        }
    }

    out.push_str(rest);
    out
}

/// Finds the first link with `rel`, preferring one of `preferred_type` when
/// given.
pub(crate) fn find_link<'a>(
    links: &'a [Link],
    rel: &str,
    preferred_type: Option<&str>,
) -> Option<&'a Link> {
    let mut candidates = links.iter().filter(|l| l.has_rel(rel));
    match preferred_type {
        Some(mt) => links
            .iter()
            .find(|l| l.has_rel(rel) && l.has_media_type(mt))
            .or_else(|| candidates.next()),
        None => candidates.next(),
    }
}
