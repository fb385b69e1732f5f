//! Request modifier chain
//!
//! Filters and rewrites applied to captured requests before fan-out:
//! method allowlists, URL and header regex filters, basic-auth filtering,
//! header/URL rewrites with capture groups, header/param injection and
//! consistent FNV-1a hash limiters. A request the chain rejects returns
//! `None` and is remembered by the emitter so its responses are dropped
//! too.

use crate::config::ModifierSettings;
use crate::error::{ReflowError, Result};
use crate::payload::fnv1a32;
use crate::proto;
use base64::Engine;
use regex::bytes::Regex;

#[derive(Debug)]
pub struct HeaderFilter {
    pub name: Vec<u8>,
    pub regex: Regex,
}

#[derive(Debug)]
pub struct HeaderRewrite {
    pub name: Vec<u8>,
    pub regex: Regex,
    pub replacement: Vec<u8>,
}

#[derive(Debug)]
pub struct UrlRewrite {
    pub regex: Regex,
    pub replacement: Vec<u8>,
}

#[derive(Debug)]
pub struct HashFilter {
    pub name: Vec<u8>,
    pub percent: u32,
}

/// Compiled modifier configuration
#[derive(Debug, Default)]
pub struct ModifierConfig {
    methods: Vec<Vec<u8>>,
    url_allow: Vec<Regex>,
    url_disallow: Vec<Regex>,
    header_filters: Vec<HeaderFilter>,
    header_negative_filters: Vec<HeaderFilter>,
    basic_auth_filters: Vec<Regex>,
    header_rewrites: Vec<HeaderRewrite>,
    url_rewrites: Vec<UrlRewrite>,
    headers: Vec<(Vec<u8>, Vec<u8>)>,
    params: Vec<(Vec<u8>, Vec<u8>)>,
    header_hash_filters: Vec<HashFilter>,
    param_hash_filters: Vec<HashFilter>,
}

fn compile(pattern: &str, flag: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| ReflowError::config(flag, format!("invalid regexp {:?}: {}", pattern, e)))
}

/// Parse `name:rest` around the first colon
fn split_named<'a>(raw: &'a str, flag: &str) -> Result<(&'a str, &'a str)> {
    match raw.split_once(':') {
        Some((name, rest)) => Ok((name.trim(), rest.trim())),
        None => Err(ReflowError::config(
            flag,
            format!("expected `name:value`, got {:?}", raw),
        )),
    }
}

fn parse_hash_filter(raw: &str, flag: &str) -> Result<HashFilter> {
    let (name, value) = split_named(raw, flag)?;
    let percent = value
        .trim_end_matches('%')
        .parse::<u32>()
        .map_err(|_| ReflowError::config(flag, format!("invalid percentage {:?}", value)))?;
    Ok(HashFilter {
        name: name.as_bytes().to_vec(),
        percent: percent.min(100),
    })
}

impl ModifierConfig {
    /// Compile raw CLI settings; invalid expressions are fatal at startup
    pub fn from_settings(settings: &ModifierSettings) -> Result<Self> {
        let mut config = ModifierConfig {
            methods: settings
                .allow_methods
                .iter()
                .map(|m| m.to_ascii_uppercase().into_bytes())
                .collect(),
            ..Default::default()
        };

        for raw in &settings.allow_url {
            config.url_allow.push(compile(raw, "http-allow-url")?);
        }
        for raw in &settings.disallow_url {
            config.url_disallow.push(compile(raw, "http-disallow-url")?);
        }
        for raw in &settings.allow_header {
            let (name, pattern) = split_named(raw, "http-allow-header")?;
            config.header_filters.push(HeaderFilter {
                name: name.as_bytes().to_vec(),
                regex: compile(pattern, "http-allow-header")?,
            });
        }
        for raw in &settings.disallow_header {
            let (name, pattern) = split_named(raw, "http-disallow-header")?;
            config.header_negative_filters.push(HeaderFilter {
                name: name.as_bytes().to_vec(),
                regex: compile(pattern, "http-disallow-header")?,
            });
        }
        for raw in &settings.basic_auth_filter {
            config
                .basic_auth_filters
                .push(compile(raw, "http-basic-auth-filter")?);
        }
        for raw in &settings.rewrite_header {
            let (name, rest) = split_named(raw, "http-rewrite-header")?;
            let (pattern, replacement) = rest.split_once(',').ok_or_else(|| {
                ReflowError::config(
                    "http-rewrite-header",
                    format!("expected `header: regexp,replacement`, got {:?}", raw),
                )
            })?;
            config.header_rewrites.push(HeaderRewrite {
                name: name.as_bytes().to_vec(),
                regex: compile(pattern.trim(), "http-rewrite-header")?,
                replacement: replacement.trim().as_bytes().to_vec(),
            });
        }
        for raw in &settings.rewrite_url {
            let (pattern, replacement) = raw.split_once(':').ok_or_else(|| {
                ReflowError::config(
                    "http-rewrite-url",
                    format!("expected `regexp:replacement`, got {:?}", raw),
                )
            })?;
            config.url_rewrites.push(UrlRewrite {
                regex: compile(pattern, "http-rewrite-url")?,
                replacement: replacement.as_bytes().to_vec(),
            });
        }
        for raw in &settings.set_header {
            let (name, value) = split_named(raw, "http-set-header")?;
            config
                .headers
                .push((name.as_bytes().to_vec(), value.as_bytes().to_vec()));
        }
        for raw in &settings.set_param {
            let (name, value) = raw.split_once('=').ok_or_else(|| {
                ReflowError::config(
                    "http-set-param",
                    format!("expected `param=value`, got {:?}", raw),
                )
            })?;
            config
                .params
                .push((name.as_bytes().to_vec(), value.as_bytes().to_vec()));
        }
        for raw in &settings.header_limiter {
            config
                .header_hash_filters
                .push(parse_hash_filter(raw, "http-header-limiter")?);
        }
        for raw in &settings.param_limiter {
            config
                .param_hash_filters
                .push(parse_hash_filter(raw, "http-param-limiter")?);
        }

        Ok(config)
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
            && self.url_allow.is_empty()
            && self.url_disallow.is_empty()
            && self.header_filters.is_empty()
            && self.header_negative_filters.is_empty()
            && self.basic_auth_filters.is_empty()
            && self.header_rewrites.is_empty()
            && self.url_rewrites.is_empty()
            && self.headers.is_empty()
            && self.params.is_empty()
            && self.header_hash_filters.is_empty()
            && self.param_hash_filters.is_empty()
    }
}

/// Applies the compiled chain to request bytes
#[derive(Debug)]
pub struct HttpModifier {
    config: ModifierConfig,
}

impl HttpModifier {
    /// `None` when no modifier flag was configured: the emitter skips the
    /// whole stage
    pub fn new(config: ModifierConfig) -> Option<Self> {
        if config.is_empty() {
            None
        } else {
            Some(Self { config })
        }
    }

    /// Run a request through the chain. `None` means the request is
    /// dropped (and its responses must be too).
    pub fn rewrite(&self, payload: Vec<u8>) -> Option<Vec<u8>> {
        let mut payload = payload;
        let config = &self.config;

        if !config.methods.is_empty() {
            let method = proto::method(&payload);
            if !config.methods.iter().any(|m| m == method) {
                return None;
            }
        }

        if !config.url_allow.is_empty() || !config.url_disallow.is_empty() {
            let url = full_url(&payload);
            if !config.url_allow.is_empty()
                && !config.url_allow.iter().any(|r| r.is_match(&url))
            {
                return None;
            }
            if config.url_disallow.iter().any(|r| r.is_match(&url)) {
                return None;
            }
        }

        for filter in &config.header_filters {
            if let Some(value) = proto::header(&payload, &filter.name) {
                if !filter.regex.is_match(value) {
                    return None;
                }
            }
        }
        for filter in &config.header_negative_filters {
            if let Some(value) = proto::header(&payload, &filter.name) {
                if filter.regex.is_match(value) {
                    return None;
                }
            }
        }

        if !config.basic_auth_filters.is_empty() {
            if let Some(value) = proto::header(&payload, b"Authorization") {
                let credential = value.strip_prefix(b"Basic ").unwrap_or(value);
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(credential)
                    .unwrap_or_default();
                if !config
                    .basic_auth_filters
                    .iter()
                    .any(|r| r.is_match(&decoded))
                {
                    return None;
                }
            }
        }

        for rewrite in &config.header_rewrites {
            if let Some(value) = proto::header(&payload, &rewrite.name) {
                if rewrite.regex.is_match(value) {
                    let replaced = rewrite
                        .regex
                        .replace_all(value, rewrite.replacement.as_slice())
                        .into_owned();
                    payload = proto::set_header(&payload, &rewrite.name, &replaced);
                }
            }
        }
        for rewrite in &config.url_rewrites {
            let path = proto::path(&payload).to_vec();
            if rewrite.regex.is_match(&path) {
                let replaced = rewrite
                    .regex
                    .replace_all(&path, rewrite.replacement.as_slice())
                    .into_owned();
                payload = proto::set_path(&payload, &replaced);
            }
        }

        for (name, value) in &config.headers {
            payload = proto::set_header(&payload, name, value);
        }
        for (name, value) in &config.params {
            payload = proto::set_path_param(&payload, name, value);
        }

        for filter in &config.header_hash_filters {
            match proto::header(&payload, &filter.name) {
                Some(value) if fnv1a32(value) % 100 < filter.percent => {}
                _ => return None,
            }
        }
        for filter in &config.param_hash_filters {
            match proto::path_param(&payload, &filter.name) {
                Some(value) if fnv1a32(value) % 100 < filter.percent => {}
                _ => return None,
            }
        }

        Some(payload)
    }
}

/// Host header plus request path, what URL filters match against
fn full_url(payload: &[u8]) -> Vec<u8> {
    let host = proto::header(payload, b"Host").unwrap_or(b"");
    [host, proto::path(payload)].concat()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn modifier(settings: ModifierSettings) -> HttpModifier {
        HttpModifier::new(ModifierConfig::from_settings(&settings).unwrap())
            .expect("settings are not empty")
    }

    const GET: &[u8] = b"GET /api/users?id=7 HTTP/1.1\r\nHost: www.example.com\r\n\r\n";
    const POST: &[u8] = b"POST /api/users HTTP/1.1\r\nHost: www.example.com\r\n\r\n";

    #[test]
    fn test_empty_settings_disable_modifier() {
        let config = ModifierConfig::from_settings(&ModifierSettings::default()).unwrap();
        assert!(HttpModifier::new(config).is_none());
    }

    #[test]
    fn test_method_allowlist() {
        let m = modifier(ModifierSettings {
            allow_methods: vec!["GET".into(), "OPTIONS".into()],
            ..Default::default()
        });
        assert!(m.rewrite(GET.to_vec()).is_some());
        assert!(m.rewrite(POST.to_vec()).is_none());
    }

    #[test]
    fn test_url_allow_and_disallow() {
        let m = modifier(ModifierSettings {
            allow_url: vec!["^www\\.".into()],
            ..Default::default()
        });
        assert!(m.rewrite(GET.to_vec()).is_some());

        let other: &[u8] = b"GET / HTTP/1.1\r\nHost: api.example.com\r\n\r\n";
        assert!(m.rewrite(other.to_vec()).is_none());

        let m = modifier(ModifierSettings {
            disallow_url: vec!["/api/".into()],
            ..Default::default()
        });
        assert!(m.rewrite(GET.to_vec()).is_none());
    }

    #[test]
    fn test_header_filters() {
        let m = modifier(ModifierSettings {
            allow_header: vec!["api-version:^v1".into()],
            ..Default::default()
        });

        let versioned: &[u8] = b"GET / HTTP/1.1\r\napi-version: v1.2\r\n\r\n";
        let wrong: &[u8] = b"GET / HTTP/1.1\r\napi-version: v2.0\r\n\r\n";
        assert!(m.rewrite(versioned.to_vec()).is_some());
        assert!(m.rewrite(wrong.to_vec()).is_none());
        // absent header passes the positive filter
        assert!(m.rewrite(GET.to_vec()).is_some());

        let m = modifier(ModifierSettings {
            disallow_header: vec!["User-Agent:Replayed".into()],
            ..Default::default()
        });
        let replayed: &[u8] = b"GET / HTTP/1.1\r\nUser-Agent: Replayed by reflow\r\n\r\n";
        assert!(m.rewrite(replayed.to_vec()).is_none());
        assert!(m.rewrite(GET.to_vec()).is_some());
    }

    #[test]
    fn test_basic_auth_filter() {
        let m = modifier(ModifierSettings {
            basic_auth_filter: vec!["^customer[0-9]".into()],
            ..Default::default()
        });

        let allowed = format!(
            "GET / HTTP/1.1\r\nAuthorization: Basic {}\r\n\r\n",
            base64::engine::general_purpose::STANDARD.encode("customer1:secret")
        );
        let denied = format!(
            "GET / HTTP/1.1\r\nAuthorization: Basic {}\r\n\r\n",
            base64::engine::general_purpose::STANDARD.encode("admin:secret")
        );
        assert!(m.rewrite(allowed.into_bytes()).is_some());
        assert!(m.rewrite(denied.into_bytes()).is_none());
    }

    #[test]
    fn test_header_rewrite_with_capture() {
        let m = modifier(ModifierSettings {
            rewrite_header: vec!["Host: (.*)\\.example\\.com,$1.beta.example.com".into()],
            ..Default::default()
        });
        let out = m.rewrite(GET.to_vec()).unwrap();
        assert_eq!(
            proto::header(&out, b"Host"),
            Some(&b"www.beta.example.com"[..])
        );
    }

    #[test]
    fn test_url_rewrite() {
        let m = modifier(ModifierSettings {
            rewrite_url: vec!["/api/users:/v2/users".into()],
            ..Default::default()
        });
        let out = m.rewrite(GET.to_vec()).unwrap();
        assert!(proto::path(&out).starts_with(b"/v2/users"));
    }

    #[test]
    fn test_set_header_and_param() {
        let m = modifier(ModifierSettings {
            set_header: vec!["User-Agent: reflow".into()],
            set_param: vec!["api_key=1".into()],
            ..Default::default()
        });
        let out = m.rewrite(GET.to_vec()).unwrap();
        assert_eq!(proto::header(&out, b"User-Agent"), Some(&b"reflow"[..]));
        assert_eq!(proto::path_param(&out, b"api_key"), Some(&b"1"[..]));
    }

    #[test]
    fn test_hash_limiter_extremes() {
        let none = modifier(ModifierSettings {
            header_limiter: vec!["user-id:0%".into()],
            ..Default::default()
        });
        let all = modifier(ModifierSettings {
            header_limiter: vec!["user-id:100".into()],
            ..Default::default()
        });

        let req: &[u8] = b"GET / HTTP/1.1\r\nuser-id: 12345\r\n\r\n";
        assert!(none.rewrite(req.to_vec()).is_none());
        assert!(all.rewrite(req.to_vec()).is_some());
        // requests without the limited header are dropped
        assert!(all.rewrite(GET.to_vec()).is_none());
    }

    #[test]
    fn test_hash_limiter_is_consistent() {
        let m = modifier(ModifierSettings {
            header_limiter: vec!["user-id:50%".into()],
            ..Default::default()
        });

        let req: &[u8] = b"GET / HTTP/1.1\r\nuser-id: alice\r\n\r\n";
        let first = m.rewrite(req.to_vec()).is_some();
        for _ in 0..50 {
            assert_eq!(m.rewrite(req.to_vec()).is_some(), first);
        }
    }

    #[test]
    fn test_param_hash_limiter() {
        let m = modifier(ModifierSettings {
            param_limiter: vec!["user_id:100%".into()],
            ..Default::default()
        });
        let with_param: &[u8] = b"GET /?user_id=42 HTTP/1.1\r\n\r\n";
        assert!(m.rewrite(with_param.to_vec()).is_some());
        assert!(m.rewrite(GET.to_vec()).is_none());
    }

    #[test]
    fn test_invalid_regex_is_fatal() {
        let settings = ModifierSettings {
            allow_url: vec!["([".into()],
            ..Default::default()
        };
        assert!(ModifierConfig::from_settings(&settings).is_err());
    }
}
