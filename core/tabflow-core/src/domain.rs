//! Domain matching between live tab URLs and stored rule domains.
//!
//! Rule and protected domains are stored normalized, and every
//! comparison goes through [`normalize_domain`] on both sides so that
//! `www.x.com`, `X.COM.` and `https://x.com/feed` all land on `x.com`.
//! Malformed URLs match nothing; nothing here panics or returns an error.

use url::Url;

use crate::error::RuleConflict;
use crate::types::Rule;

/// Lowercased hostname of `url`, without a trailing dot. `None` for anything
/// that does not parse or has no host (`about:blank`, `file:///...`).
pub fn hostname_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url.trim()).ok()?;
    let host = parsed.host_str()?;
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// Normalizes user input into a stored domain: strips scheme, path, port,
/// a leading `www.` and a trailing dot. Accepts pasted URLs or bare domains.
pub fn normalize_domain(input: &str) -> String {
    let mut value = input.trim().to_ascii_lowercase();
    if value.is_empty() {
        return value;
    }

    if value.contains("://") {
        if let Some(host) = hostname_of(&value) {
            value = host;
        }
    }

    let value = value
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default()
        .to_string();
    let value = match value.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host.to_string(),
        _ => value,
    };
    let value = value.trim_end_matches('.');
    value.strip_prefix("www.").unwrap_or(value).to_string()
}

/// True iff the url's hostname equals `domain` or is a subdomain of it.
pub fn match_domain(url: &str, domain: &str) -> bool {
    let domain = normalize_domain(domain);
    if domain.is_empty() {
        return false;
    }
    match hostname_of(url) {
        Some(host) => host_matches(&host, &domain),
        None => false,
    }
}

fn host_matches(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .map(|prefix| prefix.ends_with('.'))
            .unwrap_or(false)
}

pub fn is_protected(url: &str, protected_domains: &[String]) -> bool {
    protected_domains
        .iter()
        .any(|domain| match_domain(url, domain))
}

pub fn rule_matches_url(rule: &Rule, url: &str) -> bool {
    rule.domains.iter().any(|domain| match_domain(url, domain))
}

/// First enabled rule (in stored order) covering `url`. A protected domain
/// always wins over any rule.
pub fn find_matching_rule<'a>(
    url: &str,
    rules: &'a [Rule],
    protected_domains: &[String],
) -> Option<&'a Rule> {
    if is_protected(url, protected_domains) {
        return None;
    }
    rules
        .iter()
        .filter(|rule| rule.enabled)
        .find(|rule| rule_matches_url(rule, url))
}

/// Two stored domains overlap when equal or when one is a subdomain of the other.
pub fn domains_overlap(a: &str, b: &str) -> bool {
    let a = normalize_domain(a);
    let b = normalize_domain(b);
    if a.is_empty() || b.is_empty() {
        return false;
    }
    host_matches(&a, &b) || host_matches(&b, &a)
}

/// Domains in `domains` already covered by another enabled rule.
/// `exclude_rule_id` is the rule being edited, which never conflicts with itself.
pub fn find_conflicts(
    domains: &[String],
    rules: &[Rule],
    exclude_rule_id: Option<&str>,
) -> Vec<RuleConflict> {
    let mut conflicts = Vec::new();
    for domain in domains {
        for rule in rules {
            if !rule.enabled || Some(rule.id.as_str()) == exclude_rule_id {
                continue;
            }
            if rule
                .domains
                .iter()
                .any(|existing| domains_overlap(domain, existing))
            {
                conflicts.push(RuleConflict {
                    domain: domain.clone(),
                    rule_id: rule.id.clone(),
                    rule_name: rule.name.clone(),
                });
            }
        }
    }
    conflicts
}
