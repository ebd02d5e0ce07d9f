#![forbid(unsafe_code)]

//! Secret handling at egress: the allowlist leak defence and the
//! placeholder-to-value substitution.
//!
//! The guest only ever holds placeholders. Before a request leaves the
//! host we (a) verify that no real secret value is being smuggled toward
//! a host its allowlist does not cover, and (b) swap placeholders for
//! real values, each substitution gated by the same per-secret allowlist.

use crate::InterceptError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use gondolin_policy::{Policy, RequestHead, SecretEntry};
use url::Url;

const BASIC_PREFIX: &str = "Basic ";

fn is_auth_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("Authorization") || name.eq_ignore_ascii_case("Proxy-Authorization")
}

fn basic_decoded(value: &str) -> Option<String> {
    let b64 = value.strip_prefix(BASIC_PREFIX)?;
    let decoded = BASE64.decode(b64.trim()).ok()?;
    String::from_utf8(decoded).ok()
}

fn decoded_query_parts(url: &str) -> Vec<String> {
    let Ok(parsed) = Url::parse(url) else {
        return Vec::new();
    };
    parsed
        .query_pairs()
        .flat_map(|(k, v)| [k.into_owned(), v.into_owned()])
        .collect()
}

/// The allowlist defence: a request headed for `target_host` must not
/// carry the literal value of any secret whose allowlist does not cover
/// that host. Headers are always scanned (including base64-decoded Basic
/// credentials); query parameters only when the policy opts in.
pub fn scan_for_leaks(
    head: &RequestHead,
    target_host: &str,
    policy: &Policy,
) -> Result<(), InterceptError> {
    for secret in policy.secrets.entries() {
        if secret.allows_host(target_host) {
            continue;
        }
        for (name, value) in &head.headers {
            if value.contains(&secret.value) {
                return Err(blocked(secret, target_host));
            }
            if is_auth_header(name) {
                if let Some(decoded) = basic_decoded(value) {
                    if decoded.contains(&secret.value) {
                        return Err(blocked(secret, target_host));
                    }
                }
            }
        }
        if policy.replace_secrets_in_query
            && decoded_query_parts(&head.url)
                .iter()
                .any(|part| part.contains(&secret.value))
        {
            return Err(blocked(secret, target_host));
        }
    }
    Ok(())
}

/// Swap placeholders for real values. A placeholder aimed at a host the
/// secret's allowlist does not cover fails the request instead of
/// leaking.
pub fn substitute_placeholders(
    head: &mut RequestHead,
    target_host: &str,
    policy: &Policy,
) -> Result<(), InterceptError> {
    for secret in policy.secrets.entries() {
        let in_headers = head.headers.iter().any(|(name, value)| {
            value.contains(&secret.placeholder)
                || (is_auth_header(name)
                    && basic_decoded(value)
                        .is_some_and(|decoded| decoded.contains(&secret.placeholder)))
        });
        let in_query = policy.replace_secrets_in_query
            && decoded_query_parts(&head.url)
                .iter()
                .any(|part| part.contains(&secret.placeholder));
        if !in_headers && !in_query {
            continue;
        }
        if !secret.allows_host(target_host) {
            return Err(blocked(secret, target_host));
        }

        for (name, value) in &mut head.headers {
            if value.contains(&secret.placeholder) {
                *value = value.replace(&secret.placeholder, &secret.value);
            }
            if is_auth_header(name) {
                if let Some(decoded) = basic_decoded(value) {
                    if decoded.contains(&secret.placeholder) {
                        let substituted = decoded.replace(&secret.placeholder, &secret.value);
                        *value = format!("{BASIC_PREFIX}{}", BASE64.encode(substituted));
                    }
                }
            }
        }

        if in_query {
            head.url = rewrite_query(&head.url, &secret.placeholder, &secret.value);
        }
    }
    Ok(())
}

fn rewrite_query(url: &str, from: &str, to: &str) -> String {
    let Ok(parsed) = Url::parse(url) else {
        return url.to_string();
    };
    if parsed.query().is_none() {
        return url.to_string();
    }
    let pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.replace(from, to), v.replace(from, to)))
        .collect();
    let mut rewritten = parsed.clone();
    rewritten.query_pairs_mut().clear().extend_pairs(pairs);
    rewritten.to_string()
}

fn blocked(secret: &SecretEntry, target_host: &str) -> InterceptError {
    InterceptError::RequestBlocked {
        reason: format!(
            "secret {:?} is not allowed to travel to {target_host}",
            secret.name
        ),
    }
}
