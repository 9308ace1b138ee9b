//! Determines how long a response may be cached.
use crate::cache::response::Headers;
use std::time::Duration;

/// Limits the TTL which can be requested via **max-age**.
pub const MAX_AGE_LIMIT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Derives the time to live of a response.
///
/// Successful responses (2xx and 3xx) of a route with a configured TTL use that TTL. Everything
/// else is governed by the **Cache-Control** headers: a **private** response isn't cached at all,
/// otherwise the first **max-age** directive determines the TTL. A malformed max-age is logged and
/// treated like a missing one. A max-age beyond [MAX_AGE_LIMIT] is capped.
///
/// Returns **None** if the response must not be cached.
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// # use mercury::cache::ttl::derive_ttl;
/// # use mercury::cache::response::Headers;
/// let headers: Headers = vec![("Cache-Control", "public, max-age=60")].into_iter().collect();
/// assert_eq!(derive_ttl(404, Duration::from_secs(10), &headers), Some(Duration::from_secs(60)));
/// assert_eq!(derive_ttl(200, Duration::from_secs(10), &headers), Some(Duration::from_secs(10)));
/// assert_eq!(derive_ttl(200, Duration::ZERO, &Headers::new()), None);
/// ```
pub fn derive_ttl(status: u16, route_ttl: Duration, headers: &Headers) -> Option<Duration> {
    if (200..400).contains(&status) && !route_ttl.is_zero() {
        return Some(route_ttl);
    }

    for value in headers.get_all("Cache-Control") {
        if value.to_ascii_lowercase().contains("private") {
            return None;
        }

        for directive in value.split(',').map(str::trim) {
            let (name, argument) = match directive.split_once('=') {
                Some((name, argument)) => (name.trim(), argument.trim()),
                None => continue,
            };
            if !name.eq_ignore_ascii_case("max-age") {
                continue;
            }

            return match argument.trim_matches('"').parse::<u64>() {
                Ok(seconds) if seconds > MAX_AGE_LIMIT.as_secs() => {
                    log::warn!(
                        "Capping the max-age {} in Cache-Control to {}.",
                        seconds,
                        crate::fmt::format_duration(MAX_AGE_LIMIT)
                    );
                    Some(MAX_AGE_LIMIT)
                }
                Ok(seconds) => Some(Duration::from_secs(seconds)),
                Err(_) => {
                    log::warn!("Ignoring an invalid max-age in Cache-Control: {}", value);
                    None
                }
            };
        }
    }

    None
}
