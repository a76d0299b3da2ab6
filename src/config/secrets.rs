//! Secret handling utilities.
//!
//! Re-exports secrecy types so callers do not need a direct dependency, and
//! redacts credentials from connection strings before they are logged.

pub use secrecy::{ExposeSecret, SecretString};
use url::Url;

const MASK: &str = "***";

/// Shown in place of a connection string that cannot be parsed as a URL.
const UNPARSEABLE: &str = "<unparseable database url>";

/// Mask every password in a connection URL: the userinfo password and any
/// `password`-like query parameter (libpq accepts `?password=` and
/// `?sslpassword=`). Anything that does not parse is replaced wholesale.
pub fn redact_url(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return UNPARSEABLE.to_string();
    };

    if url.password().is_some() && url.set_password(Some(MASK)).is_err() {
        return UNPARSEABLE.to_string();
    }

    let has_secret_param = url.query_pairs().any(|(key, _)| is_password_key(&key));
    if has_secret_param {
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(key, value)| {
                let value = if is_password_key(&key) {
                    MASK.to_string()
                } else {
                    value.into_owned()
                };
                (key.into_owned(), value)
            })
            .collect();
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }

    url.to_string()
}

fn is_password_key(key: &str) -> bool {
    key.to_ascii_lowercase().ends_with("password")
}
