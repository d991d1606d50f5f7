//! HTTP authentication for ISAPI requests.
//!
//! Requests start with Basic credentials. Most recorders answer with a Digest
//! challenge instead; once seen, the challenge is kept and every later request
//! carries a Digest response with an increasing nonce count.

use std::fmt;

use md5::{Digest, Md5};

/// Username/password pair supplied out-of-band.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub(crate) fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Parameters of a `WWW-Authenticate: Digest` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub qop_auth: bool,
    pub stale: bool,
}

impl DigestChallenge {
    /// Parse a `WWW-Authenticate` header value. Returns `None` for other schemes.
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, params) = header.split_once(char::is_whitespace)?;
        if !scheme.eq_ignore_ascii_case("digest") {
            return None;
        }

        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut qop_auth = false;
        let mut stale = false;

        for (key, value) in split_params(params) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "opaque" => opaque = Some(value),
                "qop" => {
                    qop_auth = value
                        .split(',')
                        .any(|q| q.trim().eq_ignore_ascii_case("auth"))
                }
                "stale" => stale = value.eq_ignore_ascii_case("true"),
                _ => {}
            }
        }

        Some(Self {
            realm: realm?,
            nonce: nonce?,
            opaque,
            qop_auth,
            stale,
        })
    }

    /// Build the `Authorization` header value for one request.
    pub fn authorization(
        &self,
        credentials: &Credentials,
        method: &str,
        uri: &str,
        nonce_count: u32,
        cnonce: &str,
    ) -> String {
        let ha1 = md5_hex(&format!(
            "{}:{}:{}",
            credentials.username(),
            self.realm,
            credentials.password()
        ));
        let ha2 = md5_hex(&format!("{method}:{uri}"));
        let nc = format!("{nonce_count:08x}");

        let response = if self.qop_auth {
            md5_hex(&format!("{ha1}:{}:{nc}:{cnonce}:auth:{ha2}", self.nonce))
        } else {
            md5_hex(&format!("{ha1}:{}:{ha2}", self.nonce))
        };

        let mut header = format!(
            r#"Digest username="{}", realm="{}", nonce="{}", uri="{uri}", algorithm=MD5, response="{response}""#,
            credentials.username(),
            self.realm,
            self.nonce,
        );
        if self.qop_auth {
            header.push_str(&format!(r#", qop=auth, nc={nc}, cnonce="{cnonce}""#));
        }
        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(r#", opaque="{opaque}""#));
        }
        header
    }
}

fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}

/// Split `key=value, key="quoted, value"` pairs, honouring quotes.
fn split_params(input: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut rest = input.trim();

    while !rest.is_empty() {
        let Some((key, after_key)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_string();
        let after_key = after_key.trim_start();

        let (value, remaining) = if let Some(quoted) = after_key.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (quoted[..end].to_string(), &quoted[end + 1..]),
                None => (quoted.to_string(), ""),
            }
        } else {
            match after_key.find(',') {
                Some(end) => (after_key[..end].trim().to_string(), &after_key[end..]),
                None => (after_key.trim().to_string(), ""),
            }
        };

        pairs.push((key, value));
        rest = remaining.trim_start().trim_start_matches(',').trim_start();
    }

    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_is_redacted_in_debug_output() {
        let creds = Credentials::new("admin", "hunter2");
        let debug = format!("{creds:?}");
        assert!(debug.contains("admin"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn parses_digest_challenge() {
        let challenge = DigestChallenge::parse(
            r#"Digest qop="auth", realm="IP Camera(C1234)", nonce="4e5a6b7c", stale="FALSE", opaque="xyz""#,
        )
        .unwrap();
        assert_eq!(challenge.realm, "IP Camera(C1234)");
        assert_eq!(challenge.nonce, "4e5a6b7c");
        assert_eq!(challenge.opaque.as_deref(), Some("xyz"));
        assert!(challenge.qop_auth);
        assert!(!challenge.stale);
    }

    #[test]
    fn ignores_basic_challenge() {
        assert!(DigestChallenge::parse(r#"Basic realm="DVR""#).is_none());
    }

    #[test]
    fn computes_rfc2617_response() {
        // Worked example from RFC 2617 section 3.5.
        let challenge = DigestChallenge {
            realm: "testrealm@host.com".to_string(),
            nonce: "dcd98b7102dd2f0e8b11d0f600bfb0c093".to_string(),
            opaque: Some("5ccc069c403ebaf9f0171e9517f40e41".to_string()),
            qop_auth: true,
            stale: false,
        };
        let creds = Credentials::new("Mufasa", "Circle Of Life");
        let header = challenge.authorization(&creds, "GET", "/dir/index.html", 1, "0a4f113b");
        assert!(header.contains(r#"response="6629fae49393a05397450978507c4ef1""#));
        assert!(header.contains("nc=00000001"));
        assert!(header.contains(r#"opaque="5ccc069c403ebaf9f0171e9517f40e41""#));
    }
}
