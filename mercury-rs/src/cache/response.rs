//! Contains the response values which are stored in the cache.
//!
//! A [CachedResponse] is a closed set of variants. A **plain** response simply carries a status,
//! its headers and the body as received from an upstream. A **hydrate** response is a template
//! which consists of literal fragments and references to other resources. These references are
//! expanded by the [hydrate](crate::middleware::hydrate) middleware on every delivery, therefore
//! the cache stores the unexpanded template so that the referenced resources can be refreshed
//! independently.
//!
//! Note that cached responses are immutable. An update always replaces the whole value.
use crate::cache::codec::{Decoder, Encoder};
use bytes::{Bytes, BytesMut};

/// Contains the fixed amount of bytes which are accounted for each cache entry on top of its
/// actual payload (covering the key, the entry itself and the list node).
pub const ENTRY_OVERHEAD: usize = 300;

/// Tags a plain response in a snapshot file.
pub const PLAIN_RESPONSE: u8 = 1;

/// Tags a hydrate response in a snapshot file.
pub const HYDRATE_RESPONSE: u8 = 2;

/// Tags a literal fragment of a hydrate response.
pub const LITERAL_FRAGMENT: u8 = 1;

/// Tags a reference fragment of a hydrate response.
pub const REFERENCE_FRAGMENT: u8 = 2;

/// Represents an ordered multi-map of HTTP headers.
///
/// Header names are compared case-insensitive, but are kept as given. The order of insertion
/// is preserved, which is also the order in which headers are persisted and delivered.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Creates an empty set of headers.
    pub fn new() -> Self {
        Headers {
            entries: Vec::new(),
        }
    }

    /// Appends the given header. Existing headers with the same name are kept.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replaces all headers with the given name by the given value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.entries.push((name, value.into()));
    }

    /// Removes all headers with the given name.
    pub fn remove(&mut self, name: &str) {
        self.entries
            .retain(|(key, _)| !key.eq_ignore_ascii_case(name));
    }

    /// Returns the first value of the given header.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Returns all values of the given header in their original order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Iterates over all name/value pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// Returns the number of header values.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Determines if there are no headers at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn byte_size(&self) -> usize {
        self.entries
            .iter()
            .map(|(key, value)| key.len() + value.len())
            .sum()
    }

    fn encode(&self, encoder: &mut Encoder) -> anyhow::Result<()> {
        encoder.write_len(self.entries.len())?;
        for (key, value) in &self.entries {
            encoder.write_str(key)?;
            encoder.write_str(value)?;
        }

        Ok(())
    }

    fn decode(decoder: &mut Decoder) -> anyhow::Result<Self> {
        let count = decoder.read_len()?;
        let mut headers = Headers::new();
        for _ in 0..count {
            let key = decoder.read_string()?;
            let value = decoder.read_string()?;
            headers.add(key, value);
        }

        Ok(headers)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Headers {
            entries: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

/// Represents a part of a hydrate response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fragment {
    /// Static content which is delivered as is.
    Literal(Bytes),

    /// The path of a resource whose body is inserted in place of this fragment.
    Reference(String),
}

impl Fragment {
    fn byte_size(&self) -> usize {
        match self {
            Fragment::Literal(data) => data.len(),
            Fragment::Reference(path) => path.len(),
        }
    }
}

/// Represents a response which can be stored in the cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CachedResponse {
    /// A response which is delivered as received.
    Plain {
        /// The HTTP status code.
        status: u16,
        /// The response headers.
        headers: Headers,
        /// The response body.
        body: Bytes,
    },

    /// A template response which is expanded on delivery.
    Hydrate {
        /// The HTTP status code.
        status: u16,
        /// The response headers.
        headers: Headers,
        /// The literal and reference fragments in order of appearance.
        fragments: Vec<Fragment>,
    },
}

impl CachedResponse {
    /// Creates a plain response.
    pub fn plain(status: u16, headers: Headers, body: impl Into<Bytes>) -> Self {
        CachedResponse::Plain {
            status,
            headers,
            body: body.into(),
        }
    }

    /// Creates a plain text response which is mostly used for responses generated by the
    /// gateway itself (errors, purge confirmations...).
    pub fn text(status: u16, text: impl Into<String>) -> Self {
        let mut headers = Headers::new();
        headers.add("Content-Type", "text/plain; charset=utf-8");
        CachedResponse::plain(status, headers, text.into())
    }

    /// Creates a hydrate response.
    pub fn hydrate(status: u16, headers: Headers, fragments: Vec<Fragment>) -> Self {
        CachedResponse::Hydrate {
            status,
            headers,
            fragments,
        }
    }

    /// Returns the HTTP status code.
    pub fn status(&self) -> u16 {
        match self {
            CachedResponse::Plain { status, .. } | CachedResponse::Hydrate { status, .. } => {
                *status
            }
        }
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &Headers {
        match self {
            CachedResponse::Plain { headers, .. } | CachedResponse::Hydrate { headers, .. } => {
                headers
            }
        }
    }

    /// Returns the body of this response.
    ///
    /// For a hydrate response, this only contains the literal fragments, as expanding references
    /// is up to the [hydrate](crate::middleware::hydrate) middleware.
    pub fn body(&self) -> Bytes {
        match self {
            CachedResponse::Plain { body, .. } => body.clone(),
            CachedResponse::Hydrate { fragments, .. } => {
                let mut body = BytesMut::new();
                for fragment in fragments {
                    if let Fragment::Literal(data) = fragment {
                        body.extend_from_slice(data);
                    }
                }
                body.freeze()
            }
        }
    }

    /// Returns the number of bytes accounted for this response when being cached.
    pub fn size_estimate(&self) -> usize {
        ENTRY_OVERHEAD
            + self.headers().byte_size()
            + match self {
                CachedResponse::Plain { body, .. } => body.len(),
                CachedResponse::Hydrate { fragments, .. } => {
                    fragments.iter().map(Fragment::byte_size).sum()
                }
            }
    }

    /// Determines if the status signals a server side failure (5xx).
    pub fn is_server_error(&self) -> bool {
        self.status() >= 500
    }

    /// Returns a copy of this response with the given header being set.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        match &mut self {
            CachedResponse::Plain { headers, .. } | CachedResponse::Hydrate { headers, .. } => {
                headers.set(name, value)
            }
        }

        self
    }

    /// Writes the type tag and the fields of this response.
    pub fn encode(&self, encoder: &mut Encoder) -> anyhow::Result<()> {
        match self {
            CachedResponse::Plain {
                status,
                headers,
                body,
            } => {
                encoder.write_u8(PLAIN_RESPONSE);
                encoder.write_int(i32::from(*status));
                headers.encode(encoder)?;
                encoder.write_bytes(body)
            }
            CachedResponse::Hydrate {
                status,
                headers,
                fragments,
            } => {
                encoder.write_u8(HYDRATE_RESPONSE);
                encoder.write_int(i32::from(*status));
                headers.encode(encoder)?;
                encoder.write_len(fragments.len())?;
                for fragment in fragments {
                    match fragment {
                        Fragment::Literal(data) => {
                            encoder.write_u8(LITERAL_FRAGMENT);
                            encoder.write_bytes(data)?;
                        }
                        Fragment::Reference(path) => {
                            encoder.write_u8(REFERENCE_FRAGMENT);
                            encoder.write_str(path)?;
                        }
                    }
                }

                Ok(())
            }
        }
    }

    /// Reads a response (including its type tag) as written by [encode](CachedResponse::encode).
    pub fn decode(decoder: &mut Decoder) -> anyhow::Result<Self> {
        let tag = decoder.read_u8()?;
        match tag {
            PLAIN_RESPONSE => {
                let status = decode_status(decoder)?;
                let headers = Headers::decode(decoder)?;
                let body = decoder.read_bytes()?;
                Ok(CachedResponse::Plain {
                    status,
                    headers,
                    body,
                })
            }
            HYDRATE_RESPONSE => {
                let status = decode_status(decoder)?;
                let headers = Headers::decode(decoder)?;
                let count = decoder.read_len()?;
                let mut fragments = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    fragments.push(match decoder.read_u8()? {
                        LITERAL_FRAGMENT => Fragment::Literal(decoder.read_bytes()?),
                        REFERENCE_FRAGMENT => Fragment::Reference(decoder.read_string()?),
                        kind => return Err(anyhow::anyhow!("Unknown fragment kind: {}", kind)),
                    });
                }
                Ok(CachedResponse::Hydrate {
                    status,
                    headers,
                    fragments,
                })
            }
            _ => Err(anyhow::anyhow!("Unknown response type: {}", tag)),
        }
    }
}

fn decode_status(decoder: &mut Decoder) -> anyhow::Result<u16> {
    let status = decoder.read_int()?;
    u16::try_from(status).map_err(|_| anyhow::anyhow!("Invalid status code: {}", status))
}
