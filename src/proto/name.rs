//! Hierarchical names for producers and objects

use std::{fmt, str::FromStr};

use bytes::Bytes;
use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, Snafu};

/// Per-producer sequence number, allocated by the sync engine.
pub type SeqNo = u64;

/// A single component of a [`Name`].
///
/// Components are opaque bytes. They are displayed as URI path segments, with every byte
/// outside of the unreserved URI characters written as a `%XX` escape.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Component(Bytes);

impl Component {
    /// Create a component from raw bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// The raw bytes of this component.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for Component {
    fn from(value: &str) -> Self {
        Self(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<String> for Component {
    fn from(value: String) -> Self {
        Self(Bytes::from(value.into_bytes()))
    }
}

impl From<Bytes> for Component {
    fn from(value: Bytes) -> Self {
        Self(value)
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            if is_unreserved(*byte) {
                write!(f, "{}", *byte as char)?;
            } else {
                write!(f, "%{byte:02X}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Component({self})")
    }
}

/// A hierarchical name, such as `/ndn/svs/alice`.
///
/// Names identify both producers (the stream a sequence number belongs to) and the
/// application objects they publish. Subscriptions match names by prefix, see
/// [`Name::is_prefix_of`].
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Name(Vec<Component>);

impl Name {
    /// The empty name, `/`. It is a prefix of every name.
    pub const fn empty() -> Self {
        Self(Vec::new())
    }

    /// Create a name from its components.
    pub fn from_components(components: impl IntoIterator<Item = impl Into<Component>>) -> Self {
        Self(components.into_iter().map(Into::into).collect())
    }

    /// Append a component.
    pub fn push(&mut self, component: impl Into<Component>) {
        self.0.push(component.into());
    }

    /// Returns this name with `component` appended.
    pub fn join(mut self, component: impl Into<Component>) -> Self {
        self.push(component);
        self
    }

    /// The components of this name.
    pub fn components(&self) -> &[Component] {
        &self.0
    }

    /// Number of components.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether this is the empty name.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `self` is a prefix of `other`.
    ///
    /// Comparison is component-wise: `/a` is a prefix of `/a/b` and of `/a`, but not of `/ab`.
    pub fn is_prefix_of(&self, other: &Name) -> bool {
        self.0.len() <= other.0.len() && self.0.iter().zip(other.0.iter()).all(|(a, b)| a == b)
    }

    /// Feed an unambiguous encoding of this name into `hasher`.
    pub(crate) fn hash_into(&self, hasher: &mut blake3::Hasher) {
        hasher.update(&(self.0.len() as u64).to_be_bytes());
        for component in &self.0 {
            hasher.update(&(component.0.len() as u64).to_be_bytes());
            hasher.update(&component.0);
        }
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "/");
        }
        for component in &self.0 {
            write!(f, "/{component}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({self})")
    }
}

/// Error when parsing a [`Name`] from its URI representation.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum NameParseError {
    /// A `%` was not followed by two hex digits.
    #[snafu(display("invalid percent escape in component {component:?}"))]
    InvalidEscape { component: String },
}

/// Parses the URI representation, e.g. `/ndn/svs/alice`.
///
/// Empty segments are skipped, so `/a//b/` parses as `/a/b`.
impl FromStr for Name {
    type Err = NameParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut name = Name::empty();
        for segment in s.split('/').filter(|s| !s.is_empty()) {
            name.push(Component(decode_segment(segment)?));
        }
        Ok(name)
    }
}

impl From<&str> for Name {
    /// Converts a literal name, escapes are not interpreted.
    ///
    /// Use [`str::parse`] for user input.
    fn from(value: &str) -> Self {
        Self::from_components(value.split('/').filter(|s| !s.is_empty()))
    }
}

fn is_unreserved(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~')
}

fn decode_segment(segment: &str) -> Result<Bytes, NameParseError> {
    let input = segment.as_bytes();
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] == b'%' {
            let Some(byte) = input
                .get(i + 1..i + 3)
                .and_then(|hex| std::str::from_utf8(hex).ok())
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            else {
                return InvalidEscapeSnafu {
                    component: segment.to_string(),
                }
                .fail();
            };
            out.push(byte);
            i += 3;
        } else {
            out.push(input[i]);
            i += 1;
        }
    }
    Ok(out.into())
}
