//! Application objects and the outer objects exchanged through the sync engine

use std::time::Duration;

use bytes::Bytes;
use ed25519_dalek::{Signature, VerifyingKey};
use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, ResultExt, Snafu};

use super::name::Name;

/// Signature over the [`Data::signing_digest`] of an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureInfo {
    /// Key of the signer.
    pub key: VerifyingKey,
    /// The signature itself.
    pub signature: Signature,
}

/// A named application object.
///
/// This is what applications publish and what subscribers receive. On the way through the sync
/// engine it is encapsulated in a [`SyncObject`] of type [`ContentType::Data`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Data {
    /// Name of the object.
    pub name: Name,
    /// Application payload.
    pub content: Bytes,
    /// How long the object stays fresh. `None` means forever.
    pub freshness: Option<Duration>,
    /// Signature, if the object was signed.
    pub signature: Option<SignatureInfo>,
}

impl std::fmt::Debug for Data {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Data")
            .field("name", &self.name)
            .field("content", &format_args!("<{}>", self.content.len()))
            .field("freshness", &self.freshness)
            .field("signed", &self.signature.is_some())
            .finish()
    }
}

impl Data {
    /// Create an unsigned object without a freshness period.
    pub fn new(name: Name, content: impl Into<Bytes>) -> Self {
        Self {
            name,
            content: content.into(),
            freshness: None,
            signature: None,
        }
    }

    /// Set the freshness period.
    pub fn with_freshness(mut self, freshness: Option<Duration>) -> Self {
        self.freshness = freshness;
        self
    }

    /// Digest of everything a signature covers, i.e. all fields except the signature.
    pub fn signing_digest(&self) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new();
        self.name.hash_into(&mut hasher);
        hasher.update(&(self.content.len() as u64).to_be_bytes());
        hasher.update(&self.content);
        match self.freshness {
            None => hasher.update(&[0]),
            Some(freshness) => hasher
                .update(&[1])
                .update(&freshness.as_secs().to_be_bytes())
                .update(&freshness.subsec_nanos().to_be_bytes()),
        };
        hasher.finalize()
    }

    /// Encode to bytes.
    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        let bytes = postcard::to_stdvec(self).context(SerializeSnafu { what: "data" })?;
        Ok(bytes.into())
    }

    /// Decode from bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        postcard::from_bytes(bytes).context(MalformedSnafu { what: "data" })
    }
}

/// What the content of a [`SyncObject`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentType {
    /// Opaque bytes.
    Blob,
    /// An encoded, encapsulated [`Data`].
    Data,
}

/// The unit the sync engine stores and fetches per `(producer, sequence)`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncObject {
    /// Declared kind of `content`.
    pub content_type: ContentType,
    /// The content.
    pub content: Bytes,
}

impl std::fmt::Debug for SyncObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SyncObject({:?}, <{}>)", self.content_type, self.content.len())
    }
}

impl SyncObject {
    /// Encapsulate an application object.
    pub fn encapsulate(data: &Data) -> Result<Self, EncodeError> {
        Ok(Self {
            content_type: ContentType::Data,
            content: data.encode()?,
        })
    }

    /// An object carrying opaque bytes.
    pub fn blob(content: impl Into<Bytes>) -> Self {
        Self {
            content_type: ContentType::Blob,
            content: content.into(),
        }
    }

    /// Decode the encapsulated application object.
    ///
    /// Returns `Ok(None)` if this object does not encapsulate one.
    pub fn decapsulate(&self) -> Result<Option<Data>, DecodeError> {
        match self.content_type {
            ContentType::Blob => Ok(None),
            ContentType::Data => Data::decode(&self.content).map(Some),
        }
    }
}

/// Error when decoding objects or mapping lists.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum DecodeError {
    #[snafu(display("malformed {what}"))]
    Malformed {
        what: &'static str,
        source: postcard::Error,
    },
}

/// Error when encoding objects or mapping lists.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum EncodeError {
    #[snafu(display("failed to serialize {what}"))]
    Serialize {
        what: &'static str,
        source: postcard::Error,
    },
}
