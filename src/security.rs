//! Signing of published objects and validation of received ones

use std::{collections::HashSet, fmt, sync::Arc};

use ed25519_dalek::{Signer as _, SigningKey, VerifyingKey};
use n0_future::future::Boxed as BoxFuture;
use nested_enum_utils::common_fields;
use rand::{CryptoRng, RngCore};
use snafu::{Backtrace, ResultExt, Snafu};

use crate::proto::{Data, SignatureInfo};

/// Signs application objects before they are published.
pub trait Signer: fmt::Debug + Send + Sync + 'static {
    /// Sign `data` in place.
    fn sign(&self, data: &mut Data);
}

/// Validates encapsulated application objects before they are delivered.
pub trait Validator: fmt::Debug + Send + Sync + 'static {
    /// Validate `data`. An error means the object must not be delivered.
    fn validate(&self, data: &Data) -> BoxFuture<Result<(), ValidationError>>;
}

/// Validation failures.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum ValidationError {
    #[snafu(display("object is not signed"))]
    Unsigned {},
    #[snafu(display("signing key {key} is not trusted"))]
    UntrustedKey { key: String },
    #[snafu(display("invalid signature"))]
    BadSignature { source: ed25519_dalek::SignatureError },
}

/// Signer that leaves objects unsigned.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSigning;

impl Signer for NoSigning {
    fn sign(&self, data: &mut Data) {
        data.signature = None;
    }
}

/// Signs objects with an ed25519 key.
#[derive(Clone)]
pub struct Ed25519Signer {
    key: SigningKey,
}

impl fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Ed25519Signer({})",
            data_encoding::HEXLOWER.encode(&self.key.verifying_key().as_bytes()[..5])
        )
    }
}

impl Ed25519Signer {
    /// Create a signer from a secret key.
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    /// Create a signer with a freshly generated key.
    pub fn generate<R: CryptoRng + RngCore + ?Sized>(mut rng: &mut R) -> Self {
        Self::new(SigningKey::generate(&mut rng))
    }

    /// The public key matching this signer.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }
}

impl Signer for Ed25519Signer {
    fn sign(&self, data: &mut Data) {
        let digest = data.signing_digest();
        data.signature = Some(SignatureInfo {
            key: self.key.verifying_key(),
            signature: self.key.sign(digest.as_bytes()),
        });
    }
}

/// Accepts objects carrying a valid signature by one of a set of trusted keys.
#[derive(Debug, Default, Clone)]
pub struct TrustedKeysValidator {
    keys: HashSet<VerifyingKey>,
}

impl TrustedKeysValidator {
    /// Create a validator trusting `keys`.
    pub fn new(keys: impl IntoIterator<Item = VerifyingKey>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
        }
    }

    /// Trust an additional key.
    pub fn trust(&mut self, key: VerifyingKey) {
        self.keys.insert(key);
    }

    /// Check `data` synchronously.
    pub fn check(&self, data: &Data) -> Result<(), ValidationError> {
        let Some(info) = &data.signature else {
            return UnsignedSnafu.fail();
        };
        if !self.keys.contains(&info.key) {
            return UntrustedKeySnafu {
                key: data_encoding::HEXLOWER.encode(info.key.as_bytes()),
            }
            .fail();
        }
        info.key
            .verify_strict(data.signing_digest().as_bytes(), &info.signature)
            .context(BadSignatureSnafu)
    }
}

impl Validator for TrustedKeysValidator {
    fn validate(&self, data: &Data) -> BoxFuture<Result<(), ValidationError>> {
        Box::pin(std::future::ready(self.check(data)))
    }
}

/// How objects are signed and validated.
#[derive(Debug, Clone)]
pub struct SecurityOptions {
    /// Signs objects published with [`crate::PubSub::publish`].
    pub signer: Arc<dyn Signer>,
    /// Validates fetched objects before delivery. `None` delivers without validation.
    pub encapsulated_validator: Option<Arc<dyn Validator>>,
}

impl Default for SecurityOptions {
    fn default() -> Self {
        Self {
            signer: Arc::new(NoSigning),
            encapsulated_validator: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn sign_and_validate() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(1);
        let alice = Ed25519Signer::generate(&mut rng);
        let mallory = Ed25519Signer::generate(&mut rng);
        let validator = TrustedKeysValidator::new([alice.verifying_key()]);

        let mut data = Data::new("/chat/alice/1".into(), &b"hi"[..]);
        assert!(matches!(
            validator.check(&data),
            Err(ValidationError::Unsigned { .. })
        ));

        alice.sign(&mut data);
        validator.check(&data).unwrap();

        let mut tampered = data.clone();
        tampered.content = b"bye".to_vec().into();
        assert!(matches!(
            validator.check(&tampered),
            Err(ValidationError::BadSignature { .. })
        ));

        let mut forged = data.clone();
        mallory.sign(&mut forged);
        assert!(matches!(
            validator.check(&forged),
            Err(ValidationError::UntrustedKey { .. })
        ));

        NoSigning.sign(&mut data);
        assert!(data.signature.is_none());
    }
}
