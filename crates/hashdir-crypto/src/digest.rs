/// Width in bytes of a name digest.
pub const NAME_DIGEST_BYTES: usize = 20;

/// Width in hex characters of a rendered name digest.
pub const NAME_DIGEST_HEX_LEN: usize = NAME_DIGEST_BYTES * 2;

/// Fixed-width digest used to derive hashed filenames.
///
/// Implementations must be deterministic for the lifetime of a deployment:
/// every hashed filename already on disk was derived from it.
pub trait NameDigest: Send + Sync {
    /// Digest the canonical serialization of an object identity.
    fn digest(&self, data: &[u8]) -> [u8; NAME_DIGEST_BYTES];

    /// Lowercase hex rendering of [`NameDigest::digest`].
    fn digest_hex(&self, data: &[u8]) -> String {
        hex::encode(self.digest(data))
    }
}

/// Domain-separated BLAKE3 name digest.
///
/// The domain tag is prepended to every input so that name digests never
/// coincide with BLAKE3 hashes computed for other purposes. Output is the
/// first [`NAME_DIGEST_BYTES`] bytes of the extendable output.
#[derive(Clone, Debug)]
pub struct Blake3NameDigest {
    domain: &'static str,
}

impl Blake3NameDigest {
    /// Digest used for object filenames.
    pub const OBJECT_NAME: Self = Self {
        domain: "hashdir-name-v1",
    };

    /// Create a digest with a custom domain tag.
    pub const fn new(domain: &'static str) -> Self {
        Self { domain }
    }

    /// The domain tag used by this digest.
    pub fn domain(&self) -> &str {
        self.domain
    }
}

impl Default for Blake3NameDigest {
    fn default() -> Self {
        Self::OBJECT_NAME
    }
}

impl NameDigest for Blake3NameDigest {
    fn digest(&self, data: &[u8]) -> [u8; NAME_DIGEST_BYTES] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.domain.as_bytes());
        hasher.update(b":");
        hasher.update(data);
        let mut out = [0u8; NAME_DIGEST_BYTES];
        hasher.finalize_xof().fill(&mut out);
        out
    }
}
