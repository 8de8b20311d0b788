use digest::{Digest, DynDigest};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sha2::Sha512;

use crate::{Error, Result};

// https://github.com/opencontainers/image-spec/blob/main/descriptor.md#digests
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OciDigest {
    algorithm: DigestAlgorithm,
    encoded: String,
}

impl TryFrom<&str> for OciDigest {
    type Error = Error;
    fn try_from(s: &str) -> Result<Self> {
        let i = match s.find(':') {
            Some(i) => i,
            None => return Err(Error::InvalidDigest(s.to_string())),
        };
        let algo: &str = match s.get(..i) {
            Some(a) => a,
            None => return Err(Error::InvalidDigest(s.to_string())),
        };
        let encoded: &str = match s.get(i + 1..) {
            Some(e) if !e.is_empty() => e,
            _ => return Err(Error::InvalidDigest(s.to_string())),
        };
        if !encoded.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidDigest(s.to_string()));
        }
        let algorithm = DigestAlgorithm::try_from(algo)
            .map_err(|_| Error::InvalidDigest(s.to_string()))?;

        Ok(Self {
            algorithm,
            encoded: encoded.to_string(),
        })
    }
}

impl std::str::FromStr for OciDigest {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        s.try_into()
    }
}

impl From<&[u8]> for OciDigest {
    /// Canonical digest of a byte slice: sha256 over the exact bytes.
    fn from(bs: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        Digest::update(&mut hasher, bs);
        let s = hasher.finalize();

        Self {
            algorithm: DigestAlgorithm::Sha256,
            encoded: format!("{s:x}"),
        }
    }
}

impl From<OciDigest> for String {
    fn from(d: OciDigest) -> String {
        format!("{}:{}", String::from(&d.algorithm), d.encoded)
    }
}

impl From<&OciDigest> for String {
    fn from(d: &OciDigest) -> String {
        format!("{}:{}", String::from(&d.algorithm), d.encoded)
    }
}

impl std::fmt::Display for OciDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}", String::from(&self.algorithm), self.encoded)
    }
}

impl Serialize for OciDigest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from(self))
    }
}

impl<'de> Deserialize<'de> for OciDigest {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        OciDigest::try_from(s.as_str()).map_err(serde::de::Error::custom)
    }
}

impl OciDigest {
    pub fn algorithm(&self) -> &DigestAlgorithm {
        &self.algorithm
    }

    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    pub fn digester(&self) -> Digester {
        self.algorithm.digester()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DigestAlgorithm {
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }

    pub fn digester(&self) -> Digester {
        match self {
            DigestAlgorithm::Sha256 => Digester::new(*self, Box::new(Sha256::new())),
            DigestAlgorithm::Sha512 => Digester::new(*self, Box::new(Sha512::new())),
        }
    }
}

impl TryFrom<&str> for DigestAlgorithm {
    type Error = Error;

    fn try_from(a: &str) -> Result<Self> {
        match a {
            "sha512" => Ok(DigestAlgorithm::Sha512),
            "sha256" => Ok(DigestAlgorithm::Sha256),
            s => Err(Error::UnsupportedDigestAlgorithm(String::from(s))),
        }
    }
}

impl From<&DigestAlgorithm> for String {
    fn from(a: &DigestAlgorithm) -> String {
        String::from(a.as_str())
    }
}

/// Incrementally hashes a byte stream while counting the bytes seen.
///
/// Used to verify client-provided digests against actual uploaded content
/// and to produce the canonical digest of synced content as it streams
/// through the registry.
pub struct Digester {
    algorithm: DigestAlgorithm,
    digester: Box<dyn DynDigest + 'static + Send>,
    bytes: u64,
}

impl Digester {
    pub fn new(algorithm: DigestAlgorithm, digester: Box<dyn DynDigest + 'static + Send>) -> Self {
        Self {
            algorithm,
            digester,
            bytes: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.bytes += data.len() as u64;
        self.digester.update(data);
    }

    #[inline]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn finalize(self) -> OciDigest {
        let out = self.digester.finalize();
        let encoded = out.iter().map(|b| format!("{b:02x}")).collect::<String>();
        OciDigest {
            algorithm: self.algorithm,
            encoded,
        }
    }
}

impl Default for Digester {
    fn default() -> Self {
        DigestAlgorithm::Sha256.digester()
    }
}

impl From<&Digester> for DigestState {
    fn from(d: &Digester) -> DigestState {
        DigestState { bytes: d.bytes }
    }
}

/// Persisted per-upload-session progress. Hash state itself is not
/// serializable; finalize re-reads the assembled object to verify the
/// client digest instead.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DigestState {
    pub bytes: u64,
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;

    #[rstest]
    #[case::sha256("sha256:a665a45920422f9d417e4867efdc4fb8a04a1f3fff1fa07e998e86f7f7a27ae3", true)]
    #[case::sha512("sha512:ee26b0dd4af7e749aa1a8ee3c10ae9923f618980772e473f8819a5d4940e0db27ac185f8a0e1d5f84f88bc887fd67b143732c304cc5fa9ad8e6f57f50028a8ff", true)]
    #[case::unknown_algo("sha666:abcdef", false)]
    #[case::no_separator("sha256abcdef", false)]
    #[case::empty_encoded("sha256:", false)]
    #[case::empty_algo(":abcdef", false)]
    #[case::non_hex("sha256:zzzz", false)]
    fn validate_try_from(#[case] input: &str, #[case] ok: bool) {
        let actual: Result<OciDigest> = input.try_into();
        assert_eq!(actual.is_ok(), ok, "unexpected result for {input}: {actual:?}");
    }

    #[rstest]
    fn digest_roundtrip() {
        let dgst = OciDigest::from("abc".as_bytes());
        assert_eq!(
            String::from(&dgst),
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
        );
        let parsed: OciDigest = String::from(&dgst).as_str().try_into().unwrap();
        assert_eq!(parsed, dgst);
    }

    #[rstest]
    fn digester_matches_oneshot() {
        let mut digester = Digester::default();
        digester.update(b"hello ");
        digester.update(b"world");
        assert_eq!(digester.bytes(), 11);
        let streamed = digester.finalize();
        let oneshot = OciDigest::from("hello world".as_bytes());
        assert_eq!(streamed, oneshot);
    }

}
