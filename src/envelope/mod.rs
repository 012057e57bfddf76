//! Secure message envelope.
//!
//! Every datagram on the wire is an [`Envelope`]: the plaintext is cut into
//! chunks small enough for RSA-OAEP under the recipient's key, and each
//! chunk is signed with RSA-PSS under the sender's key. Chunking lets
//! payloads of arbitrary size ride a key-size-bound primitive; the per-chunk
//! signature binds each ciphertext to authenticated plaintext.
//!
//! An envelope may instead carry an error: then the chunk lists are empty
//! and the receiver surfaces the text verbatim.

use rsa::pss::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{LanscoutError, Result};

/// Authenticated, encrypted container of every on-wire plaintext.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    pub from: String,
    pub to: String,
    /// OAEP ciphertext chunks, in plaintext order.
    #[serde(with = "byte_chunks")]
    pub data: Vec<Vec<u8>>,
    /// PSS signature per chunk, same order and count as `data`.
    #[serde(with = "byte_chunks")]
    pub sig: Vec<Vec<u8>>,
    /// When set, the other fields are empty and this text is the message.
    pub err: Option<String>,
}

/// Largest plaintext slice that fits one OAEP-SHA256 block under `key`.
pub fn max_chunk_len(key: &RsaPublicKey) -> usize {
    key.size()
        .saturating_sub(2 * <Sha256 as Digest>::output_size() + 2)
}

impl Envelope {
    /// Encrypts `plaintext` for `to_key` and signs it with `from_key`.
    ///
    /// The plaintext is partitioned into consecutive slices of at most
    /// [`max_chunk_len`] bytes; an empty plaintext yields zero chunks.
    pub fn seal(
        from: &str,
        to: &str,
        from_key: &RsaPrivateKey,
        to_key: &RsaPublicKey,
        plaintext: &[u8],
    ) -> Result<Self> {
        let max = max_chunk_len(to_key);
        if max == 0 {
            return Err(LanscoutError::TooBig(plaintext.len()));
        }

        let mut rng = rand::thread_rng();
        let signer = SigningKey::<Sha256>::new(from_key.clone());
        let num = plaintext.len().div_ceil(max);
        let mut data = Vec::with_capacity(num);
        let mut sig = Vec::with_capacity(num);

        for chunk in plaintext.chunks(max) {
            let ciphertext = to_key
                .encrypt(&mut rng, Oaep::new::<Sha256>(), chunk)
                .map_err(LanscoutError::Encrypt)?;
            let signature = signer
                .try_sign_with_rng(&mut rng, chunk)
                .map_err(LanscoutError::Sign)?;
            data.push(ciphertext);
            sig.push(signature.to_vec());
        }

        Ok(Self {
            from: from.to_string(),
            to: to.to_string(),
            data,
            sig,
            err: None,
        })
    }

    /// Builds an error envelope carrying only `text`.
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            err: Some(text.into()),
            ..Self::default()
        }
    }

    /// Decrypts with `to_key` and verifies each chunk signature with
    /// `from_key`, returning the reassembled plaintext.
    ///
    /// Any chunk failure aborts the whole open; partial plaintext is never
    /// returned.
    pub fn open(&self, from_key: &RsaPublicKey, to_key: &RsaPrivateKey) -> Result<Vec<u8>> {
        if self.data.len() != self.sig.len() {
            return Err(LanscoutError::Verify(rsa::signature::Error::new()));
        }

        let verifier = VerifyingKey::<Sha256>::new(from_key.clone());
        let mut plaintext = Vec::new();

        for (chunk, sig) in self.data.iter().zip(self.sig.iter()) {
            let part = to_key
                .decrypt(Oaep::new::<Sha256>(), chunk)
                .map_err(LanscoutError::Decrypt)?;
            let signature =
                Signature::try_from(sig.as_slice()).map_err(LanscoutError::Verify)?;
            verifier
                .verify(&part, &signature)
                .map_err(LanscoutError::Verify)?;
            plaintext.extend_from_slice(&part);
        }

        Ok(plaintext)
    }

    /// Serializes the envelope to its wire form.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Deserializes an envelope from its wire form.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(buf)?)
    }
}

/// Serializes chunk lists as MessagePack binary blobs instead of integer
/// sequences; ciphertext would otherwise double in size on the wire.
mod byte_chunks {
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_bytes::{ByteBuf, Bytes};

    pub fn serialize<S: Serializer>(chunks: &[Vec<u8>], s: S) -> Result<S::Ok, S::Error> {
        let mut seq = s.serialize_seq(Some(chunks.len()))?;
        for chunk in chunks {
            seq.serialize_element(Bytes::new(chunk))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Vec<u8>>, D::Error> {
        let bufs = Vec::<ByteBuf>::deserialize(d)?;
        Ok(bufs.into_iter().map(ByteBuf::into_vec).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    struct TestKeys {
        client: RsaPrivateKey,
        server: RsaPrivateKey,
    }

    fn keys() -> &'static TestKeys {
        static KEYS: OnceLock<TestKeys> = OnceLock::new();
        KEYS.get_or_init(|| {
            let mut rng = rand::thread_rng();
            TestKeys {
                client: RsaPrivateKey::new(&mut rng, 1024).unwrap(),
                server: RsaPrivateKey::new(&mut rng, 1024).unwrap(),
            }
        })
    }

    #[test]
    fn seal_open_roundtrip() {
        let k = keys();
        let server_pub = RsaPublicKey::from(&k.server);
        let client_pub = RsaPublicKey::from(&k.client);

        let plaintext = b"request";
        let msg = Envelope::seal("alice", "master", &k.client, &server_pub, plaintext).unwrap();
        assert_eq!(msg.from, "alice");
        assert_eq!(msg.to, "master");
        assert_eq!(msg.data.len(), msg.sig.len());

        let opened = msg.open(&client_pub, &k.server).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn long_plaintext_is_chunked() {
        let k = keys();
        let server_pub = RsaPublicKey::from(&k.server);
        let client_pub = RsaPublicKey::from(&k.client);

        let max = max_chunk_len(&server_pub);
        let plaintext: Vec<u8> = (0..3 * max + 1).map(|i| i as u8).collect();

        let msg = Envelope::seal("alice", "master", &k.client, &server_pub, &plaintext).unwrap();
        assert_eq!(msg.data.len(), 4);

        let opened = msg.open(&client_pub, &k.server).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn empty_plaintext_has_no_chunks() {
        let k = keys();
        let server_pub = RsaPublicKey::from(&k.server);
        let client_pub = RsaPublicKey::from(&k.client);

        let msg = Envelope::seal("alice", "master", &k.client, &server_pub, b"").unwrap();
        assert!(msg.data.is_empty());
        assert_eq!(msg.open(&client_pub, &k.server).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn tampered_chunk_fails() {
        let k = keys();
        let server_pub = RsaPublicKey::from(&k.server);
        let client_pub = RsaPublicKey::from(&k.client);

        let mut msg =
            Envelope::seal("alice", "master", &k.client, &server_pub, b"request").unwrap();
        msg.data[0][0] ^= 0xff;

        assert!(matches!(
            msg.open(&client_pub, &k.server),
            Err(LanscoutError::Decrypt(_))
        ));
    }

    #[test]
    fn tampered_signature_fails() {
        let k = keys();
        let server_pub = RsaPublicKey::from(&k.server);
        let client_pub = RsaPublicKey::from(&k.client);

        let mut msg =
            Envelope::seal("alice", "master", &k.client, &server_pub, b"request").unwrap();
        msg.sig[0][0] ^= 0xff;

        assert!(matches!(
            msg.open(&client_pub, &k.server),
            Err(LanscoutError::Verify(_))
        ));
    }

    #[test]
    fn unbalanced_chunk_lists_fail() {
        let k = keys();
        let server_pub = RsaPublicKey::from(&k.server);
        let client_pub = RsaPublicKey::from(&k.client);

        let mut msg =
            Envelope::seal("alice", "master", &k.client, &server_pub, b"request").unwrap();
        msg.sig.pop();

        assert!(matches!(
            msg.open(&client_pub, &k.server),
            Err(LanscoutError::Verify(_))
        ));
    }

    #[test]
    fn signer_mismatch_fails() {
        let k = keys();
        let server_pub = RsaPublicKey::from(&k.server);

        let msg = Envelope::seal("alice", "master", &k.client, &server_pub, b"request").unwrap();
        // Verify against the wrong sender key.
        let wrong = RsaPublicKey::from(&k.server);
        assert!(matches!(
            msg.open(&wrong, &k.server),
            Err(LanscoutError::Verify(_))
        ));
    }

    #[test]
    fn wire_roundtrip() {
        let k = keys();
        let server_pub = RsaPublicKey::from(&k.server);
        let client_pub = RsaPublicKey::from(&k.client);

        let msg = Envelope::seal("alice", "master", &k.client, &server_pub, b"request").unwrap();
        let wire = msg.encode().unwrap();
        let decoded = Envelope::decode(&wire).unwrap();

        assert_eq!(decoded.from, msg.from);
        assert_eq!(decoded.data, msg.data);
        assert_eq!(decoded.open(&client_pub, &k.server).unwrap(), b"request");
    }

    #[test]
    fn error_envelope_roundtrip() {
        let msg = Envelope::error("protocol fail: request not understood");
        let wire = msg.encode().unwrap();
        let decoded = Envelope::decode(&wire).unwrap();

        assert!(decoded.data.is_empty());
        assert_eq!(
            decoded.err.as_deref(),
            Some("protocol fail: request not understood")
        );
    }
}
