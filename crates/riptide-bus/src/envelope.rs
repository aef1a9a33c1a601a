//! Message envelope and authenticated codec.
//!
//! One published event lives in a single contiguous buffer that is already
//! the cluster wire layout:
//!
//! ```text
//! [flags:1][filter:1 signed][id:8 LE][published:8 LE][channel_len:4 LE]
//! [channel bytes][message bytes]                    ← Envelope (plaintext)
//! [channel bytes][message bytes][nonce:24][tag:16]  ← SealedEnvelope
//! ```
//!
//! Field accessors are views into that buffer; nothing is copied out.
//! Keeping header, channel, and message contiguous makes the authenticated
//! transform in-place: the message region is encrypted where it sits, the
//! header and channel ride along as associated data, and the fixed-size
//! trailer is appended so `open` can locate everything without a side
//! channel.
//!
//! The seal/open pair is type-state: a [`SealedEnvelope`] exposes no field
//! accessors, so a frame that fails authentication is discarded whole — a
//! partial parse of unauthenticated bytes is unrepresentable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{KeyInit, Tag, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::secret::SecretKeys;

// ---------------------------------------------------------------------------
// Wire layout constants
// ---------------------------------------------------------------------------

const FLAGS_AT: usize = 0;
const FILTER_AT: usize = 1;
const ID_AT: usize = 2;
const PUBLISHED_AT: usize = 10;
const CHANNEL_LEN_AT: usize = 18;

/// Fixed header length preceding the channel bytes.
pub const HEADER_LEN: usize = 22;
/// XChaCha20 nonce length.
pub const NONCE_LEN: usize = 24;
/// Poly1305 tag length.
pub const TAG_LEN: usize = 16;
/// Fixed trailer appended by `seal`: nonce plus authentication tag.
pub const TRAILER_LEN: usize = NONCE_LEN + TAG_LEN;

/// Process-monotonic envelope id source.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// Flags
// ---------------------------------------------------------------------------

/// Envelope flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u8);

impl Flags {
    /// The message payload is JSON-encoded.
    pub const JSON: Self = Self(0b01);
    /// The envelope is cluster-scoped (forwarded to remote processes).
    pub const CLUSTER: Self = Self(0b10);

    /// No flags set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Returns `true` if the JSON bit is set.
    #[must_use]
    pub const fn is_json(self) -> bool {
        self.0 & Self::JSON.0 != 0
    }

    /// Returns `true` if the cluster bit is set.
    #[must_use]
    pub const fn is_cluster(self) -> bool {
        self.0 & Self::CLUSTER.0 != 0
    }

    /// Raw wire byte. Unknown bits pass through untouched.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }
}

impl std::ops::BitOr for Flags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// ---------------------------------------------------------------------------
// CodecError
// ---------------------------------------------------------------------------

/// Errors from the envelope codec.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Channel length exceeds the 32-bit wire field.
    #[error("Channel length exceeds the wire limit")]
    ChannelTooLong,

    /// Frame too short, or its channel-length field points past the end.
    #[error("Frame too short to hold an envelope")]
    Truncated,

    /// Decrypted channel bytes are not valid UTF-8.
    #[error("Channel bytes are not valid UTF-8")]
    ChannelEncoding,

    /// Payload encryption failed.
    #[error("Payload encryption failed")]
    Encrypt,

    /// Authentication failed. The whole frame is discarded; no field of it
    /// may be used.
    #[error("Frame authentication failed")]
    Authentication,
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One published event: routing metadata plus payload, in one allocation.
///
/// Cheaply shareable as `Arc<Envelope>`; the buffer is freed exactly once
/// when the last delivery task releases its handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    buf: Vec<u8>,
}

impl Envelope {
    /// Authors an envelope for `channel` carrying `message`.
    ///
    /// Assigns a process-monotonic id and the current Unix-millisecond
    /// publish time.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::ChannelTooLong`] if the channel does not fit the
    /// 32-bit wire field.
    #[allow(clippy::cast_sign_loss)] // Filter is a raw wire byte
    pub fn author(
        channel: &str,
        message: &[u8],
        filter: i8,
        flags: Flags,
    ) -> Result<Self, CodecError> {
        let channel_len =
            u32::try_from(channel.len()).map_err(|_| CodecError::ChannelTooLong)?;

        let mut buf = Vec::with_capacity(HEADER_LEN + channel.len() + message.len() + TRAILER_LEN);
        buf.push(flags.bits());
        buf.push(filter as u8);
        buf.extend_from_slice(&NEXT_ID.fetch_add(1, Ordering::Relaxed).to_le_bytes());
        buf.extend_from_slice(&unix_millis().to_le_bytes());
        buf.extend_from_slice(&channel_len.to_le_bytes());
        buf.extend_from_slice(channel.as_bytes());
        buf.extend_from_slice(message);
        Ok(Self { buf })
    }

    /// Flag bits.
    #[must_use]
    pub fn flags(&self) -> Flags {
        Flags(self.buf[FLAGS_AT])
    }

    /// Signed filter value partitioning the channel namespace.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)] // Filter is a raw wire byte
    pub fn filter(&self) -> i8 {
        self.buf[FILTER_AT] as i8
    }

    /// Process-monotonic envelope id.
    #[must_use]
    pub fn id(&self) -> u64 {
        read_u64(&self.buf, ID_AT)
    }

    /// Publish time, Unix milliseconds.
    #[must_use]
    pub fn published(&self) -> u64 {
        read_u64(&self.buf, PUBLISHED_AT)
    }

    /// Channel name, viewed in place.
    #[must_use]
    pub fn channel(&self) -> &str {
        // Channel bytes are validated UTF-8 at both construction paths
        // (`author` takes &str, `open` checks before returning).
        std::str::from_utf8(&self.buf[HEADER_LEN..HEADER_LEN + self.channel_len()])
            .unwrap_or("")
    }

    /// Message payload, viewed in place.
    #[must_use]
    pub fn message(&self) -> &[u8] {
        &self.buf[HEADER_LEN + self.channel_len()..]
    }

    fn channel_len(&self) -> usize {
        read_u32(&self.buf, CHANNEL_LEN_AT) as usize
    }

    /// Encrypts the message region in place and appends the trailer,
    /// consuming the plaintext envelope.
    ///
    /// Header and channel become associated data: they stay readable on the
    /// wire but any modification fails authentication at `open`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encrypt`] if the AEAD rejects the input.
    pub fn seal(mut self, keys: &SecretKeys) -> Result<SealedEnvelope, CodecError> {
        let nonce = self.fresh_nonce();
        let split = HEADER_LEN + self.channel_len();

        let key = keys.unmask();
        let cipher = XChaCha20Poly1305::new((&*key).into());
        let (aad, message) = self.buf.split_at_mut(split);
        let tag = cipher
            .encrypt_in_place_detached(XNonce::from_slice(&nonce), aad, message)
            .map_err(|_| CodecError::Encrypt)?;

        self.buf.extend_from_slice(&nonce);
        self.buf.extend_from_slice(tag.as_slice());
        Ok(SealedEnvelope { buf: self.buf })
    }

    /// Seals a copy, leaving this envelope readable for local delivery.
    ///
    /// # Errors
    ///
    /// Same as [`Envelope::seal`].
    pub fn sealed_copy(&self, keys: &SecretKeys) -> Result<SealedEnvelope, CodecError> {
        Self {
            buf: self.buf.clone(),
        }
        .seal(keys)
    }

    /// Per-message nonce: id, publish time, and fresh random bits.
    fn fresh_nonce(&self) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..8].copy_from_slice(&self.buf[ID_AT..ID_AT + 8]);
        nonce[8..16].copy_from_slice(&self.buf[PUBLISHED_AT..PUBLISHED_AT + 8]);
        OsRng.fill_bytes(&mut nonce[16..]);
        nonce
    }
}

// ---------------------------------------------------------------------------
// SealedEnvelope
// ---------------------------------------------------------------------------

/// An envelope in cluster wire form: encrypted message, authenticated
/// header/channel, fixed trailer.
///
/// Deliberately opaque — the only way to read any field is a successful
/// [`SealedEnvelope::open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedEnvelope {
    buf: Vec<u8>,
}

impl SealedEnvelope {
    /// Adopts received wire bytes after structural length checks.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Truncated`] if the frame cannot hold a header
    /// and trailer, or its channel-length field points past the end.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Result<Self, CodecError> {
        let buf = bytes.into();
        if buf.len() < HEADER_LEN + TRAILER_LEN {
            return Err(CodecError::Truncated);
        }
        let channel_len = read_u32(&buf, CHANNEL_LEN_AT) as usize;
        if HEADER_LEN + channel_len > buf.len() - TRAILER_LEN {
            return Err(CodecError::Truncated);
        }
        Ok(Self { buf })
    }

    /// The wire bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Consumes the frame, returning the wire bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Decrypts in place, the exact inverse of [`Envelope::seal`].
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Authentication`] if any byte of the frame was
    /// altered (or the keys differ); the frame is dropped whole and no field
    /// of it is recoverable. Returns [`CodecError::ChannelEncoding`] if an
    /// authenticated frame somehow carries non-UTF-8 channel bytes.
    pub fn open(mut self, keys: &SecretKeys) -> Result<Envelope, CodecError> {
        let trailer_at = self.buf.len() - TRAILER_LEN;
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&self.buf[trailer_at..trailer_at + NONCE_LEN]);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&self.buf[trailer_at + NONCE_LEN..]);
        self.buf.truncate(trailer_at);

        let split = HEADER_LEN + read_u32(&self.buf, CHANNEL_LEN_AT) as usize;
        debug_assert!(split <= self.buf.len(), "length-checked at construction");

        let key = keys.unmask();
        let cipher = XChaCha20Poly1305::new((&*key).into());
        let (aad, message) = self.buf.split_at_mut(split);
        cipher
            .decrypt_in_place_detached(
                XNonce::from_slice(&nonce),
                aad,
                message,
                Tag::from_slice(&tag),
            )
            .map_err(|_| CodecError::Authentication)?;

        std::str::from_utf8(&aad[HEADER_LEN..]).map_err(|_| CodecError::ChannelEncoding)?;
        Ok(Envelope { buf: self.buf })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

#[allow(clippy::cast_possible_truncation)] // Millis wrap in ~584 million years
fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> SecretKeys {
        SecretKeys::from_passphrase("codec test secret")
    }

    // --- Authoring tests ---

    #[test]
    fn test_author_fields_view_the_buffer() {
        let env = Envelope::author("alerts/disk", b"90% full", -3, Flags::JSON).unwrap();
        assert_eq!(env.channel(), "alerts/disk");
        assert_eq!(env.message(), b"90% full");
        assert_eq!(env.filter(), -3);
        assert!(env.flags().is_json());
        assert!(!env.flags().is_cluster());
        assert!(env.id() > 0);
        assert!(env.published() > 0);
    }

    #[test]
    fn test_author_ids_are_monotonic() {
        let a = Envelope::author("c", b"", 0, Flags::empty()).unwrap();
        let b = Envelope::author("c", b"", 0, Flags::empty()).unwrap();
        assert!(b.id() > a.id());
    }

    #[test]
    fn test_author_empty_channel_and_message() {
        let env = Envelope::author("", b"", 0, Flags::empty()).unwrap();
        assert_eq!(env.channel(), "");
        assert_eq!(env.message(), b"");
    }

    #[test]
    fn test_negative_filter_roundtrips_through_wire_byte() {
        let env = Envelope::author("c", b"", -127, Flags::empty()).unwrap();
        assert_eq!(env.filter(), -127);
    }

    // --- Seal / open tests ---

    #[test]
    fn test_seal_open_roundtrip() {
        let keys = keys();
        let env =
            Envelope::author("pubsub/metrics", b"payload bytes", 17, Flags::CLUSTER).unwrap();
        let (id, published) = (env.id(), env.published());

        let opened = env.seal(&keys).unwrap().open(&keys).unwrap();
        assert_eq!(opened.channel(), "pubsub/metrics");
        assert_eq!(opened.message(), b"payload bytes");
        assert_eq!(opened.filter(), 17);
        assert!(opened.flags().is_cluster());
        assert_eq!(opened.id(), id);
        assert_eq!(opened.published(), published);
    }

    #[test]
    fn test_seal_appends_fixed_trailer() {
        let keys = keys();
        let env = Envelope::author("c", b"msg", 0, Flags::empty()).unwrap();
        let plain_len = HEADER_LEN + 1 + 3;
        let sealed = env.seal(&keys).unwrap();
        assert_eq!(sealed.as_bytes().len(), plain_len + TRAILER_LEN);
    }

    #[test]
    fn test_open_with_wrong_keys_fails() {
        let sealed = Envelope::author("c", b"secret", 0, Flags::empty())
            .unwrap()
            .seal(&keys())
            .unwrap();
        let other = SecretKeys::from_passphrase("not the same");
        assert!(matches!(
            sealed.open(&other),
            Err(CodecError::Authentication)
        ));
    }

    #[test]
    fn test_any_single_bit_flip_fails_authentication() {
        let keys = keys();
        let wire = Envelope::author("pubsub/x", b"tamper target", -1, Flags::CLUSTER)
            .unwrap()
            .seal(&keys)
            .unwrap()
            .into_bytes();

        // Every byte: header, channel, ciphertext, nonce, tag.
        for at in 0..wire.len() {
            let mut bent = wire.clone();
            bent[at] ^= 0x01;
            let sealed = SealedEnvelope::from_bytes(bent).unwrap();
            assert!(
                matches!(sealed.open(&keys), Err(CodecError::Authentication)),
                "flip at byte {at} must fail authentication"
            );
        }
    }

    #[test]
    fn test_sealed_copy_leaves_original_readable() {
        let keys = keys();
        let env = Envelope::author("c", b"both ways", 5, Flags::empty()).unwrap();
        let frame = env.sealed_copy(&keys).unwrap();

        assert_eq!(env.message(), b"both ways");
        let opened = frame.open(&keys).unwrap();
        assert_eq!(opened.message(), b"both ways");
        assert_eq!(opened.id(), env.id());
    }

    #[test]
    fn test_nonces_differ_per_seal() {
        let keys = keys();
        let env = Envelope::author("c", b"m", 0, Flags::empty()).unwrap();
        let a = env.sealed_copy(&keys).unwrap().into_bytes();
        let b = env.sealed_copy(&keys).unwrap().into_bytes();
        // Same plaintext, different random nonce bits → different wire bytes.
        assert_ne!(a, b);
    }

    // --- Structural validation tests ---

    #[test]
    fn test_from_bytes_rejects_short_frames() {
        assert!(matches!(
            SealedEnvelope::from_bytes(vec![0u8; HEADER_LEN + TRAILER_LEN - 1]),
            Err(CodecError::Truncated)
        ));
    }

    #[test]
    fn test_from_bytes_rejects_lying_channel_len() {
        let keys = keys();
        let mut wire = Envelope::author("ch", b"m", 0, Flags::empty())
            .unwrap()
            .seal(&keys)
            .unwrap()
            .into_bytes();
        // Claim a channel longer than the whole frame.
        wire[CHANNEL_LEN_AT..CHANNEL_LEN_AT + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            SealedEnvelope::from_bytes(wire),
            Err(CodecError::Truncated)
        ));
    }
}
