//! The `MIF1` encrypted file blob codec.
//!
//! Four on-disk versions, all keyed by a per-file 32-byte key; the decoder
//! accepts any of them, the encoders emit:
//!
//!   v1 — legacy: `prefix(8) || nonce(24) || mac(16) || cipher` (single AEAD)
//!   v2 — adaptive compression: prefix carries flags/algo and the original,
//!        stage-1 and stage-2 sizes; payload is a single AEAD over either the
//!        raw bytes or a deflate(1)-then-deflate(9) double compression
//!   v3 — chunked: 256 KiB plaintext chunks, each sealed independently;
//!        per-chunk nonce = base nonce with the chunk index in its last 8
//!        bytes; AD is the whole header prefix
//!   v4 — chunked + padded: 128 KiB plaintext chunks, each wrapped with the
//!        8-byte pad header and padded to the smallest file bucket
//!        {64, 96, 128, 160, 192, 256, 384} KiB (larger rounds to the next
//!        4 KiB) before sealing, so chunk sizes leak nothing about content
//!
//! Hard bounds, checked before any allocation: plaintext ≤ 300 MiB, blob
//! ≤ 320 MiB, chunk frame ≤ 4 MiB. Long operations poll a cancellation
//! token between chunks; partial plaintext is wiped on every failure path.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use zeroize::Zeroizing;

use mi_crypto::{aead, CryptoError};

pub const BLOB_MAGIC: [u8; 4] = *b"MIF1";

const VERSION_V1: u8 = 1;
const VERSION_V2: u8 = 2;
const VERSION_V3: u8 = 3;
const VERSION_V4: u8 = 4;

const ALGO_RAW: u8 = 0;
const ALGO_DEFLATE: u8 = 1;
const FLAG_DOUBLE_COMPRESSION: u8 = 0x01;

pub const MAX_FILE_BYTES: u64 = 300 * 1024 * 1024;
pub const MAX_BLOB_BYTES: u64 = 320 * 1024 * 1024;
pub const V3_CHUNK_BYTES: u32 = 256 * 1024;
pub const V4_PLAIN_CHUNK_BYTES: u32 = 128 * 1024;
/// Upper bound on one chunk frame (mac + ciphertext share it with the MAC).
pub const MAX_CHUNK_FRAME_BYTES: usize = 4 * 1024 * 1024;

const V1_PREFIX_BYTES: usize = 4 + 1 + 3;
const V1_HEADER_BYTES: usize = V1_PREFIX_BYTES + 24 + 16;
const V2_PREFIX_BYTES: usize = 4 + 1 + 1 + 1 + 1 + 8 + 8 + 8;
const V34_PREFIX_BYTES: usize = 4 + 1 + 1 + 1 + 1 + 4 + 8 + 24;

const V4_PAD_BUCKETS: [usize; 7] = [
    64 * 1024,
    96 * 1024,
    128 * 1024,
    160 * 1024,
    192 * 1024,
    256 * 1024,
    384 * 1024,
];
const CHUNK_PAD_HEADER_BYTES: usize = 8;
const CHUNK_PAD_MAGIC: [u8; 4] = *b"MIPD";

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("file too large")]
    TooLarge,
    #[error("blob malformed")]
    Malformed,
    #[error("compression failed")]
    Compression,
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

// ── Cancellation ─────────────────────────────────────────────────────────────

/// Cooperative cancellation flag, polled between chunks.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

fn check_cancel(cancel: Option<&CancelToken>) -> Result<(), BlobError> {
    match cancel {
        Some(token) if token.is_cancelled() => Err(BlobError::Cancelled),
        _ => Ok(()),
    }
}

// ── Compression ──────────────────────────────────────────────────────────────

fn deflate(data: &[u8], level: u32) -> Result<Zeroizing<Vec<u8>>, BlobError> {
    let mut enc = ZlibEncoder::new(
        Vec::with_capacity(data.len() / 2 + 64),
        Compression::new(level),
    );
    enc.write_all(data).map_err(|_| BlobError::Compression)?;
    Ok(Zeroizing::new(enc.finish().map_err(|_| BlobError::Compression)?))
}

fn inflate(data: &[u8], expected_len: usize) -> Result<Zeroizing<Vec<u8>>, BlobError> {
    let mut out = Zeroizing::new(Vec::with_capacity(expected_len));
    let mut dec = ZlibDecoder::new(data).take(expected_len as u64 + 1);
    dec.read_to_end(&mut out).map_err(|_| BlobError::Compression)?;
    if out.len() != expected_len {
        return Err(BlobError::Compression);
    }
    Ok(out)
}

/// Extensions whose content is already entropy-coded; deflate would only
/// burn CPU on them.
pub fn looks_already_compressed(file_name: &str) -> bool {
    let ext = match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => ext.to_ascii_lowercase(),
        _ => return false,
    };
    matches!(
        ext.as_str(),
        "jpg" | "jpeg" | "png" | "gif" | "webp" | "bmp" | "ico" | "heic"
            | "mp4" | "mkv" | "mov" | "webm" | "avi" | "flv" | "m4v"
            | "mp3" | "m4a" | "aac" | "ogg" | "opus" | "flac" | "wav"
            | "zip" | "rar" | "7z" | "gz" | "bz2" | "xz" | "zst"
            | "pdf" | "docx" | "xlsx" | "pptx"
    )
}

// ── Chunk padding (v4) ───────────────────────────────────────────────────────

/// Padded size for a v4 chunk of `min_len = 8 + plain_len` bytes.
/// `None` when the chunk cannot fit a 4 MiB frame.
fn file_chunk_target(min_len: usize) -> Option<usize> {
    let limit = MAX_CHUNK_FRAME_BYTES - 16;
    if min_len == 0 || min_len > limit {
        return None;
    }
    for bucket in V4_PAD_BUCKETS {
        if bucket >= min_len {
            return Some(bucket);
        }
    }
    let round = min_len.div_ceil(4096) * 4096;
    (round <= limit).then_some(round)
}

fn pad_chunk(plain: &[u8]) -> Result<Zeroizing<Vec<u8>>, BlobError> {
    let target = file_chunk_target(CHUNK_PAD_HEADER_BYTES + plain.len())
        .ok_or(BlobError::Malformed)?;
    let mut out = Zeroizing::new(Vec::with_capacity(target));
    out.extend_from_slice(&CHUNK_PAD_MAGIC);
    out.extend_from_slice(&(plain.len() as u32).to_le_bytes());
    out.extend_from_slice(plain);
    if out.len() < target {
        let start = out.len();
        out.resize(target, 0);
        OsRng.fill_bytes(&mut out[start..]);
    }
    Ok(out)
}

fn unpad_chunk(padded: &[u8], expected_len: usize) -> Result<&[u8], BlobError> {
    if padded.len() < CHUNK_PAD_HEADER_BYTES || padded[..4] != CHUNK_PAD_MAGIC {
        return Err(BlobError::Malformed);
    }
    let len = u32::from_le_bytes(padded[4..8].try_into().unwrap()) as usize;
    if len != expected_len || CHUNK_PAD_HEADER_BYTES + len > padded.len() {
        return Err(BlobError::Malformed);
    }
    Ok(&padded[CHUNK_PAD_HEADER_BYTES..CHUNK_PAD_HEADER_BYTES + len])
}

// ── Header builders ──────────────────────────────────────────────────────────

fn v2_prefix(flags: u8, algo: u8, original: u64, stage1: u64, stage2: u64) -> Vec<u8> {
    let mut h = Vec::with_capacity(V2_PREFIX_BYTES);
    h.extend_from_slice(&BLOB_MAGIC);
    h.push(VERSION_V2);
    h.push(flags);
    h.push(algo);
    h.push(0);
    h.extend_from_slice(&original.to_le_bytes());
    h.extend_from_slice(&stage1.to_le_bytes());
    h.extend_from_slice(&stage2.to_le_bytes());
    h
}

fn chunked_prefix(version: u8, chunk_size: u32, original: u64, base_nonce: &[u8; 24]) -> Vec<u8> {
    let mut h = Vec::with_capacity(V34_PREFIX_BYTES);
    h.extend_from_slice(&BLOB_MAGIC);
    h.push(version);
    h.push(0);
    h.push(ALGO_RAW);
    h.push(0);
    h.extend_from_slice(&chunk_size.to_le_bytes());
    h.extend_from_slice(&original.to_le_bytes());
    h.extend_from_slice(base_nonce);
    h
}

fn chunk_nonce(base: &[u8; 24], index: u64) -> [u8; 24] {
    let mut nonce = *base;
    nonce[16..].copy_from_slice(&index.to_le_bytes());
    nonce
}

fn random_nonce() -> [u8; 24] {
    let mut n = [0u8; 24];
    OsRng.fill_bytes(&mut n);
    n
}

fn check_plain_bounds(plaintext: &[u8]) -> Result<(), BlobError> {
    if plaintext.is_empty() {
        return Err(BlobError::Malformed);
    }
    if plaintext.len() as u64 > MAX_FILE_BYTES {
        return Err(BlobError::TooLarge);
    }
    Ok(())
}

// ── Encoders ─────────────────────────────────────────────────────────────────

/// v1 legacy single-AEAD blob. Kept for decrypt compatibility tests and old
/// stored files; new uploads use [`encrypt_blob_adaptive`] or the chunked
/// encoders.
pub fn encrypt_blob_v1(plaintext: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, BlobError> {
    check_plain_bounds(plaintext)?;
    let mut prefix = Vec::with_capacity(V1_PREFIX_BYTES);
    prefix.extend_from_slice(&BLOB_MAGIC);
    prefix.push(VERSION_V1);
    prefix.extend_from_slice(&[0, 0, 0]);

    let nonce = random_nonce();
    let (cipher, mac) = aead::seal_detached(key, &nonce, plaintext, &prefix)?;

    let mut out = Vec::with_capacity(V1_HEADER_BYTES + cipher.len());
    out.extend_from_slice(&prefix);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&mac);
    out.extend_from_slice(&cipher);
    Ok(out)
}

fn seal_v2(prefix: Vec<u8>, payload: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, BlobError> {
    let nonce = random_nonce();
    let (cipher, mac) = aead::seal_detached(key, &nonce, payload, &prefix)?;
    let mut out = Vec::with_capacity(prefix.len() + 24 + 16 + cipher.len());
    out.extend_from_slice(&prefix);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&mac);
    out.extend_from_slice(&cipher);
    Ok(out)
}

/// Adaptive v2 encoder: raw for already-compressed content, otherwise a
/// deflate(1) probe followed by deflate(9) of the probe output when it pays.
pub fn encrypt_blob_adaptive(
    plaintext: &[u8],
    key: &[u8; 32],
    file_name: &str,
    cancel: Option<&CancelToken>,
) -> Result<Vec<u8>, BlobError> {
    check_plain_bounds(plaintext)?;
    let original = plaintext.len() as u64;

    if looks_already_compressed(file_name) {
        return seal_v2(
            v2_prefix(0, ALGO_RAW, original, 0, original),
            plaintext,
            key,
        );
    }

    check_cancel(cancel)?;
    let stage1 = deflate(plaintext, 1)?;
    if stage1.len() >= plaintext.len() {
        return seal_v2(
            v2_prefix(0, ALGO_RAW, original, 0, original),
            plaintext,
            key,
        );
    }

    check_cancel(cancel)?;
    let stage2 = deflate(&stage1, 9)?;
    seal_v2(
        v2_prefix(
            FLAG_DOUBLE_COMPRESSION,
            ALGO_DEFLATE,
            original,
            stage1.len() as u64,
            stage2.len() as u64,
        ),
        &stage2,
        key,
    )
}

fn encrypt_chunked(
    plaintext: &[u8],
    key: &[u8; 32],
    version: u8,
    chunk_size: u32,
    cancel: Option<&CancelToken>,
) -> Result<Vec<u8>, BlobError> {
    check_plain_bounds(plaintext)?;
    let base_nonce = random_nonce();
    let prefix = chunked_prefix(version, chunk_size, plaintext.len() as u64, &base_nonce);

    let mut out = Vec::with_capacity(V34_PREFIX_BYTES + plaintext.len() + 64);
    out.extend_from_slice(&prefix);

    for (index, chunk) in plaintext.chunks(chunk_size as usize).enumerate() {
        check_cancel(cancel)?;
        let nonce = chunk_nonce(&base_nonce, index as u64);
        let (cipher, mac) = if version == VERSION_V4 {
            let padded = pad_chunk(chunk)?;
            aead::seal_detached(key, &nonce, &padded, &prefix)?
        } else {
            aead::seal_detached(key, &nonce, chunk, &prefix)?
        };
        out.extend_from_slice(&mac);
        out.extend_from_slice(&cipher);
    }
    if out.len() as u64 > MAX_BLOB_BYTES {
        return Err(BlobError::TooLarge);
    }
    Ok(out)
}

/// v3: independent 256 KiB chunks, no padding.
pub fn encrypt_blob_v3(
    plaintext: &[u8],
    key: &[u8; 32],
    cancel: Option<&CancelToken>,
) -> Result<Vec<u8>, BlobError> {
    encrypt_chunked(plaintext, key, VERSION_V3, V3_CHUNK_BYTES, cancel)
}

/// v4: 128 KiB chunks padded to size buckets before sealing.
pub fn encrypt_blob_v4(
    plaintext: &[u8],
    key: &[u8; 32],
    cancel: Option<&CancelToken>,
) -> Result<Vec<u8>, BlobError> {
    encrypt_chunked(plaintext, key, VERSION_V4, V4_PLAIN_CHUNK_BYTES, cancel)
}

// ── Decoder ──────────────────────────────────────────────────────────────────

/// Decrypt any blob version. Bounds are validated before allocation; the
/// returned plaintext (and any partial buffer on failure) is wiped on drop.
pub fn decrypt_blob(
    blob: &[u8],
    key: &[u8; 32],
    cancel: Option<&CancelToken>,
) -> Result<Zeroizing<Vec<u8>>, BlobError> {
    if blob.len() as u64 > MAX_BLOB_BYTES {
        return Err(BlobError::TooLarge);
    }
    if blob.len() < V1_HEADER_BYTES || blob[..4] != BLOB_MAGIC {
        return Err(BlobError::Malformed);
    }
    match blob[4] {
        VERSION_V1 => decrypt_v1(blob, key),
        VERSION_V2 => decrypt_v2(blob, key),
        VERSION_V3 | VERSION_V4 => decrypt_chunked(blob, key, cancel),
        _ => Err(BlobError::Malformed),
    }
}

fn decrypt_v1(blob: &[u8], key: &[u8; 32]) -> Result<Zeroizing<Vec<u8>>, BlobError> {
    let prefix = &blob[..V1_PREFIX_BYTES];
    let nonce: [u8; 24] = blob[V1_PREFIX_BYTES..V1_PREFIX_BYTES + 24].try_into().unwrap();
    let mac: [u8; 16] = blob[V1_PREFIX_BYTES + 24..V1_HEADER_BYTES].try_into().unwrap();
    let cipher = &blob[V1_HEADER_BYTES..];
    Ok(aead::open_detached(key, &nonce, cipher, &mac, prefix)?)
}

fn decrypt_v2(blob: &[u8], key: &[u8; 32]) -> Result<Zeroizing<Vec<u8>>, BlobError> {
    let header_bytes = V2_PREFIX_BYTES + 24 + 16;
    if blob.len() < header_bytes {
        return Err(BlobError::Malformed);
    }
    let flags = blob[5];
    let algo = blob[6];
    let original = u64::from_le_bytes(blob[8..16].try_into().unwrap());
    let stage1 = u64::from_le_bytes(blob[16..24].try_into().unwrap());
    let stage2 = u64::from_le_bytes(blob[24..32].try_into().unwrap());
    if original == 0 || original > MAX_FILE_BYTES {
        return Err(BlobError::Malformed);
    }
    if stage2 == 0 || stage2 > MAX_BLOB_BYTES {
        return Err(BlobError::Malformed);
    }

    let prefix = &blob[..V2_PREFIX_BYTES];
    let nonce: [u8; 24] = blob[V2_PREFIX_BYTES..V2_PREFIX_BYTES + 24].try_into().unwrap();
    let mac: [u8; 16] = blob[V2_PREFIX_BYTES + 24..header_bytes].try_into().unwrap();
    let cipher = &blob[header_bytes..];
    if cipher.len() as u64 != stage2 {
        return Err(BlobError::Malformed);
    }

    let sealed_plain = aead::open_detached(key, &nonce, cipher, &mac, prefix)?;

    if flags & FLAG_DOUBLE_COMPRESSION == 0 {
        return match algo {
            ALGO_RAW => {
                if sealed_plain.len() as u64 != original {
                    return Err(BlobError::Malformed);
                }
                Ok(sealed_plain)
            }
            ALGO_DEFLATE => inflate(&sealed_plain, original as usize),
            _ => Err(BlobError::Malformed),
        };
    }

    if algo != ALGO_DEFLATE {
        return Err(BlobError::Malformed);
    }
    if stage1 == 0 || stage1 > MAX_BLOB_BYTES {
        return Err(BlobError::Malformed);
    }
    let stage1_plain = inflate(&sealed_plain, stage1 as usize)?;
    inflate(&stage1_plain, original as usize)
}

fn decrypt_chunked(
    blob: &[u8],
    key: &[u8; 32],
    cancel: Option<&CancelToken>,
) -> Result<Zeroizing<Vec<u8>>, BlobError> {
    if blob.len() < V34_PREFIX_BYTES + 16 + 1 {
        return Err(BlobError::Malformed);
    }
    let version = blob[4];
    let algo = blob[6];
    if algo != ALGO_RAW {
        return Err(BlobError::Malformed);
    }
    let chunk_size = u32::from_le_bytes(blob[8..12].try_into().unwrap());
    let original = u64::from_le_bytes(blob[12..20].try_into().unwrap());
    let base_nonce: [u8; 24] = blob[20..44].try_into().unwrap();

    if chunk_size == 0 || chunk_size as usize > MAX_CHUNK_FRAME_BYTES - 16 {
        return Err(BlobError::Malformed);
    }
    if original == 0 || original > MAX_FILE_BYTES {
        return Err(BlobError::Malformed);
    }
    let chunks = original.div_ceil(u64::from(chunk_size));
    if chunks == 0 || chunks > (1 << 31) {
        return Err(BlobError::Malformed);
    }

    // The whole frame layout is computable from the header; verify before
    // touching any ciphertext.
    let mut expect = V34_PREFIX_BYTES as u64;
    for index in 0..chunks {
        let want = plain_chunk_len(original, chunk_size, index);
        let sealed = sealed_chunk_len(version, want)?;
        expect += 16 + sealed as u64;
    }
    if expect != blob.len() as u64 {
        return Err(BlobError::Malformed);
    }

    let prefix = &blob[..V34_PREFIX_BYTES];
    let mut out = Zeroizing::new(Vec::with_capacity(original as usize));
    let mut blob_off = V34_PREFIX_BYTES;
    for index in 0..chunks {
        check_cancel(cancel)?;
        let want = plain_chunk_len(original, chunk_size, index);
        let sealed = sealed_chunk_len(version, want)?;
        let mac: [u8; 16] = blob[blob_off..blob_off + 16].try_into().unwrap();
        let cipher = &blob[blob_off + 16..blob_off + 16 + sealed];
        let nonce = chunk_nonce(&base_nonce, index);
        let chunk_plain = aead::open_detached(key, &nonce, cipher, &mac, prefix)?;
        if version == VERSION_V4 {
            out.extend_from_slice(unpad_chunk(&chunk_plain, want)?);
        } else {
            if chunk_plain.len() != want {
                return Err(BlobError::Malformed);
            }
            out.extend_from_slice(&chunk_plain);
        }
        blob_off += 16 + sealed;
    }
    if out.len() as u64 != original {
        return Err(BlobError::Malformed);
    }
    Ok(out)
}

fn plain_chunk_len(original: u64, chunk_size: u32, index: u64) -> usize {
    let start = index * u64::from(chunk_size);
    (original - start).min(u64::from(chunk_size)) as usize
}

fn sealed_chunk_len(version: u8, plain_len: usize) -> Result<usize, BlobError> {
    if version == VERSION_V4 {
        file_chunk_target(CHUNK_PAD_HEADER_BYTES + plain_len).ok_or(BlobError::Malformed)
    } else {
        Ok(plain_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [0x4D; 32];

    fn compressible(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i / 64) as u8).collect()
    }

    fn noisy(len: usize) -> Vec<u8> {
        let mut v = vec![0u8; len];
        OsRng.fill_bytes(&mut v);
        v
    }

    #[test]
    fn v1_roundtrip() {
        let plain = compressible(10_000);
        let blob = encrypt_blob_v1(&plain, &KEY).unwrap();
        assert_eq!(decrypt_blob(&blob, &KEY, None).unwrap().as_slice(), plain);
    }

    #[test]
    fn v2_double_compression_roundtrip() {
        let plain = compressible(50_000);
        let blob = encrypt_blob_adaptive(&plain, &KEY, "notes.txt", None).unwrap();
        assert_eq!(blob[4], VERSION_V2);
        assert_eq!(blob[5] & FLAG_DOUBLE_COMPRESSION, FLAG_DOUBLE_COMPRESSION);
        assert!(blob.len() < plain.len()); // it actually compressed
        assert_eq!(decrypt_blob(&blob, &KEY, None).unwrap().as_slice(), plain);
    }

    #[test]
    fn v2_raw_for_compressed_extension() {
        let plain = compressible(5_000);
        let blob = encrypt_blob_adaptive(&plain, &KEY, "photo.JPG", None).unwrap();
        assert_eq!(blob[4], VERSION_V2);
        assert_eq!(blob[5], 0);
        assert_eq!(blob[6], ALGO_RAW);
        assert_eq!(decrypt_blob(&blob, &KEY, None).unwrap().as_slice(), plain);
    }

    #[test]
    fn v2_raw_when_deflate_does_not_pay() {
        let plain = noisy(8_192);
        let blob = encrypt_blob_adaptive(&plain, &KEY, "data.bin", None).unwrap();
        assert_eq!(blob[6], ALGO_RAW);
        assert_eq!(decrypt_blob(&blob, &KEY, None).unwrap().as_slice(), plain);
    }

    #[test]
    fn v3_roundtrip_multiple_chunks() {
        let plain = noisy(V3_CHUNK_BYTES as usize * 2 + 77);
        let blob = encrypt_blob_v3(&plain, &KEY, None).unwrap();
        assert_eq!(blob[4], VERSION_V3);
        // prefix + 3 chunks * (mac + chunk)
        assert_eq!(
            blob.len(),
            V34_PREFIX_BYTES + plain.len() + 3 * 16
        );
        assert_eq!(decrypt_blob(&blob, &KEY, None).unwrap().as_slice(), plain);
    }

    #[test]
    fn v4_roundtrip_seven_million_and_one() {
        let plain = compressible(7_000_001);
        let blob = encrypt_blob_v4(&plain, &KEY, None).unwrap();

        let chunk = V4_PLAIN_CHUNK_BYTES as u64;
        let chunks = (plain.len() as u64).div_ceil(chunk);
        assert_eq!(chunks, 54);

        // Every full 128 KiB chunk pads to the 160 KiB bucket; the tail
        // fits the 64 KiB bucket. The layout is fully deterministic.
        let full_sealed = file_chunk_target(8 + chunk as usize).unwrap();
        let tail_plain = plain.len() - (chunks as usize - 1) * chunk as usize;
        let tail_sealed = file_chunk_target(8 + tail_plain).unwrap();
        assert_eq!(full_sealed, 160 * 1024);
        assert_eq!(tail_sealed, 64 * 1024);
        assert_eq!(
            blob.len(),
            V34_PREFIX_BYTES + (chunks as usize - 1) * (16 + full_sealed) + 16 + tail_sealed
        );

        assert_eq!(decrypt_blob(&blob, &KEY, None).unwrap().as_slice(), plain);
    }

    #[test]
    fn chunk_nonces_are_unique() {
        let base = [9u8; 24];
        assert_ne!(chunk_nonce(&base, 0), chunk_nonce(&base, 1));
        assert_eq!(chunk_nonce(&base, 5)[..16], base[..16]);
    }

    #[test]
    fn tampered_chunk_rejects() {
        let plain = noisy(V4_PLAIN_CHUNK_BYTES as usize + 10);
        let mut blob = encrypt_blob_v4(&plain, &KEY, None).unwrap();
        let idx = V34_PREFIX_BYTES + 20; // inside the first chunk frame
        blob[idx] ^= 1;
        assert!(decrypt_blob(&blob, &KEY, None).is_err());
    }

    #[test]
    fn truncated_or_padded_blob_rejects() {
        let blob = encrypt_blob_v3(&noisy(1000), &KEY, None).unwrap();
        assert!(decrypt_blob(&blob[..blob.len() - 1], &KEY, None).is_err());
        let mut long = blob;
        long.push(0);
        assert!(decrypt_blob(&long, &KEY, None).is_err());
    }

    #[test]
    fn size_limits_enforced() {
        assert!(matches!(encrypt_blob_v1(&[], &KEY), Err(BlobError::Malformed)));
        let mut fake = vec![0u8; V1_HEADER_BYTES];
        fake[..4].copy_from_slice(&BLOB_MAGIC);
        fake[4] = 77; // unknown version
        assert!(decrypt_blob(&fake, &KEY, None).is_err());
    }

    #[test]
    fn cancellation_aborts_chunked_work() {
        let token = CancelToken::new();
        token.cancel();
        let plain = noisy(1000);
        assert!(matches!(
            encrypt_blob_v4(&plain, &KEY, Some(&token)),
            Err(BlobError::Cancelled)
        ));
        let blob = encrypt_blob_v4(&plain, &KEY, None).unwrap();
        assert!(matches!(
            decrypt_blob(&blob, &KEY, Some(&token)),
            Err(BlobError::Cancelled)
        ));
    }
}
