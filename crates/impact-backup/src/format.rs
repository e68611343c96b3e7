//! Archive byte layout.
//!
//! Plaintext container: a tar stream with one `collections/<name>.json`
//! entry per collection, gzip-compressed.
//!
//! Encrypted blob: a 24-byte header (`IMPBAK01`, key version, nonce prefix,
//! chunk size) followed by length-prefixed AES-256-GCM chunks. Each chunk's
//! nonce is the prefix plus its index; its AAD binds the header, the index
//! and whether it is the final chunk, so truncation, reordering and splicing
//! all fail authentication. Chunking lets a verifier open a bounded prefix.

use std::{
    collections::BTreeMap,
    io::{ErrorKind, Read, Write},
};

use aes_gcm::{
    aead::{consts::U12, Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use impact_core::{CancelToken, Document};
use impact_crypto::DerivedKey;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

use crate::{error::FormatError, snapshot::CollectionSnapshot};

pub(crate) const MAGIC: &[u8; 8] = b"IMPBAK01";
pub(crate) const HEADER_LEN: usize = 24;
const NONCE_PREFIX_LEN: usize = 8;
const TAG_LEN: usize = 16;
const COLLECTION_DIR: &str = "collections";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    pub key_version: u32,
    pub nonce_prefix: [u8; NONCE_PREFIX_LEN],
    pub chunk_size: u32,
}

impl Header {
    fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..8].copy_from_slice(MAGIC);
        out[8..12].copy_from_slice(&self.key_version.to_be_bytes());
        out[12..20].copy_from_slice(&self.nonce_prefix);
        out[20..24].copy_from_slice(&self.chunk_size.to_be_bytes());
        out
    }

    pub(crate) fn parse(blob: &[u8]) -> Result<Self, FormatError> {
        if blob.len() < HEADER_LEN {
            return Err(FormatError::Header(format!("{} bytes is too short", blob.len())));
        }
        if &blob[..8] != MAGIC {
            return Err(FormatError::Header("bad magic".into()));
        }
        let mut nonce_prefix = [0u8; NONCE_PREFIX_LEN];
        nonce_prefix.copy_from_slice(&blob[12..20]);
        let header = Self {
            key_version: read_u32(&blob[8..12]),
            nonce_prefix,
            chunk_size: read_u32(&blob[20..24]),
        };
        if header.chunk_size == 0 {
            return Err(FormatError::Header("chunk size is zero".into()));
        }
        Ok(header)
    }
}

/// Result of opening some or all chunks of a blob.
#[derive(Debug)]
pub(crate) struct Opened {
    pub plaintext: Vec<u8>,
    pub chunks: u32,
    /// Whether the final chunk was reached and authenticated.
    pub complete: bool,
}

pub(crate) fn build_container(
    collections: &[CollectionSnapshot],
    mtime: i64,
    cancel: &CancelToken,
) -> Result<Vec<u8>, FormatError> {
    let mut builder = tar::Builder::new(Vec::new());
    for collection in collections {
        if cancel.is_cancelled() {
            return Err(FormatError::Cancelled);
        }
        let body = serde_json::to_vec(&collection.documents)?;
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o600);
        header.set_mtime(u64::try_from(mtime).unwrap_or(0));
        header.set_entry_type(tar::EntryType::Regular);
        builder.append_data(
            &mut header,
            format!("{COLLECTION_DIR}/{}.json", collection.name),
            body.as_slice(),
        )?;
    }
    Ok(builder.into_inner()?)
}

pub(crate) fn parse_container(tar_bytes: &[u8]) -> Result<BTreeMap<String, Vec<Document>>, FormatError> {
    let mut archive = tar::Archive::new(tar_bytes);
    let mut out = BTreeMap::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let name = path
            .strip_prefix(COLLECTION_DIR)
            .ok()
            .and_then(|p| p.to_str())
            .and_then(|s| s.strip_suffix(".json"))
            .filter(|s| !s.is_empty() && !s.contains('/'))
            .ok_or_else(|| FormatError::Container(format!("unexpected entry {}", path.display())))?
            .to_string();

        let mut body = Vec::new();
        entry.read_to_end(&mut body)?;
        let documents: Vec<Document> = serde_json::from_slice(&body)?;
        if out.insert(name.clone(), documents).is_some() {
            return Err(FormatError::Container(format!("duplicate collection {name}")));
        }
    }
    Ok(out)
}

pub(crate) fn compress(bytes: &[u8]) -> Result<Vec<u8>, FormatError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

pub(crate) fn decompress(bytes: &[u8]) -> Result<Vec<u8>, FormatError> {
    let mut out = Vec::new();
    GzDecoder::new(bytes).read_to_end(&mut out)?;
    Ok(out)
}

/// Decompress as much of a gzip prefix as is present. Running out of input
/// is expected; anything else is corruption.
pub(crate) fn decompress_prefix(bytes: &[u8]) -> Result<usize, FormatError> {
    let mut decoder = GzDecoder::new(bytes);
    let mut buf = [0u8; 8192];
    let mut total = 0;
    loop {
        match decoder.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => total += n,
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(total),
            Err(err) => return Err(err.into()),
        }
    }
}

pub(crate) fn encrypt_stream(
    key: &DerivedKey,
    plaintext: &[u8],
    chunk_size: u32,
    cancel: &CancelToken,
) -> Result<Vec<u8>, FormatError> {
    if chunk_size == 0 {
        return Err(FormatError::Encrypt("chunk size must be positive".into()));
    }
    let cipher = Aes256Gcm::new_from_slice(key.expose())
        .map_err(|e| FormatError::Encrypt(format!("cipher init failed: {e}")))?;

    let mut nonce_prefix = [0u8; NONCE_PREFIX_LEN];
    OsRng.fill_bytes(&mut nonce_prefix);
    let header = Header {
        key_version: key.version(),
        nonce_prefix,
        chunk_size,
    }
    .to_bytes();

    let chunks: Vec<&[u8]> = if plaintext.is_empty() {
        vec![plaintext]
    } else {
        plaintext.chunks(chunk_size as usize).collect()
    };
    let count = u32::try_from(chunks.len())
        .map_err(|_| FormatError::Encrypt("too many chunks".into()))?;

    let mut out = Vec::with_capacity(HEADER_LEN + plaintext.len() + chunks.len() * (4 + TAG_LEN));
    out.extend_from_slice(&header);
    for (index, chunk) in (0..count).zip(chunks) {
        if cancel.is_cancelled() {
            return Err(FormatError::Cancelled);
        }
        let sealed = cipher
            .encrypt(
                &chunk_nonce(&nonce_prefix, index),
                Payload {
                    msg: chunk,
                    aad: &chunk_aad(&header, index, index + 1 == count),
                },
            )
            .map_err(|e| FormatError::Encrypt(e.to_string()))?;
        out.extend_from_slice(&(sealed.len() as u32).to_be_bytes());
        out.extend_from_slice(&sealed);
    }
    Ok(out)
}

/// Decrypt the blob, stopping after `max_chunks` chunks when given.
pub(crate) fn decrypt_stream(
    key: &DerivedKey,
    blob: &[u8],
    max_chunks: Option<u32>,
) -> Result<Opened, FormatError> {
    let header = Header::parse(blob)?;
    if header.key_version != key.version() {
        return Err(FormatError::Header(format!(
            "blob uses key version {}, got key version {}",
            header.key_version,
            key.version()
        )));
    }
    let cipher = Aes256Gcm::new_from_slice(key.expose())
        .map_err(|e| FormatError::Encrypt(format!("cipher init failed: {e}")))?;
    let header_bytes = &blob[..HEADER_LEN];
    let max_sealed = header.chunk_size as usize + TAG_LEN;

    let mut plaintext = Vec::new();
    let mut pos = HEADER_LEN;
    let mut index: u32 = 0;
    loop {
        if max_chunks.is_some_and(|max| index >= max) {
            return Ok(Opened {
                plaintext,
                chunks: index,
                complete: false,
            });
        }
        let len_end = pos + 4;
        if len_end > blob.len() {
            return Err(FormatError::Framing(format!("chunk {index} length is missing")));
        }
        let len = read_u32(&blob[pos..len_end]) as usize;
        if !(TAG_LEN..=max_sealed).contains(&len) {
            return Err(FormatError::Framing(format!("chunk {index} has length {len}")));
        }
        let end = len_end + len;
        if end > blob.len() {
            return Err(FormatError::Framing(format!("chunk {index} is cut short")));
        }
        let last = end == blob.len();
        let opened = cipher
            .decrypt(
                &chunk_nonce(&header.nonce_prefix, index),
                Payload {
                    msg: &blob[len_end..end],
                    aad: &chunk_aad(header_bytes, index, last),
                },
            )
            .map_err(|_| FormatError::Authentication { index })?;
        plaintext.extend_from_slice(&opened);
        pos = end;
        index = index
            .checked_add(1)
            .ok_or_else(|| FormatError::Framing("chunk counter overflow".into()))?;
        if last {
            return Ok(Opened {
                plaintext,
                chunks: index,
                complete: true,
            });
        }
    }
}

pub(crate) fn checksum(blob: &[u8]) -> String {
    hex::encode(Sha256::digest(blob))
}

fn chunk_nonce(prefix: &[u8; NONCE_PREFIX_LEN], index: u32) -> Nonce<U12> {
    let mut nonce = [0u8; 12];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_LEN..].copy_from_slice(&index.to_be_bytes());
    Nonce::clone_from_slice(&nonce)
}

fn chunk_aad(header: &[u8], index: u32, last: bool) -> Vec<u8> {
    let mut aad = Vec::with_capacity(header.len() + 5);
    aad.extend_from_slice(header);
    aad.extend_from_slice(&index.to_be_bytes());
    aad.push(u8::from(last));
    aad
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_be_bytes(buf)
}
