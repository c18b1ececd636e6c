//! RTMP handshake: C0/C1 in, S0/S1/S2 out, C2 in and discarded.

use std::time::Duration;

use failure::{bail, Error, ResultExt};
use hmac::{Hmac, Mac, NewMac as _};
use rand::RngCore;
use sha2::Sha256;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use crate::constants::{
    GENUINE_FMS_CONST, GENUINE_FP_CONST, RANDOM_CRUD, RTMP_HANDSHAKE_SIZE, SHA256_DIGEST_LEN,
};
use crate::error::CloseReason;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum MessageFormat {
    Plain,
    Format1,
    Format2,
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; SHA256_DIGEST_LEN] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    let result = mac.finalize().into_bytes();
    let mut out = [0u8; SHA256_DIGEST_LEN];
    out.copy_from_slice(&result);
    out
}

/// `(sum of four bytes) % 728 + 12`, the client-side (format 1) digest
/// offset scheme.
fn client_digest_offset(b: &[u8]) -> usize {
    let sum: u32 = b[..4].iter().map(|&x| u32::from(x)).sum();
    (sum as usize % 728) + 12
}

/// `(sum of four bytes) % 728 + 776`, the server-side (format 2) digest
/// offset scheme.
fn server_digest_offset(b: &[u8]) -> usize {
    let sum: u32 = b[..4].iter().map(|&x| u32::from(x)).sum();
    (sum as usize % 728) + 776
}

fn digest_matches(clientsig: &[u8], offset: usize) -> bool {
    let mut msg = Vec::with_capacity(clientsig.len() - SHA256_DIGEST_LEN);
    msg.extend_from_slice(&clientsig[..offset]);
    msg.extend_from_slice(&clientsig[offset + SHA256_DIGEST_LEN..]);
    let computed = hmac_sha256(GENUINE_FP_CONST, &msg);
    computed[..] == clientsig[offset..offset + SHA256_DIGEST_LEN]
}

fn detect_client_message_format(clientsig: &[u8]) -> MessageFormat {
    let sdl2 = server_digest_offset(&clientsig[772..776]);
    if sdl2 + SHA256_DIGEST_LEN <= clientsig.len() && digest_matches(clientsig, sdl2) {
        return MessageFormat::Format2;
    }
    let sdl1 = client_digest_offset(&clientsig[8..12]);
    if sdl1 + SHA256_DIGEST_LEN <= clientsig.len() && digest_matches(clientsig, sdl1) {
        return MessageFormat::Format1;
    }
    MessageFormat::Plain
}

fn generate_s1(format: MessageFormat, rng: &mut impl RngCore) -> Vec<u8> {
    let mut buf = vec![0u8; RTMP_HANDSHAKE_SIZE];
    buf[0..4].copy_from_slice(&[0, 0, 0, 0]);
    buf[4..8].copy_from_slice(&[1, 2, 3, 4]);
    rng.fill_bytes(&mut buf[8..]);

    let offset = match format {
        MessageFormat::Format1 => client_digest_offset(&buf[8..12]),
        _ => server_digest_offset(&buf[772..776]),
    };
    let mut msg = Vec::with_capacity(buf.len() - SHA256_DIGEST_LEN);
    msg.extend_from_slice(&buf[..offset]);
    msg.extend_from_slice(&buf[offset + SHA256_DIGEST_LEN..]);
    let digest = hmac_sha256(GENUINE_FMS_CONST, &msg);
    buf[offset..offset + SHA256_DIGEST_LEN].copy_from_slice(&digest);
    buf
}

fn generate_s2(format: MessageFormat, clientsig: &[u8], rng: &mut impl RngCore) -> Vec<u8> {
    let mut random_bytes = vec![0u8; RTMP_HANDSHAKE_SIZE - SHA256_DIGEST_LEN];
    rng.fill_bytes(&mut random_bytes);

    let offset = match format {
        MessageFormat::Format1 => client_digest_offset(&clientsig[8..12]),
        _ => server_digest_offset(&clientsig[772..776]),
    };
    let challenge_key = &clientsig[offset..offset + SHA256_DIGEST_LEN];

    let mut fms_const_crud = Vec::with_capacity(GENUINE_FMS_CONST.len() + RANDOM_CRUD.len());
    fms_const_crud.extend_from_slice(GENUINE_FMS_CONST);
    fms_const_crud.extend_from_slice(&RANDOM_CRUD);

    let key = hmac_sha256(&fms_const_crud, challenge_key);
    let signature = hmac_sha256(&key, &random_bytes);

    let mut s2 = random_bytes;
    s2.extend_from_slice(&signature);
    s2
}

/// Runs the server side of the handshake to completion: reads C0+C1, writes
/// S0+S1+S2, reads and discards C2. The whole exchange is bounded by a
/// single 5-second timeout.
pub async fn perform<S>(stream: &mut S) -> Result<(), Error>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    timeout(HANDSHAKE_TIMEOUT, perform_inner(stream))
        .await
        .map_err(|_| failure::err_msg("handshake timed out"))
        .context(CloseReason::Handshake)?
        .context(CloseReason::Handshake)?;
    Ok(())
}

async fn perform_inner<S>(stream: &mut S) -> Result<(), Error>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut c0 = [0u8; 1];
    stream.read_exact(&mut c0).await?;
    if c0[0] != 3 && c0[0] != 6 {
        bail!("unsupported RTMP version byte 0x{:02x}", c0[0]);
    }

    let mut c1 = vec![0u8; RTMP_HANDSHAKE_SIZE];
    stream.read_exact(&mut c1).await?;

    let format = detect_client_message_format(&c1);
    let mut rng = rand::thread_rng();

    let mut reply = Vec::with_capacity(1 + 2 * RTMP_HANDSHAKE_SIZE);
    reply.push(3u8); // S0

    match format {
        MessageFormat::Plain => {
            reply.extend_from_slice(&c1); // S1 = C1
            reply.extend_from_slice(&c1); // S2 = C1
        }
        MessageFormat::Format1 | MessageFormat::Format2 => {
            let s1 = generate_s1(format, &mut rng);
            let s2 = generate_s2(format, &c1, &mut rng);
            reply.extend_from_slice(&s1);
            reply.extend_from_slice(&s2);
        }
    }

    stream.write_all(&reply).await?;

    let mut c2 = vec![0u8; RTMP_HANDSHAKE_SIZE];
    stream.read_exact(&mut c2).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_handshake_when_digest_absent() {
        let c1 = vec![0u8; RTMP_HANDSHAKE_SIZE];
        assert_eq!(detect_client_message_format(&c1), MessageFormat::Plain);
    }

    #[test]
    fn format1_digest_round_trips() {
        let mut rng = rand::thread_rng();
        let mut c1 = vec![0u8; RTMP_HANDSHAKE_SIZE];
        rng.fill_bytes(&mut c1);

        let offset = client_digest_offset(&c1[8..12]);
        let mut msg = Vec::new();
        msg.extend_from_slice(&c1[..offset]);
        msg.extend_from_slice(&c1[offset + SHA256_DIGEST_LEN..]);
        let digest = hmac_sha256(GENUINE_FP_CONST, &msg);
        c1[offset..offset + SHA256_DIGEST_LEN].copy_from_slice(&digest);

        assert_eq!(detect_client_message_format(&c1), MessageFormat::Format1);
    }
}
