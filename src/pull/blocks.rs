use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::pull::types::BlockInfo;

/// Block granularity used when re-hashing assembled files. Matches the
/// granularity the scanner produces for the global file list.
pub const STANDARD_BLOCK_SIZE: usize = 128 * 1024;

/// Splits a target block list into the blocks the local version already
/// holds at the right offsets (`have`) and the blocks that must be
/// obtained (`need`). Comparison is positional: a local block counts only
/// if the block at the same index carries the same hash.
pub fn block_diff(local: &[BlockInfo], target: &[BlockInfo]) -> (Vec<BlockInfo>, Vec<BlockInfo>) {
    if target.is_empty() {
        return (Vec::new(), Vec::new());
    }
    if local.is_empty() {
        return (Vec::new(), target.to_vec());
    }

    let mut have = Vec::new();
    let mut need = Vec::new();
    for (i, tb) in target.iter().enumerate() {
        if i < local.len() && local[i].hash == tb.hash {
            have.push(tb.clone());
        } else {
            need.push(tb.clone());
        }
    }
    (have, need)
}

/// Reads `r` to EOF and hashes it at `block_size` granularity. An empty
/// stream yields an empty block list.
pub async fn hash_blocks<R>(r: &mut R, block_size: usize) -> std::io::Result<Vec<BlockInfo>>
where
    R: AsyncRead + Unpin,
{
    let mut out = Vec::new();
    let mut offset = 0u64;
    let mut buf = vec![0u8; block_size];

    loop {
        let mut filled = 0usize;
        while filled < block_size {
            let n = r.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }

        let digest = Sha256::digest(&buf[..filled]);
        out.push(BlockInfo {
            offset,
            size: filled as u32,
            hash: digest.to_vec(),
        });
        offset += filled as u64;

        if filled < block_size {
            break;
        }
    }
    Ok(out)
}
