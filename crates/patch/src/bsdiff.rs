//! `BSDIFF40` block patch generation.
//!
//! Builds a suffix array over the old image and walks the new image looking
//! for approximate matches, emitting (add, copy, seek) control runs.

use std::io::Write;

use bzip2::Compression;
use bzip2::write::BzEncoder;
use tracing::debug;

use crate::bspatch::BSDIFF_MAGIC;
use crate::le::write_offtout;
use crate::PatchError;

/// A match must beat the running score by this much to start a new run.
const MATCH_SCORE: i64 = 8;

struct Control {
    add: i64,
    copy: i64,
    seek: i64,
}

/// Builds the suffix array of `data` by prefix doubling.
fn suffix_array(data: &[u8]) -> Vec<usize> {
    let n = data.len();
    let mut sa: Vec<usize> = (0..n).collect();
    if n < 2 {
        return sa;
    }

    let mut rank: Vec<usize> = data.iter().map(|&b| b as usize).collect();
    let mut next = vec![0usize; n];
    let mut k = 1;
    loop {
        let key = |i: usize| (rank[i], if i + k < n { rank[i + k] + 1 } else { 0 });
        sa.sort_unstable_by_key(|&i| key(i));

        next[sa[0]] = 0;
        for w in 1..n {
            let bump = usize::from(key(sa[w - 1]) < key(sa[w]));
            next[sa[w]] = next[sa[w - 1]] + bump;
        }
        std::mem::swap(&mut rank, &mut next);

        if rank[sa[n - 1]] == n - 1 {
            break;
        }
        k *= 2;
    }
    sa
}

fn match_len(a: &[u8], b: &[u8]) -> i64 {
    a.iter().zip(b).take_while(|(x, y)| x == y).count() as i64
}

/// Finds the longest prefix of `target` occurring in `old`.
///
/// Returns `(length, position in old)`.
fn search(sa: &[usize], old: &[u8], target: &[u8]) -> (i64, i64) {
    if sa.is_empty() {
        return (0, 0);
    }

    let (mut st, mut en) = (0usize, sa.len() - 1);
    loop {
        if en - st < 2 {
            let x = match_len(&old[sa[st]..], target);
            let y = match_len(&old[sa[en]..], target);
            return if x > y {
                (x, sa[st] as i64)
            } else {
                (y, sa[en] as i64)
            };
        }
        let mid = st + (en - st) / 2;
        let suffix = &old[sa[mid]..];
        let n = suffix.len().min(target.len());
        if suffix[..n] < target[..n] {
            st = mid;
        } else {
            en = mid;
        }
    }
}

fn byte_at(buf: &[u8], index: i64) -> Option<u8> {
    usize::try_from(index).ok().and_then(|i| buf.get(i).copied())
}

fn same_at(old: &[u8], old_index: i64, new: &[u8], new_index: i64) -> bool {
    match (byte_at(old, old_index), byte_at(new, new_index)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn compute_controls(old: &[u8], new: &[u8], diff: &mut Vec<u8>, extra: &mut Vec<u8>) -> Vec<Control> {
    let sa = suffix_array(old);
    let old_len = old.len() as i64;
    let new_len = new.len() as i64;

    let mut controls = Vec::new();
    let (mut scan, mut len, mut pos) = (0i64, 0i64, 0i64);
    let (mut last_scan, mut last_pos, mut last_offset) = (0i64, 0i64, 0i64);

    while scan < new_len {
        let mut old_score = 0i64;
        scan += len;
        let mut scsc = scan;
        while scan < new_len {
            (len, pos) = search(&sa, old, &new[scan as usize..]);
            while scsc < scan + len {
                if same_at(old, scsc + last_offset, new, scsc) {
                    old_score += 1;
                }
                scsc += 1;
            }
            if (len == old_score && len != 0) || len > old_score + MATCH_SCORE {
                break;
            }
            if same_at(old, scan + last_offset, new, scan) {
                old_score -= 1;
            }
            scan += 1;
        }

        if len == old_score && scan != new_len {
            continue;
        }

        // Extend forward from the previous match.
        let (mut s, mut best, mut len_front) = (0i64, 0i64, 0i64);
        let mut i = 0i64;
        while last_scan + i < scan && last_pos + i < old_len {
            if same_at(old, last_pos + i, new, last_scan + i) {
                s += 1;
            }
            i += 1;
            if s * 2 - i > best * 2 - len_front {
                best = s;
                len_front = i;
            }
        }

        // Extend backward from the current match.
        let mut len_back = 0i64;
        if scan < new_len {
            let (mut s, mut best) = (0i64, 0i64);
            let mut i = 1i64;
            while scan >= last_scan + i && pos >= i {
                if same_at(old, pos - i, new, scan - i) {
                    s += 1;
                }
                if s * 2 - i > best * 2 - len_back {
                    best = s;
                    len_back = i;
                }
                i += 1;
            }
        }

        // Resolve overlap between the two extensions.
        if last_scan + len_front > scan - len_back {
            let overlap = (last_scan + len_front) - (scan - len_back);
            let (mut s, mut best, mut split) = (0i64, 0i64, 0i64);
            for i in 0..overlap {
                if same_at(
                    old,
                    last_pos + len_front - overlap + i,
                    new,
                    last_scan + len_front - overlap + i,
                ) {
                    s += 1;
                }
                if same_at(old, pos - len_back + i, new, scan - len_back + i) {
                    s -= 1;
                }
                if s > best {
                    best = s;
                    split = i + 1;
                }
            }
            len_front += split - overlap;
            len_back -= split;
        }

        for i in 0..len_front {
            let n = byte_at(new, last_scan + i).unwrap_or(0);
            let o = byte_at(old, last_pos + i).unwrap_or(0);
            diff.push(n.wrapping_sub(o));
        }
        let extra_start = (last_scan + len_front) as usize;
        let extra_end = (scan - len_back) as usize;
        if extra_end > extra_start {
            extra.extend_from_slice(&new[extra_start..extra_end]);
        }

        controls.push(Control {
            add: len_front,
            copy: (scan - len_back) - (last_scan + len_front),
            seek: (pos - len_back) - (last_pos + len_front),
        });

        last_scan = scan - len_back;
        last_pos = pos - len_back;
        last_offset = pos - scan;
    }

    controls
}

pub(crate) fn bz_compress(stage: &str, data: &[u8]) -> Result<Vec<u8>, PatchError> {
    let mut encoder = BzEncoder::new(Vec::new(), Compression::best());
    encoder
        .write_all(data)
        .map_err(|e| PatchError::codec(stage, e))?;
    encoder.finish().map_err(|e| PatchError::codec(stage, e))
}

/// Generates a `BSDIFF40` patch that turns `old` into `new`.
pub fn generate_block_patch(old: &[u8], new: &[u8]) -> Result<Vec<u8>, PatchError> {
    let mut diff = Vec::with_capacity(new.len());
    let mut extra = Vec::new();
    let controls = compute_controls(old, new, &mut diff, &mut extra);

    let mut ctrl = Vec::with_capacity(controls.len() * 24);
    for c in &controls {
        ctrl.extend_from_slice(&write_offtout(c.add));
        ctrl.extend_from_slice(&write_offtout(c.copy));
        ctrl.extend_from_slice(&write_offtout(c.seek));
    }

    let ctrl = bz_compress("control stream", &ctrl)?;
    let diff = bz_compress("diff stream", &diff)?;
    let extra = bz_compress("extra stream", &extra)?;

    let mut patch = Vec::with_capacity(32 + ctrl.len() + diff.len() + extra.len());
    patch.extend_from_slice(BSDIFF_MAGIC);
    patch.extend_from_slice(&write_offtout(ctrl.len() as i64));
    patch.extend_from_slice(&write_offtout(diff.len() as i64));
    patch.extend_from_slice(&write_offtout(new.len() as i64));
    patch.extend_from_slice(&ctrl);
    patch.extend_from_slice(&diff);
    patch.extend_from_slice(&extra);

    debug!(
        old_size = old.len(),
        new_size = new.len(),
        runs = controls.len(),
        patch_size = patch.len(),
        "block patch generated"
    );
    Ok(patch)
}
