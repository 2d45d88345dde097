//! Packed relative relocations. Instead of one table record per relocated word, the section
//! stores a sorted stream of words: an even word is an anchor naming an address to relocate, an
//! odd word is a bitmap covering the following `word-size * 8 - 1` word-aligned addresses, bit
//! `i` meaning the address `i` words past the end of the previously covered region.
//!
//! The section's size is settled during layout, before the final addresses of every candidate
//! are known. The finishing encode must therefore never need more words than the section was
//! sized for and pads with empty bitmap words when it needs fewer.

use crate::error::Result;
use anyhow::bail;

/// An encoded word that relocates nothing. Decoders treat it as an empty bitmap.
pub const PADDING_WORD: u64 = 1;

fn bits_per_bitmap(word_size: u64) -> u64 {
    word_size * 8 - 1
}

/// Encodes the supplied addresses, which must be sorted and aligned to `word_size`.
#[must_use]
pub fn encode(addresses: &[u64], word_size: u64) -> Vec<u64> {
    let bits = bits_per_bitmap(word_size);
    let mut out = Vec::new();
    let mut i = 0;
    while i < addresses.len() {
        let anchor = addresses[i];
        out.push(anchor);
        i += 1;

        let mut base = anchor + word_size;
        loop {
            let mut bitmap = 0u64;
            while i < addresses.len() {
                let slot = (addresses[i] - base) / word_size;
                if slot >= bits {
                    break;
                }
                bitmap |= 1 << slot;
                i += 1;
            }
            if bitmap == 0 {
                break;
            }
            out.push(bitmap << 1 | 1);
            base += bits * word_size;
        }
    }
    out
}

/// Expands an encoded stream back into the addresses it relocates.
#[must_use]
pub fn decode(words: &[u64], word_size: u64) -> Vec<u64> {
    let bits = bits_per_bitmap(word_size);
    let mut out = Vec::new();
    let mut base = 0;
    for &word in words {
        if word & 1 == 0 {
            out.push(word);
            base = word + word_size;
        } else {
            let mut bitmap = word >> 1;
            let mut slot = 0;
            while bitmap != 0 {
                if bitmap & 1 != 0 {
                    out.push(base + slot * word_size);
                }
                bitmap >>= 1;
                slot += 1;
            }
            base += bits * word_size;
        }
    }
    out
}

/// Sorts and encodes the final addresses, then pads the result out to the word count the section
/// was sized for. Needing more words than were reserved is an internal consistency failure, not
/// something an input can legitimately cause.
pub fn finish(addresses: &mut [u64], word_size: u64, sized_words: usize) -> Result<Vec<u64>> {
    addresses.sort_unstable();
    let mut words = encode(addresses, word_size);
    if words.len() > sized_words {
        bail!(
            "Packed relative relocations need {} words but the section was sized for {sized_words}",
            words.len()
        );
    }
    words.resize(sized_words, PADDING_WORD);
    Ok(words)
}
