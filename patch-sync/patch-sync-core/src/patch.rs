//! Reversible text patches.
//!
//! A patch is a list of hunks computed from a character diff. Each hunk keeps
//! a few characters of unchanged text on either side so it can still be placed
//! when the text it is applied to has drifted from the one it was computed
//! against. Application never silently fails: every hunk reports whether it
//! found a home.

use crate::error::CodecError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use similar::{Algorithm, DiffOp, TextDiff};
use std::io::{Read, Write};
use std::time::Duration;

/// Characters of unchanged context kept around each change.
pub const PATCH_MARGIN: usize = 4;
/// How far (in bytes) from its expected offset an ambiguous hunk may land.
const MATCH_DISTANCE: usize = 1000;
const DIFF_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub hunks: Vec<Hunk>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
    /// Byte offset of `old` in the text the patch was computed against.
    pub start: usize,
    pub old: String,
    pub new: String,
    /// Bytes of unchanged text leading both `old` and `new`.
    pub context_before: usize,
    /// Bytes of unchanged text trailing both `old` and `new`.
    pub context_after: usize,
}

impl Hunk {
    // Hunks may come from other writers, so every slice is checked: a hunk
    // whose context does not fit its text has no parts and is never placed.

    fn old_core(&self) -> Option<&str> {
        let end = self.old.len().checked_sub(self.context_after)?;
        self.old.get(self.context_before..end)
    }

    fn new_core(&self) -> Option<&str> {
        let end = self.new.len().checked_sub(self.context_after)?;
        self.new.get(self.context_before..end)
    }

    fn before(&self) -> Option<&str> {
        self.old.get(..self.context_before)
    }

    fn after(&self) -> Option<&str> {
        let start = self.old.len().checked_sub(self.context_after)?;
        self.old.get(start..)
    }
}

impl Patch {
    pub fn is_empty(&self) -> bool {
        self.hunks.is_empty()
    }

    /// The patch that undoes this one.
    pub fn reverse(&self) -> Patch {
        let mut shift: isize = 0;
        let hunks = self
            .hunks
            .iter()
            .map(|h| {
                let start = clamp_offset(signed(h.start).saturating_add(shift));
                shift += h.new.len() as isize - h.old.len() as isize;
                Hunk {
                    start,
                    old: h.new.clone(),
                    new: h.old.clone(),
                    context_before: h.context_before,
                    context_after: h.context_after,
                }
            })
            .collect();
        Patch { hunks }
    }
}

/// Result of applying a patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub result: String,
    /// One flag per hunk, in patch order.
    pub applied: Vec<bool>,
}

impl Applied {
    pub fn is_clean(&self) -> bool {
        self.applied.iter().all(|ok| *ok)
    }
}

/// Compute the patch turning `old` into `new`.
pub fn diff(old: &str, new: &str) -> Patch {
    if old == new {
        return Patch::default();
    }
    let diff = TextDiff::configure()
        .algorithm(Algorithm::Myers)
        .timeout(DIFF_TIMEOUT)
        .diff_chars(old, new);
    let old_slices = diff.old_slices();
    let new_slices = diff.new_slices();

    // byte offset of every old token, plus the end of text
    let mut offsets = Vec::with_capacity(old_slices.len() + 1);
    let mut acc = 0;
    for s in old_slices {
        offsets.push(acc);
        acc += s.len();
    }
    offsets.push(acc);

    let mut hunks = Vec::new();
    for group in diff.grouped_ops(PATCH_MARGIN) {
        let (first, last) = match (group.first(), group.last()) {
            (Some(f), Some(l)) => (f, l),
            _ => continue,
        };
        let old_range = first.old_range().start..last.old_range().end;
        let new_range = first.new_range().start..last.new_range().end;
        let context_before = match first {
            DiffOp::Equal { .. } => old_slices[first.old_range()].concat().len(),
            _ => 0,
        };
        let context_after = match last {
            DiffOp::Equal { .. } if group.len() > 1 => old_slices[last.old_range()].concat().len(),
            _ => 0,
        };
        hunks.push(Hunk {
            start: offsets[old_range.start],
            old: old_slices[old_range].concat(),
            new: new_slices[new_range].concat(),
            context_before,
            context_after,
        });
    }
    Patch { hunks }
}

/// Apply `patch` to `base`, placing each hunk as close as possible to where it
/// was computed.
pub fn apply(base: &str, patch: &Patch) -> Applied {
    let mut text = base.to_string();
    let mut drift: isize = 0;
    let mut applied = Vec::with_capacity(patch.hunks.len());

    for hunk in &patch.hunks {
        let expected = clamp_offset(signed(hunk.start).saturating_add(drift));
        match place(&text, hunk, expected) {
            Some(Placement {
                at,
                old_len,
                new,
                full_start,
            }) => {
                text.replace_range(at..at + old_len, new);
                drift = (full_start as isize)
                    .saturating_sub(signed(hunk.start))
                    .saturating_add(new.len() as isize - old_len as isize);
                applied.push(true);
            }
            None => applied.push(false),
        }
    }

    Applied {
        result: text,
        applied,
    }
}

struct Placement<'a> {
    at: usize,
    old_len: usize,
    new: &'a str,
    /// Where the whole hunk, context included, would start.
    full_start: usize,
}

fn place<'h>(text: &str, hunk: &'h Hunk, expected: usize) -> Option<Placement<'h>> {
    let (before, old_core, after, new_core) =
        (hunk.before()?, hunk.old_core()?, hunk.after()?, hunk.new_core()?);

    if hunk.old.is_empty() {
        let at = floor_char_boundary(text, expected.min(text.len()));
        return Some(Placement {
            at,
            old_len: 0,
            new: &hunk.new,
            full_start: at,
        });
    }

    if let Some(at) = find_near(text, &hunk.old, expected) {
        return Some(Placement {
            at,
            old_len: hunk.old.len(),
            new: &hunk.new,
            full_start: at,
        });
    }

    // context drifted: try the changed text alone
    let core_expected = expected.saturating_add(hunk.context_before);
    if !old_core.is_empty() {
        let at = find_near(text, old_core, core_expected)?;
        return Some(Placement {
            at,
            old_len: old_core.len(),
            new: new_core,
            full_start: at.saturating_sub(hunk.context_before),
        });
    }

    // pure insertion: anchor on whichever side of the context survived
    if !before.is_empty() {
        if let Some(at) = find_near(text, before, expected) {
            return Some(Placement {
                at: at + before.len(),
                old_len: 0,
                new: new_core,
                full_start: at,
            });
        }
    }
    if !after.is_empty() {
        if let Some(at) = find_near(text, after, core_expected) {
            return Some(Placement {
                at,
                old_len: 0,
                new: new_core,
                full_start: at.saturating_sub(hunk.context_before),
            });
        }
    }
    None
}

/// Nearest occurrence of `needle` to `expected`. A match further away than
/// [`MATCH_DISTANCE`] is only accepted when it is the only one.
fn find_near(text: &str, needle: &str, expected: usize) -> Option<usize> {
    let exact = expected
        .checked_add(needle.len())
        .and_then(|end| text.get(expected..end));
    if exact == Some(needle) {
        return Some(expected);
    }
    let mut best: Option<(usize, usize)> = None;
    let mut count = 0;
    for (idx, _) in text.match_indices(needle) {
        count += 1;
        let distance = idx.abs_diff(expected);
        if best.map_or(true, |(_, d)| distance < d) {
            best = Some((idx, distance));
        }
    }
    match best {
        Some((idx, distance)) if distance <= MATCH_DISTANCE || count == 1 => Some(idx),
        _ => None,
    }
}

fn signed(offset: usize) -> isize {
    isize::try_from(offset).unwrap_or(isize::MAX)
}

fn clamp_offset(offset: isize) -> usize {
    offset.max(0) as usize
}

fn floor_char_boundary(text: &str, mut idx: usize) -> usize {
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Wire form of a patch: deflated JSON, base64 encoded.
pub fn compress(patch: &Patch) -> Result<String, CodecError> {
    let json = serde_json::to_vec(patch)?;
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    let deflated = encoder.finish()?;
    Ok(STANDARD.encode(deflated))
}

pub fn decompress(encoded: &str) -> Result<Patch, CodecError> {
    let deflated = STANDARD.decode(encoded)?;
    let mut json = Vec::new();
    DeflateDecoder::new(deflated.as_slice()).read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}
