use std::fmt;
use std::str::FromStr;

use crate::{BLOCK_SIZE, BlockError};

/// A contiguous run of blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub start: u64,
    pub count: u64,
}

impl BlockRange {
    /// First block past the range.
    pub fn end(&self) -> u64 {
        self.start + self.count
    }

    pub fn overlaps(&self, other: &BlockRange) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

/// Ordered set of block ranges parsed from a descriptor.
///
/// Two descriptor forms are accepted:
///
/// - range form `"N,s1,e1,s2,e2,..."`: N integers follow, taken as half-open
///   `[start, end)` pairs.
/// - count form `"R,c1,s1,c2,s2,..."`: R ranges follow, each given as block
///   count then start block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockSet {
    ranges: Vec<BlockRange>,
    total: u64,
}

fn parse_error(descriptor: &str, reason: impl fmt::Display) -> BlockError {
    BlockError::Parse(format!("{reason} in {descriptor:?}"))
}

impl BlockSet {
    /// Parses a descriptor into a new set.
    pub fn parse(descriptor: &str) -> Result<Self, BlockError> {
        let mut set = Self::default();
        set.parse_and_insert(descriptor)?;
        Ok(set)
    }

    /// Parses a descriptor and appends its ranges to this set.
    ///
    /// The set is left unchanged when parsing fails.
    pub fn parse_and_insert(&mut self, descriptor: &str) -> Result<(), BlockError> {
        let trimmed = descriptor.trim();
        if trimmed.is_empty() {
            return Err(parse_error(descriptor, "empty descriptor"));
        }

        let numbers = trimmed
            .split(',')
            .map(|token| {
                token
                    .trim()
                    .parse::<u64>()
                    .map_err(|e| parse_error(descriptor, format_args!("bad token {token:?}: {e}")))
            })
            .collect::<Result<Vec<u64>, _>>()?;

        let (&declared, values) = numbers
            .split_first()
            .ok_or_else(|| parse_error(descriptor, "empty descriptor"))?;
        if declared == 0 {
            return Err(parse_error(descriptor, "zero ranges"));
        }

        let given = values.len() as u64;
        let parsed: Vec<BlockRange> = if given == declared {
            if given % 2 != 0 {
                return Err(parse_error(descriptor, "odd number of range bounds"));
            }
            values
                .chunks_exact(2)
                .map(|pair| {
                    let (start, end) = (pair[0], pair[1]);
                    if end <= start {
                        return Err(parse_error(descriptor, format_args!("empty range {start}..{end}")));
                    }
                    Ok(BlockRange { start, count: end - start })
                })
                .collect::<Result<_, _>>()?
        } else if declared.checked_mul(2) == Some(given) {
            values
                .chunks_exact(2)
                .map(|pair| {
                    let (count, start) = (pair[0], pair[1]);
                    if count == 0 {
                        return Err(parse_error(descriptor, format_args!("zero-length range at {start}")));
                    }
                    Ok(BlockRange { start, count })
                })
                .collect::<Result<_, _>>()?
        } else {
            return Err(parse_error(
                descriptor,
                format_args!("declared {declared} but {given} values follow"),
            ));
        };

        let mut total = self.total;
        for range in &parsed {
            range
                .start
                .checked_add(range.count)
                .and_then(|end| end.checked_mul(BLOCK_SIZE))
                .ok_or_else(|| parse_error(descriptor, "range overflows device offsets"))?;
            total = total
                .checked_add(range.count)
                .ok_or_else(|| parse_error(descriptor, "block total overflows"))?;
        }

        self.ranges.extend(parsed);
        self.total = total;
        Ok(())
    }

    pub fn ranges(&self) -> &[BlockRange] {
        &self.ranges
    }

    /// Sum of all range sizes, in blocks.
    pub fn total_blocks(&self) -> u64 {
        self.total
    }

    /// Sum of all range sizes, in bytes.
    pub fn byte_len(&self) -> u64 {
        self.total * BLOCK_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// True when any block belongs to both sets.
    pub fn overlaps(&self, other: &BlockSet) -> bool {
        self.ranges
            .iter()
            .any(|a| other.ranges.iter().any(|b| a.overlaps(b)))
    }
}

impl FromStr for BlockSet {
    type Err = BlockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Formats in range form, which [`BlockSet::parse`] accepts back.
impl fmt::Display for BlockSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ranges.len() * 2)?;
        for r in &self.ranges {
            write!(f, ",{},{}", r.start, r.end())?;
        }
        Ok(())
    }
}
