use std::fmt::{Display, Formatter};

use super::{MacAddress, MacError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacRange {
    start: MacAddress,
    end: MacAddress,
}

impl MacRange {
    pub fn new(start: MacAddress, end: MacAddress) -> Result<Self, MacError> {
        if start > end {
            return Err(MacError::InvertedRange(start, end));
        }

        Ok(Self { start, end })
    }

    pub fn parse(start: &str, end: &str) -> Result<Self, MacError> {
        Self::new(start.parse()?, end.parse()?)
    }

    pub fn start(&self) -> MacAddress {
        self.start
    }

    pub fn contains(&self, address: &MacAddress) -> bool {
        (self.start..=self.end).contains(address)
    }

    /// Inclusive count of addresses in the range.
    pub fn size(&self) -> u64 {
        self.end.as_u64() - self.start.as_u64() + 1
    }

    /// Walks the whole range once, beginning at `from` and wrapping back to
    /// `start` after `end`. A `from` outside the range starts at `start`.
    pub fn iter_from(&self, from: MacAddress) -> WrappingMacIterator {
        let from = match self.contains(&from) {
            true => from,
            false => self.start,
        };

        WrappingMacIterator {
            range: *self,
            current: from.as_u64(),
            remaining: self.size(),
        }
    }

    pub fn iter(&self) -> WrappingMacIterator {
        self.iter_from(self.start)
    }
}

impl Display for MacRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[derive(Debug, Clone)]
pub struct WrappingMacIterator {
    range: MacRange,
    current: u64,
    remaining: u64,
}

impl Iterator for WrappingMacIterator {
    type Item = MacAddress;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }

        let address = MacAddress(self.current);

        self.remaining -= 1;
        self.current = match self.current == self.range.end.as_u64() {
            true => self.range.start.as_u64(),
            false => self.current + 1,
        };

        Some(address)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match usize::try_from(self.remaining) {
            Ok(remaining) => (remaining, Some(remaining)),
            Err(_) => (usize::MAX, None),
        }
    }
}
