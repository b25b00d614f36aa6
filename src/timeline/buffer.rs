//! Timeline cells
//!
//! A [`Buffer`] carries one timestamp and a fixed pool of element slots.
//! A tracker following several tools fills one slot per tool; the presence
//! mask records which tools were actually seen at that instant.

use serde::{Deserialize, Serialize};

use crate::error::{ComError, Result};
use crate::timeline::Timestamp;

/// Largest pool a buffer can hold (one bit per slot in the presence mask)
pub const MAX_POOL_SIZE: usize = 64;

/// Timestamped pool of up to [`MAX_POOL_SIZE`] elements
///
/// Mutable until pushed into a timeline; shared immutably afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Buffer<T> {
    timestamp: Timestamp,
    elements: Vec<Option<T>>,
}

impl<T> Buffer<T> {
    /// Create an empty buffer
    ///
    /// # Errors
    ///
    /// - [`ComError::InvalidPoolSize`] - `pool_size` is 0 or above [`MAX_POOL_SIZE`]
    pub fn new(timestamp: Timestamp, pool_size: usize) -> Result<Self> {
        validate_pool_size(pool_size)?;
        Ok(Self::empty(timestamp, pool_size))
    }

    /// Single-element buffer with the element present
    pub fn single(timestamp: Timestamp, element: T) -> Self {
        Buffer {
            timestamp,
            elements: vec![Some(element)],
        }
    }

    pub(crate) fn empty(timestamp: Timestamp, pool_size: usize) -> Self {
        Buffer {
            timestamp,
            elements: std::iter::repeat_with(|| None).take(pool_size).collect(),
        }
    }

    /// Timestamp this buffer is stored under
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Number of element slots
    pub fn pool_size(&self) -> usize {
        self.elements.len()
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.elements.len() {
            return Err(ComError::InvalidElementIndex {
                index,
                max: self.elements.len(),
            });
        }
        Ok(())
    }

    /// Store `element` at `index` and mark it present
    ///
    /// # Errors
    ///
    /// - [`ComError::InvalidElementIndex`] - `index` is outside the pool
    pub fn set_element(&mut self, index: usize, element: T) -> Result<()> {
        self.check_index(index)?;
        self.elements[index] = Some(element);
        Ok(())
    }

    /// Store `element` in the first free slot and return its index
    ///
    /// # Errors
    ///
    /// - [`ComError::InvalidElementIndex`] - Every slot is already present
    pub fn add_element(&mut self, element: T) -> Result<usize> {
        let index = self
            .elements
            .iter()
            .position(Option::is_none)
            .ok_or(ComError::InvalidElementIndex {
                index: self.elements.len(),
                max: self.elements.len(),
            })?;
        self.elements[index] = Some(element);
        Ok(index)
    }

    /// Clear slot `index`, returning what it held
    pub fn remove_element(&mut self, index: usize) -> Option<T> {
        self.elements.get_mut(index)?.take()
    }

    /// Element at `index`, if present
    pub fn element(&self, index: usize) -> Option<&T> {
        self.elements.get(index)?.as_ref()
    }

    /// Whether slot `index` holds an element
    pub fn is_present(&self, index: usize) -> bool {
        self.element(index).is_some()
    }

    /// Presence bit mask; bit `i` is set when slot `i` is present
    pub fn mask(&self) -> u64 {
        self.elements
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_some())
            .fold(0, |mask, (i, _)| mask | (1u64 << i))
    }

    /// Number of present elements
    pub fn present_count(&self) -> usize {
        self.elements.iter().filter(|e| e.is_some()).count()
    }

    /// Present elements with their slot index
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.elements
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|e| (i, e)))
    }
}

pub(crate) fn validate_pool_size(pool_size: usize) -> Result<()> {
    if pool_size == 0 || pool_size > MAX_POOL_SIZE {
        return Err(ComError::InvalidPoolSize(pool_size));
    }
    Ok(())
}
