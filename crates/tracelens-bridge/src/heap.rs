//! Bounds-checked extraction out of the module's linear memory.
//!
//! Replies never carry payload bytes, only an `(offset, length)` descriptor
//! into the module's flat memory. The memory view must be re-read on every
//! extraction: a `memory.grow` inside the module replaces the backing buffer
//! and invalidates any previously obtained view.

/// An `(offset, length)` descriptor into the module's linear memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapRange {
    pub offset: u32,
    pub len: u32,
}

/// The descriptor falls outside the current linear memory view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapRangeError {
    pub offset: u32,
    pub len: u32,
    pub heap_len: usize,
}

/// Copies `range.len` bytes starting at `range.offset` out of `heap`.
///
/// The caller must pass the module's *current* memory view; the returned bytes
/// are owned so nothing borrows the view past this call.
pub fn extract(heap: &[u8], range: HeapRange) -> Result<Vec<u8>, HeapRangeError> {
    let start = range.offset as usize;
    // On 32-bit hosts (wasm32 included) `offset + len` can wrap in usize.
    let end = start.checked_add(range.len as usize);
    end.and_then(|end| heap.get(start..end))
        .map(<[u8]>::to_vec)
        .ok_or(HeapRangeError {
            offset: range.offset,
            len: range.len,
            heap_len: heap.len(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_exact_range() {
        let heap = [10u8, 20, 30, 40, 50, 60];
        let bytes = extract(&heap, HeapRange { offset: 0, len: 5 }).unwrap();
        assert_eq!(bytes, vec![10, 20, 30, 40, 50]);
    }

    #[test]
    fn extracts_interior_and_empty_ranges() {
        let heap = [1u8, 2, 3, 4];
        assert_eq!(extract(&heap, HeapRange { offset: 1, len: 2 }).unwrap(), vec![2, 3]);
        assert_eq!(extract(&heap, HeapRange { offset: 4, len: 0 }).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn rejects_out_of_bounds() {
        let heap = [0u8; 8];
        let err = extract(&heap, HeapRange { offset: 4, len: 5 }).unwrap_err();
        assert_eq!(err.heap_len, 8);
        assert!(extract(&heap, HeapRange { offset: 9, len: 0 }).is_err());
    }

    #[test]
    fn rejects_offset_len_wraparound() {
        let heap = [0u8; 8];
        assert!(extract(&heap, HeapRange { offset: u32::MAX, len: u32::MAX }).is_err());
    }
}
