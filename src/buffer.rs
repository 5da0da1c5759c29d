//! Growable-buffer helpers shared by the record layer.

use bytes::BytesMut;

/// Concatenates two optional buffers into one.
///
/// Very flexible: either or both buffers may be `None` or empty. When only
/// one operand carries data it is returned unchanged, and a zero-total-length
/// result never allocates.
pub fn cat_buffers(b1: Option<BytesMut>, b2: Option<BytesMut>) -> Option<BytesMut> {
    let b1 = b1.filter(|b| !b.is_empty());
    let b2 = b2.filter(|b| !b.is_empty());

    match (b1, b2) {
        (Some(b1), None) => Some(b1),
        (None, Some(b2)) => Some(b2),
        (None, None) => None,
        (Some(b1), Some(b2)) => {
            let mut out = BytesMut::with_capacity(b1.len() + b2.len());
            out.extend_from_slice(&b1);
            out.extend_from_slice(&b2);
            Some(out)
        }
    }
}

/// Doubles the capacity of the buffer so that more data may be added.
///
/// Contents are preserved; the old buffer is consumed so nothing can alias
/// its storage afterwards. A zero-capacity buffer grows to capacity 1.
pub fn double_buffer(b: BytesMut) -> BytesMut {
    let new_cap = std::cmp::max(b.capacity() * 2, 1);
    let mut d = BytesMut::with_capacity(new_cap);
    d.extend_from_slice(&b);
    d
}

/// Fills a buffer with zeros and clears it, useful if it has been used to
/// store a password or key material.
pub fn zero_buffer(b: &mut BytesMut) {
    b.iter_mut().for_each(|byte| *byte = 0);
    b.clear();
}

/// Makes a copy of a buffer that shares no storage with the original.
pub fn duplicate_buffer(b: &[u8]) -> BytesMut {
    BytesMut::from(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cat_returns_nonempty_operand_unchanged() {
        let data = BytesMut::from(&b"abc"[..]);
        let ptr = data.as_ptr();

        let out = cat_buffers(Some(data), None).unwrap();
        assert_eq!(&out[..], b"abc");
        assert_eq!(out.as_ptr(), ptr);

        let data = BytesMut::from(&b"xyz"[..]);
        let out = cat_buffers(Some(BytesMut::new()), Some(data)).unwrap();
        assert_eq!(&out[..], b"xyz");
    }

    #[test]
    fn cat_of_nothing_is_none() {
        assert!(cat_buffers(None, None).is_none());
        assert!(cat_buffers(Some(BytesMut::new()), Some(BytesMut::new())).is_none());
    }

    #[test]
    fn cat_joins_both() {
        let out = cat_buffers(
            Some(BytesMut::from(&b"abc"[..])),
            Some(BytesMut::from(&b"def"[..])),
        )
        .unwrap();
        assert_eq!(&out[..], b"abcdef");
    }

    #[test]
    fn double_preserves_contents() {
        let mut b = BytesMut::with_capacity(4);
        b.extend_from_slice(b"abcd");
        let grown = double_buffer(b);
        assert_eq!(&grown[..], b"abcd");
        assert!(grown.capacity() >= 8);
    }

    #[test]
    fn double_handles_zero_capacity() {
        let grown = double_buffer(BytesMut::new());
        assert!(grown.capacity() >= 1);
        assert!(grown.is_empty());
    }

    #[test]
    fn zero_wipes_and_clears() {
        let mut b = BytesMut::from(&b"secret"[..]);
        zero_buffer(&mut b);
        assert!(b.is_empty());
    }

    #[test]
    fn duplicate_shares_no_storage() {
        let original = BytesMut::from(&b"key material"[..]);
        let copy = duplicate_buffer(&original);
        assert_eq!(&copy[..], &original[..]);
        assert_ne!(copy.as_ptr(), original.as_ptr());
    }
}
