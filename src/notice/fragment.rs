use anyhow::bail;
use bytes::{Bytes, BytesMut};

/// Position of a fragment's body inside the body of the notice it was split from
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FragmentRange {
    pub offset: u32,
    pub total: u32,
}
impl FragmentRange {
    pub fn new(offset: u32, total: u32) -> anyhow::Result<FragmentRange> {
        if offset > total {
            bail!("fragment offset {} is beyond total length {}", offset, total);
        }
        Ok(FragmentRange { offset, total })
    }

    /// the range describing an unfragmented body
    pub fn whole(body_len: usize) -> FragmentRange {
        FragmentRange {
            offset: 0,
            total: body_len as u32,
        }
    }
}

/// Slices `body` into chunks of at most `frag_size` bytes. `base` is the position of `body` in
///  the original notice - a notice that is already a fragment keeps offsets relative to the
///  original body when it is split further.
///
/// An empty body yields a single empty fragment.
pub fn split_body(body: &Bytes, base: FragmentRange, frag_size: usize) -> anyhow::Result<Vec<(FragmentRange, Bytes)>> {
    if frag_size == 0 {
        bail!("fragment size must be positive");
    }
    if base.offset as usize + body.len() > base.total as usize {
        bail!("body of {} bytes at offset {} exceeds total length {}", body.len(), base.offset, base.total);
    }

    if body.is_empty() {
        return Ok(vec![(base, Bytes::new())]);
    }

    let mut result = Vec::new();
    let mut pos = 0;
    while pos < body.len() {
        let end = (pos + frag_size).min(body.len());
        let range = FragmentRange {
            offset: base.offset + pos as u32,
            total: base.total,
        };
        result.push((range, body.slice(pos..end)));
        pos = end;
    }
    Ok(result)
}

/// Puts fragments back together. Fragments may arrive in any order and may overlap (duplicates
///  after retransmission); the result is only returned if the fragments cover the whole body.
pub fn reassemble(fragments: &[(FragmentRange, Bytes)]) -> anyhow::Result<Bytes> {
    let total = match fragments.first() {
        None => bail!("no fragments"),
        Some((r, _)) => r.total,
    };

    let mut sorted = fragments.iter().collect::<Vec<_>>();
    sorted.sort_by_key(|(r, _)| r.offset);

    let mut result = BytesMut::with_capacity(total as usize);
    for (range, data) in sorted {
        if range.total != total {
            bail!("fragments disagree on total length: {} vs. {}", range.total, total);
        }
        let offset = range.offset as usize;
        let end = offset + data.len();
        if end > total as usize {
            bail!("fragment at {} with {} bytes exceeds total length {}", offset, data.len(), total);
        }
        if offset > result.len() {
            bail!("missing fragment data at offset {}", result.len());
        }
        if end > result.len() {
            result.extend_from_slice(&data[result.len() - offset..]);
        }
    }

    if result.len() != total as usize {
        bail!("missing fragment data at offset {}", result.len());
    }
    Ok(result.freeze())
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    fn body(len: usize) -> Bytes {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
    }

    #[test]
    fn test_split_reassemble() {
        for len in [0usize, 1, 2, 7, 64, 100, 1000] {
            for frag_size in [1usize, 3, 64, 99, 100, 2000] {
                let original = body(len);
                let fragments = split_body(&original, FragmentRange::whole(len), frag_size).unwrap();
                assert_eq!(fragments.len(), len.div_ceil(frag_size).max(1));
                assert!(fragments.iter().all(|(_, b)| b.len() <= frag_size));
                assert_eq!(reassemble(&fragments).unwrap(), original, "len {} frag size {}", len, frag_size);

                let mut reversed = fragments.clone();
                reversed.reverse();
                assert_eq!(reassemble(&reversed).unwrap(), original);
            }
        }
    }

    #[test]
    fn test_split_keeps_base_offset() {
        let fragments = split_body(&Bytes::from_static(b"abcde"), FragmentRange { offset: 10, total: 20 }, 2).unwrap();
        assert_eq!(fragments, vec![
            (FragmentRange { offset: 10, total: 20 }, Bytes::from_static(b"ab")),
            (FragmentRange { offset: 12, total: 20 }, Bytes::from_static(b"cd")),
            (FragmentRange { offset: 14, total: 20 }, Bytes::from_static(b"e")),
        ]);
    }

    #[rstest]
    #[case::zero_frag_size(b"abc", FragmentRange { offset: 0, total: 3 }, 0)]
    #[case::exceeds_total(b"abc", FragmentRange { offset: 1, total: 3 }, 2)]
    fn test_split_invalid(#[case] data: &'static [u8], #[case] base: FragmentRange, #[case] frag_size: usize) {
        assert!(split_body(&Bytes::from_static(data), base, frag_size).is_err());
    }

    #[test]
    fn test_reassemble_duplicates() {
        let fragments = vec![
            (FragmentRange { offset: 0, total: 4 }, Bytes::from_static(b"ab")),
            (FragmentRange { offset: 2, total: 4 }, Bytes::from_static(b"cd")),
            (FragmentRange { offset: 0, total: 4 }, Bytes::from_static(b"ab")),
        ];
        assert_eq!(reassemble(&fragments).unwrap(), Bytes::from_static(b"abcd"));
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::gap(vec![(FragmentRange { offset: 0, total: 4 }, Bytes::from_static(b"a")), (FragmentRange { offset: 2, total: 4 }, Bytes::from_static(b"cd"))])]
    #[case::missing_tail(vec![(FragmentRange { offset: 0, total: 4 }, Bytes::from_static(b"ab"))])]
    #[case::inconsistent_total(vec![(FragmentRange { offset: 0, total: 4 }, Bytes::from_static(b"ab")), (FragmentRange { offset: 2, total: 5 }, Bytes::from_static(b"cd"))])]
    #[case::overflow(vec![(FragmentRange { offset: 3, total: 4 }, Bytes::from_static(b"ab"))])]
    fn test_reassemble_invalid(#[case] fragments: Vec<(FragmentRange, Bytes)>) {
        assert!(reassemble(&fragments).is_err());
    }

    #[rstest]
    #[case::valid(3, 5, true)]
    #[case::at_end(5, 5, true)]
    #[case::beyond(6, 5, false)]
    fn test_range_new(#[case] offset: u32, #[case] total: u32, #[case] valid: bool) {
        assert_eq!(FragmentRange::new(offset, total).is_ok(), valid);
    }
}
