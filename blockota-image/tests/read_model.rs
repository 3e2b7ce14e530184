use blockota_image::writer::SparseWriter;
use blockota_image::{HashAlgorithm, ImageOptions, RangeSet, SparseImage};
use proptest::prelude::*;

const BS: usize = 8;

#[derive(Debug, Clone)]
enum Piece {
    Raw(Vec<u8>),
    Fill([u8; 4], u32),
    DontCare(u32),
}

fn piece() -> impl Strategy<Value = Piece> {
    prop_oneof![
        (1usize..4, any::<u8>()).prop_map(|(n, b)| Piece::Raw(
            (0..n * BS).map(|i| b.wrapping_add(i as u8)).collect()
        )),
        (any::<[u8; 4]>(), 1u32..4).prop_map(|(w, n)| Piece::Fill(w, n)),
        (1u32..4).prop_map(Piece::DontCare),
    ]
}

/// Builds the sparse image and the flat bytes it should unsparse to.
fn build(pieces: &[Piece], tail: u32) -> (Vec<u8>, Vec<u8>) {
    let mut flat = Vec::new();
    let mut blocks = 0;

    for p in pieces {
        match p {
            Piece::Raw(data) => {
                flat.extend_from_slice(data);
                blocks += (data.len() / BS) as u32;
            }
            Piece::Fill(w, n) => {
                flat.extend(w.repeat(*n as usize * BS / 4));
                blocks += n;
            }
            Piece::DontCare(n) => {
                flat.extend(vec![0; *n as usize * BS]);
                blocks += n;
            }
        }
    }

    flat.extend(vec![0; tail as usize * BS]);

    let mut writer = SparseWriter::new(BS as u32, blocks + tail);
    for p in pieces {
        writer = match p {
            Piece::Raw(data) => writer.raw(data),
            Piece::Fill(w, n) => writer.fill(*w, *n),
            Piece::DontCare(n) => writer.dont_care(*n),
        };
    }

    (writer.finish(), flat)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn reads_match_unsparsed_bytes(
        pieces in proptest::collection::vec(piece(), 1..8),
        tail in 0u32..3,
        picks in proptest::collection::btree_set(0u64..64, 0..12),
    ) {
        let (sparse, flat) = build(&pieces, tail);
        let total = (flat.len() / BS) as u64;
        let image = SparseImage::open(sparse, "", &ImageOptions::default()).unwrap();

        prop_assert_eq!(image.total_blocks(), total);

        let mut endpoints: Vec<u64> = picks.into_iter().filter(|&b| b <= total).collect();
        if endpoints.len() % 2 == 1 {
            endpoints.pop();
        }
        let ranges = RangeSet::from_endpoints(endpoints);

        let expected: Vec<u8> = ranges
            .blocks()
            .flat_map(|b| flat[b as usize * BS..(b as usize + 1) * BS].to_vec())
            .collect();

        prop_assert_eq!(image.read_to_vec(&ranges).unwrap(), expected.clone());
        prop_assert_eq!(
            image.digest(&ranges, HashAlgorithm::Sha384).unwrap(),
            HashAlgorithm::Sha384.digest(&expected)
        );
    }

    #[test]
    fn file_map_partitions_care_blocks(
        pieces in proptest::collection::vec(piece(), 1..8),
        group in 1u64..4,
    ) {
        let (sparse, _) = build(&pieces, 0);
        let options = ImageOptions::default().with_max_blocks_per_group(group);
        let image = SparseImage::open(sparse, "", &options).unwrap();

        let mut seen = RangeSet::new();
        for (name, ranges) in image.file_map().iter() {
            prop_assert!(!seen.overlaps(ranges), "{} overlaps earlier entries", name);
            if name.starts_with("__NONZERO") {
                prop_assert!(ranges.size() <= group);
            }
            seen = seen.union(ranges);
        }

        prop_assert_eq!(&seen, image.care_ranges());
    }
}
