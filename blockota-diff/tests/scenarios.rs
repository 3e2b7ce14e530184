use blockota_diff::differ::{DiffError, DiffMode, Differ};
use blockota_diff::generate::{GenerateError, PartitionUpdate};
use blockota_diff::transfer::Command;
use blockota_diff::{ActionKind, Error, UpdateConfig, generate_update};
use blockota_image::writer::SparseWriter;
use blockota_image::{HashAlgorithm, ImageOptions, RangeSet, SparseImage};

const BS: usize = 16;

/// Emits `P` followed by the target bytes.
struct Literal;

impl Differ for Literal {
    fn diff(&self, _: &[u8], target: &[u8], _: DiffMode) -> Result<Vec<u8>, DiffError> {
        let mut patch = vec![b'P'];
        patch.extend_from_slice(target);
        Ok(patch)
    }
}

struct Broken;

impl Differ for Broken {
    fn diff(&self, _: &[u8], _: &[u8], _: DiffMode) -> Result<Vec<u8>, DiffError> {
        Err(DiffError::ToolFailed {
            program: "diff".into(),
            status: "exit status: 2".into(),
            output: "boom".into(),
        })
    }
}

enum Chunk<'a> {
    Raw(&'a [u8]),
    Zero(u32),
    Skip(u32),
}

/// Builds a sparse image; each byte of a `Raw` chunk becomes one block.
fn image(chunks: &[Chunk<'_>], map: &str, margin: u64) -> SparseImage<Vec<u8>> {
    let total: u32 = chunks
        .iter()
        .map(|c| match c {
            Chunk::Raw(b) => b.len() as u32,
            Chunk::Zero(n) | Chunk::Skip(n) => *n,
        })
        .sum();

    let mut writer = SparseWriter::new(BS as u32, total);
    for chunk in chunks {
        writer = match chunk {
            Chunk::Raw(b) => writer.raw(&blocks(b)),
            Chunk::Zero(n) => writer.fill([0; 4], *n),
            Chunk::Skip(n) => writer.dont_care(*n),
        };
    }

    let options = ImageOptions::default().with_extend_margin(margin);
    SparseImage::open(writer.finish(), map, &options).unwrap()
}

fn blocks(content: &[u8]) -> Vec<u8> {
    content.iter().flat_map(|&b| [b; BS]).collect()
}

fn hash(content: &[u8]) -> String {
    HashAlgorithm::Sha256.digest(&blocks(content))
}

fn rs(text: &str) -> RangeSet {
    text.parse().unwrap()
}

fn config(threads: usize) -> UpdateConfig {
    UpdateConfig::default().with_worker_threads(threads)
}

fn run(
    source: &SparseImage<Vec<u8>>,
    target: &SparseImage<Vec<u8>>,
    config: &UpdateConfig,
) -> (PartitionUpdate, Vec<u8>, Vec<u8>) {
    let mut new_data = Vec::new();
    let mut patch_data = Vec::new();
    let update =
        generate_update(source, target, &Literal, config, &mut new_data, &mut patch_data).unwrap();

    (update, new_data, patch_data)
}

#[test]
fn changed_file_and_new_file() {
    let source = image(&[Chunk::Raw(b"AAAA")], "a 0-3", 0);
    let target = image(&[Chunk::Raw(b"AABAbb")], "a 0-3\nb 4-5", 0);

    let (update, new_data, patch_data) = run(&source, &target, &config(1));
    let list = &update.transfer_list;

    let kinds: Vec<(&str, ActionKind)> = update
        .actions
        .iter()
        .map(|a| (a.target_name(), a.kind()))
        .collect();
    assert_eq!(kinds, [("a", ActionKind::Different), ("b", ActionKind::New)]);

    assert_eq!(list.total_blocks, 6);
    assert_eq!(new_data, blocks(b"bb"));
    assert_eq!(patch_data.len(), 1 + 4 * BS);
    assert_eq!(&patch_data[1..], blocks(b"AABA"));

    // Patching in place needs the whole source in scratch space.
    assert_eq!(list.max_stashed_blocks, 4);
    assert_eq!(list.max_stash_entries, 0);

    assert_eq!(
        list.to_string(),
        format!(
            "1\n6\n0\n4\n\
             bsdiff 0 65 {} {} 2,0,4 4 2,0,4\n\
             new 2,4,6\n",
            hash(b"AAAA"),
            hash(b"AABA"),
        )
    );

    assert_eq!(update.touched_source, rs("0-3"));
    assert_eq!(update.touched_source_hash, hash(b"AAAA"));
    assert_eq!(update.new_data_len, 2 * BS as u64);
    assert_eq!(update.patch_data_len, 65);
}

#[test]
fn swapped_files_use_a_stash() {
    let source = image(&[Chunk::Raw(b"aacc")], "a 0-1\nc 2-3", 0);
    let target = image(&[Chunk::Raw(b"ccaa")], "c 0-1\na 2-3", 0);

    let (update, new_data, patch_data) = run(&source, &target, &config(1));
    let list = &update.transfer_list;

    assert!(new_data.is_empty());
    assert!(patch_data.is_empty());
    assert!(update.actions.iter().all(|a| a.kind() == ActionKind::Move));

    assert_eq!(list.total_blocks, 4);
    assert_eq!(list.max_stash_entries, 1);
    assert!(list.max_stashed_blocks >= 2);
    assert_eq!(list.commands_named("stash").count(), 1);
    assert_eq!(list.commands_named("free").count(), 1);

    let (ha, hc) = (hash(b"aa"), hash(b"cc"));
    assert_eq!(
        list.to_string(),
        format!(
            "1\n4\n1\n2\n\
             stash {hc} 2,2,4\n\
             move {ha} 2,2,4 2 2,0,2\n\
             move {hc} 2,0,2 2 - {hc}:2,0,2\n\
             free {hc}\n"
        )
    );
}

#[test]
fn partly_overwritten_source_mixes_live_and_stashed_blocks() {
    // Moving `a` overwrites the upper half of `b`'s source before `b` runs.
    let source = image(&[Chunk::Raw(b"aawxyz")], "a 0-1\nb 2-5", 0);
    let target = image(&[Chunk::Raw(b"wxyzaa")], "b 0-3\na 4-5", 0);

    let (update, new_data, patch_data) = run(&source, &target, &config(1));
    let list = &update.transfer_list;

    assert!(new_data.is_empty());
    assert!(patch_data.is_empty());
    assert_eq!(update.touched_source, rs("0-5"));

    let (ha, hb, hyz) = (hash(b"aa"), hash(b"wxyz"), hash(b"yz"));
    assert_eq!(
        list.to_string(),
        format!(
            "1\n6\n1\n6\n\
             stash {hyz} 2,4,6\n\
             move {ha} 2,4,6 2 2,0,2\n\
             move {hb} 2,0,4 4 2,2,4 2,0,2 {hyz}:2,2,4\n\
             free {hyz}\n"
        )
    );

    let Some(Command::Move { source: b, .. }) = list.commands_named("move").nth(1) else {
        panic!("expected a second move");
    };
    assert_eq!(b.live, Some(rs("2-3")));
    assert_eq!(b.mapped_live, Some(rs("0-1")));
    assert_eq!(b.stashes, [(hyz, rs("2-3"))]);
}

#[test]
fn parallel_and_inline_agree() {
    let source = image(&[Chunk::Raw(b"abcdef")], "a 0-1\nc 2-3\ne 4-5", 0);
    let target = image(&[Chunk::Raw(b"effdab")], "e 0-1\nc 2-3\na 4-5", 0);

    let inline = run(&source, &target, &config(1));
    let parallel = run(&source, &target, &config(4));

    assert_eq!(inline.0.transfer_list, parallel.0.transfer_list);
    assert_eq!(inline.1, parallel.1);
    assert_eq!(inline.2, parallel.2);
}

#[test]
fn extended_and_dont_care_blocks() {
    // Source file lives in blocks the target does not care about.
    let source = image(
        &[Chunk::Skip(5), Chunk::Raw(b"yy"), Chunk::Skip(1)],
        "x 5-6",
        0,
    );
    let target = image(
        &[Chunk::Raw(b"xx"), Chunk::Zero(2), Chunk::Skip(4)],
        "x 0-1",
        1,
    );

    let (update, _, patch_data) = run(&source, &target, &config(1));
    let list = &update.transfer_list;

    assert_eq!(target.extended_ranges(), &rs("4"));
    assert_eq!(update.touched_source, rs("5-6"));
    assert_eq!(list.total_blocks, 5);
    assert_eq!(list.max_stashed_blocks, 0);
    assert_eq!(patch_data.len(), 33);

    assert_eq!(
        list.to_string(),
        format!(
            "1\n5\n0\n0\n\
             erase 2,7,8\n\
             bsdiff 0 33 {} {} 2,0,2 2 2,5,7\n\
             zero 2,2,4\n\
             zero 2,4,5\n\
             erase 2,5,7\n",
            hash(b"yy"),
            hash(b"xx"),
        )
    );
}

#[test]
fn blocks_already_zero_are_not_rewritten() {
    let source = image(&[Chunk::Raw(b"yy"), Chunk::Zero(2)], "x 0-1", 0);
    let target = image(&[Chunk::Raw(b"xx"), Chunk::Zero(2)], "x 0-1", 0);

    let (update, _, _) = run(&source, &target, &config(1));
    let list = &update.transfer_list;

    assert_eq!(list.commands_named("zero").count(), 0);
    assert_eq!(list.total_blocks, 2);
    assert!(update
        .actions
        .iter()
        .any(|a| a.kind() == ActionKind::Zero && a.source_ranges() == &rs("2-3")));
}

#[test]
fn long_runs_are_split() {
    let source = image(&[Chunk::Raw(b"q")], "q 0", 0);
    let target = image(&[Chunk::Raw(b"0123456789")], "n 0-9", 0);

    let config = config(1).with_max_blocks_per_command(4);
    let (update, new_data, _) = run(&source, &target, &config);
    let list = &update.transfer_list;

    let news: Vec<String> = list.commands_named("new").map(ToString::to_string).collect();
    assert_eq!(news, ["new 2,0,4", "new 2,4,8", "new 2,8,10"]);
    assert_eq!(new_data, blocks(b"0123456789"));
    assert_eq!(list.total_blocks, 10);
    assert!(update.touched_source.is_empty());
}

#[test]
fn long_erase_runs_are_split() {
    let source = image(&[Chunk::Raw(b"qqqqqq")], "q 0-5", 0);
    let target = image(&[Chunk::Raw(b"r"), Chunk::Skip(9)], "q 0", 0);

    let config = config(1).with_max_blocks_per_command(2);
    let (update, _, _) = run(&source, &target, &config);
    let list = &update.transfer_list;

    // Untouched blocks are erased up front, blocks still read by the diff last.
    let names: Vec<&str> = list.commands.iter().map(Command::name).collect();
    assert_eq!(names, ["erase", "erase", "bsdiff", "erase", "erase", "erase"]);

    let erases: Vec<String> = list.commands_named("erase").map(ToString::to_string).collect();
    assert_eq!(
        erases,
        ["erase 2,6,8", "erase 2,8,10", "erase 2,1,3", "erase 2,3,5", "erase 2,5,6"]
    );
    assert_eq!(list.total_blocks, 1);
}

#[test]
fn diff_failure_aborts_generation() {
    let source = image(&[Chunk::Raw(b"AAAA")], "a 0-3", 0);
    let target = image(&[Chunk::Raw(b"AABA")], "a 0-3", 0);

    let result = generate_update(
        &source,
        &target,
        &Broken,
        &config(1),
        Vec::new(),
        Vec::new(),
    );

    assert!(matches!(
        result,
        Err(Error::Generate {
            source: GenerateError::Diff { .. }
        })
    ));
}

#[test]
fn block_sizes_must_match() {
    let source = image(&[Chunk::Raw(b"A")], "a 0", 0);
    let target = SparseImage::open(
        SparseWriter::new(32, 1).raw(&[b'A'; 32]).finish(),
        "a 0",
        &ImageOptions::default(),
    )
    .unwrap();

    let result = generate_update(
        &source,
        &target,
        &Literal,
        &config(1),
        Vec::new(),
        Vec::new(),
    );

    assert!(matches!(
        result,
        Err(Error::BlockSizeMismatch {
            source_size: 16,
            target_size: 32
        })
    ));
}
