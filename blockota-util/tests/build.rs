use blockota_diff::UpdateConfig;
use blockota_diff::differ::{DiffError, DiffMode, Differ};
use blockota_image::writer::SparseWriter;
use blockota_image::{ImageOptions, RangeSet, SparseImage};
use blockota_util::{
    BuildError, BuildOptions, IncrementalBuilder, NoScript, PartitionArtifacts, ScriptHooks,
    SilentProgress, UpdateProgress, WriteArtifactsError, write_artifacts,
};
use std::cell::RefCell;
use std::path::Path;
use std::sync::Mutex;

const BS: usize = 16;

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

#[derive(Default)]
struct Events(Mutex<Vec<String>>);

impl Events {
    fn push(&self, event: String) {
        self.0.lock().unwrap().push(event);
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

impl UpdateProgress for Events {
    fn partition_start(&self, name: &str, current: usize, total: usize) {
        self.push(format!("start {name} {current}/{total}"));
    }

    fn partition_skipped(&self, name: &str, _reason: &str) {
        self.push(format!("skip {name}"));
    }

    fn partition_completed(&self, name: &str, _: &PartitionArtifacts) {
        self.push(format!("done {name}"));
    }

    fn build_completed(&self, built: usize, skipped: usize) {
        self.push(format!("finished {built} {skipped}"));
    }
}

#[derive(Default)]
struct Script(RefCell<Vec<String>>);

impl ScriptHooks for Script {
    fn verify_source(&self, partition: &str, touched: &RangeSet, _hash: &str) {
        self.0
            .borrow_mut()
            .push(format!("verify {partition} {}", touched.to_raw_string()));
    }

    fn block_update(&self, partition: &str, _: &PartitionArtifacts) {
        self.0.borrow_mut().push(format!("update {partition}"));
    }
}

fn sparse_bytes(content: &[u8]) -> Vec<u8> {
    let data: Vec<u8> = content.iter().flat_map(|&b| [b; BS]).collect();

    SparseWriter::new(BS as u32, content.len() as u32)
        .raw(&data)
        .finish()
}

fn write_image(dir: &Path, name: &str, content: &[u8], map: &str) {
    std::fs::write(dir.join(format!("{name}.img")), sparse_bytes(content)).unwrap();
    std::fs::write(dir.join(format!("{name}.map")), map).unwrap();
}

fn dir_listing(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn builds_present_partitions_and_skips_missing_ones() {
    let root = tempfile::tempdir().unwrap();
    let (source, target, out) = (
        root.path().join("source"),
        root.path().join("target"),
        root.path().join("out"),
    );
    std::fs::create_dir(&source).unwrap();
    std::fs::create_dir(&target).unwrap();

    write_image(&source, "system", b"AAAA", "a 0-3");
    write_image(&target, "system", b"AABAbb", "a 0-3\nb 4-5");
    write_image(&source, "odm", b"oo", "o 0-1");
    write_image(&target, "odm", b"pp", "o 0-1");
    write_image(&target, "vendor", b"vv", "v 0-1");

    let options = BuildOptions::new(&source, &target, &out)
        .with_partitions(["system", "vendor", "odm"])
        .with_update_config(UpdateConfig::default().with_worker_threads(1));
    let events = Events::default();
    let script = Script::default();

    let builder = IncrementalBuilder::new(&options, Literal, &events, &script);
    let report = unsafe { builder.build() }.unwrap();

    let built: Vec<&str> = report.built.iter().map(|a| a.partition.as_str()).collect();
    assert_eq!(built, ["system", "odm"]);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].0, "vendor");
    assert!(report.skipped[0].1.contains("vendor.img"));

    assert_eq!(
        events.take(),
        [
            "start system 0/3",
            "done system",
            "start vendor 1/3",
            "skip vendor",
            "start odm 2/3",
            "done odm",
            "finished 2 1",
        ]
    );
    assert_eq!(
        script.0.into_inner(),
        [
            "verify system 2,0,4",
            "verify odm 2,0,2",
            "update system",
            "update odm",
        ]
    );

    let system = &report.built[0];
    assert_eq!(system.new_data, out.join("system.new.dat"));
    assert_eq!(std::fs::read(&system.new_data).unwrap(), vec![b'b'; 2 * BS]);
    assert_eq!(
        std::fs::metadata(&system.patch_data).unwrap().len(),
        system.update.patch_data_len
    );
    assert_eq!(
        std::fs::read_to_string(&system.transfer_list).unwrap(),
        system.update.transfer_list.to_string()
    );
    assert!(!out.join("vendor.transfer.list").exists());
}

#[test]
fn identical_images_are_rejected() {
    let root = tempfile::tempdir().unwrap();
    let source = root.path().join("source");
    let target = root.path().join("target");
    std::fs::create_dir(&source).unwrap();
    std::fs::create_dir(&target).unwrap();

    write_image(&source, "system", b"AAAA", "a 0-3");
    write_image(&target, "system", b"AAAA", "a 0-3");

    let options = BuildOptions::new(&source, &target, root.path().join("out"))
        .with_partitions(["system"]);
    let builder = IncrementalBuilder::new(&options, Literal, SilentProgress, NoScript);

    assert!(matches!(
        unsafe { builder.build() },
        Err(BuildError::IdenticalImages { partition }) if partition == "system"
    ));
}

#[test]
fn no_partitions_builds_nothing() {
    let root = tempfile::tempdir().unwrap();
    let options = BuildOptions::new(root.path(), root.path(), root.path().join("out"));
    let builder = IncrementalBuilder::new(&options, Literal, SilentProgress, NoScript);

    let report = unsafe { builder.build() }.unwrap();

    assert!(report.built.is_empty());
    assert!(report.skipped.is_empty());
    assert!(root.path().join("out").is_dir());
}

#[test]
fn failed_generation_leaves_no_files_behind() {
    let out = tempfile::tempdir().unwrap();
    let options = ImageOptions::default();
    let source = SparseImage::open(sparse_bytes(b"AAAA"), "a 0-3", &options).unwrap();
    let target = SparseImage::open(sparse_bytes(b"AABAbb"), "a 0-3\nb 4-5", &options).unwrap();
    let config = UpdateConfig::default().with_worker_threads(1);

    let result = write_artifacts(out.path(), "system", &source, &target, &Broken, &config);
    assert!(matches!(
        result,
        Err(WriteArtifactsError::Generate { partition, .. }) if partition == "system"
    ));
    assert!(dir_listing(out.path()).is_empty());

    // Files from an earlier build are left alone.
    std::fs::write(out.path().join("system.transfer.list"), "old").unwrap();
    write_artifacts(out.path(), "system", &source, &target, &Broken, &config).unwrap_err();

    assert_eq!(dir_listing(out.path()), ["system.transfer.list"]);
    assert_eq!(
        std::fs::read_to_string(out.path().join("system.transfer.list")).unwrap(),
        "old"
    );

    let written = write_artifacts(out.path(), "system", &source, &target, &Literal, &config)
        .unwrap();
    assert_eq!(
        dir_listing(out.path()),
        ["system.new.dat", "system.patch.dat", "system.transfer.list"]
    );
    assert_eq!(
        std::fs::read_to_string(&written.transfer_list).unwrap(),
        written.update.transfer_list.to_string()
    );
    assert_eq!(std::fs::read(&written.new_data).unwrap(), vec![b'b'; 2 * BS]);
}
