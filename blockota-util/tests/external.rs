#![cfg(unix)]

use blockota_diff::differ::{DiffError, DiffMode, Differ};
use blockota_util::ExternalDiffer;

/// Writes `<mode>:<target bytes>` to the patch path.
const FAKE_TOOL: &str = r#"
mode=imgdiff
while [ $# -gt 0 ]; do
    case "$1" in
        -b) mode=bsdiff; shift 2 ;;
        -s) shift 2 ;;
        -d) target=$2; shift 2 ;;
        -p) patch=$2; shift 2 ;;
        *) shift ;;
    esac
done
printf '%s:' "$mode" > "$patch"
cat "$target" >> "$patch"
"#;

const FAILING_TOOL: &str = r#"
echo "cannot diff" >&2
exit 3
"#;

#[test]
fn runs_tool_and_reports_failures() {
    let dir = tempfile::tempdir().unwrap();
    let tool = dir.path().join("tool.sh");
    let failing = dir.path().join("failing.sh");
    std::fs::write(&tool, FAKE_TOOL).unwrap();
    std::fs::write(&failing, FAILING_TOOL).unwrap();

    let differ = ExternalDiffer::new("sh").arg(&tool);
    assert_eq!(
        differ.diff(b"old", b"new", DiffMode::Bsdiff).unwrap(),
        b"bsdiff:new"
    );
    assert_eq!(
        differ.diff(b"old", b"new", DiffMode::Imgdiff).unwrap(),
        b"imgdiff:new"
    );

    let differ = ExternalDiffer::new("sh").arg(&failing);
    match differ.diff(b"old", b"new", DiffMode::Bsdiff) {
        Err(DiffError::ToolFailed { program, output, .. }) => {
            assert_eq!(program, "sh");
            assert_eq!(output, "cannot diff");
        }
        other => panic!("unexpected result: {other:?}"),
    }

    let missing = ExternalDiffer::new(dir.path().join("no-such-tool"));
    assert!(matches!(
        missing.diff(b"", b"", DiffMode::Bsdiff),
        Err(DiffError::Spawn { .. })
    ));
}
