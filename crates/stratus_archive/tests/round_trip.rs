use stratus_archive::{EntryKind, MAGIC, Packer, pack_stream, unpack, unpack_stream};
use stratus_core::error::ArchiveError;
use stratus_core::glob::PatternSet;

use futures::StreamExt;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;

fn set_mtime(path: &Path, t: SystemTime) {
    File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(t)
        .unwrap();
}

fn mtime(path: &Path) -> SystemTime {
    fs::metadata(path).unwrap().modified().unwrap()
}

fn build_tree(root: &Path) {
    fs::create_dir_all(root.join("results/nested/deeper")).unwrap();
    fs::create_dir_all(root.join("empty-dir")).unwrap();
    fs::create_dir_all(root.join("scripts/__pycache__")).unwrap();
    fs::write(root.join("Snakefile"), "rule all:\n    input: 'results/tree.nwk'\n").unwrap();
    fs::write(root.join("empty.txt"), "").unwrap();
    fs::write(root.join("résumé-数据.tsv"), "strain\tdate\n").unwrap();
    fs::write(root.join("results/nested/deeper/tree.nwk"), vec![b'('; 64 * 1024]).unwrap();
    fs::write(root.join("scripts/__pycache__/x.pyc"), "bytecode").unwrap();
    fs::write(root.join("environment"), "AWS_SECRET_ACCESS_KEY=x").unwrap();

    let base = UNIX_EPOCH + Duration::new(1_600_000_000, 123_456_789);
    for (i, file) in [
        "Snakefile",
        "empty.txt",
        "résumé-数据.tsv",
        "results/nested/deeper/tree.nwk",
    ]
    .iter()
    .enumerate()
    {
        set_mtime(&root.join(file), base + Duration::from_secs(i as u64 * 60));
    }
}

#[test]
fn round_trip_preserves_content_and_mtimes() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    build_tree(src.path());

    let mut archive = Vec::new();
    Packer::new(src.path(), &PatternSet::default())
        .write_to(&mut archive, |_| {})
        .unwrap();
    let summary = unpack(archive.as_slice(), dst.path(), |_| true).unwrap();

    for file in [
        "Snakefile",
        "empty.txt",
        "résumé-数据.tsv",
        "results/nested/deeper/tree.nwk",
    ] {
        let (a, b) = (src.path().join(file), dst.path().join(file));
        assert_eq!(fs::read(&a).unwrap(), fs::read(&b).unwrap(), "{file}");
        assert_eq!(mtime(&a), mtime(&b), "{file}");
    }
    assert!(dst.path().join("empty-dir").is_dir());
    assert_eq!(summary.written.len(), 4);
    assert_eq!(summary.skipped, 0);
}

#[test]
fn excluded_and_always_excluded_paths_are_not_archived() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    build_tree(src.path());

    let exclude = PatternSet::parse(["results/", "*.tsv"]).unwrap();
    let mut archive = Vec::new();
    let mut seen = Vec::new();
    Packer::new(src.path(), &exclude)
        .write_to(&mut archive, |entry| seen.push(entry.path.clone()))
        .unwrap();
    unpack(archive.as_slice(), dst.path(), |_| true).unwrap();

    assert_eq!(seen, ["Snakefile", "empty-dir", "empty.txt", "scripts"]);
    assert!(!dst.path().join("results").exists());
    assert!(!dst.path().join("environment").exists());
    assert!(!dst.path().join("scripts/__pycache__").exists());
}

#[test]
fn unselected_entries_are_skipped() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    build_tree(src.path());

    let mut archive = Vec::new();
    Packer::new(src.path(), &PatternSet::default())
        .write_to(&mut archive, |_| {})
        .unwrap();
    let summary = unpack(archive.as_slice(), dst.path(), |entry| {
        entry.kind == EntryKind::File && entry.path.starts_with("results/")
    })
    .unwrap();

    assert_eq!(summary.written, ["results/nested/deeper/tree.nwk"]);
    assert!(!dst.path().join("Snakefile").exists());
    assert!(dst.path().join("results/nested/deeper/tree.nwk").is_file());
}

fn raw_entry(archive: &mut Vec<u8>, path: &str, content: &[u8]) {
    archive.push(1);
    archive.extend_from_slice(&(path.len() as u16).to_le_bytes());
    archive.extend_from_slice(path.as_bytes());
    archive.extend_from_slice(&1_600_000_000i64.to_le_bytes());
    archive.extend_from_slice(&0u32.to_le_bytes());
    archive.extend_from_slice(&0o644u32.to_le_bytes());
    archive.extend_from_slice(&(content.len() as u64).to_le_bytes());
    archive.extend_from_slice(content);
}

fn compress(raw: &[u8]) -> Vec<u8> {
    let mut encoder = zstd::Encoder::new(Vec::new(), 3).unwrap();
    encoder.write_all(raw).unwrap();
    encoder.finish().unwrap()
}

#[test]
fn path_traversal_aborts_the_unpack() {
    let outer = tempfile::tempdir().unwrap();
    let target = outer.path().join("build");
    fs::create_dir(&target).unwrap();

    let mut raw = MAGIC.to_vec();
    raw_entry(&mut raw, "ok.txt", b"fine");
    raw_entry(&mut raw, "../escaped.txt", b"evil");
    raw_entry(&mut raw, "after.txt", b"never");
    raw.push(0);

    let err = unpack(compress(&raw).as_slice(), &target, |_| true).unwrap_err();

    assert!(matches!(err, ArchiveError::PathEscape(p) if p == "../escaped.txt"));
    assert!(!outer.path().join("escaped.txt").exists());
    assert!(!target.join("after.txt").exists());
}

#[test]
fn truncated_archives_are_malformed() {
    let dst = tempfile::tempdir().unwrap();
    let mut raw = MAGIC.to_vec();
    raw_entry(&mut raw, "half.txt", b"0123456789");
    raw.truncate(raw.len() - 4);

    let err = unpack(compress(&raw).as_slice(), dst.path(), |_| true).unwrap_err();

    assert!(matches!(err, ArchiveError::Malformed(_)));
    assert!(!dst.path().join("half.txt").exists());
}

#[test]
fn foreign_data_is_rejected() {
    let dst = tempfile::tempdir().unwrap();
    let err = unpack(compress(b"PK\x03\x04 not ours").as_slice(), dst.path(), |_| true)
        .unwrap_err();
    assert!(matches!(err, ArchiveError::Malformed(_)));
}

#[tokio::test]
async fn streams_round_trip_without_staging() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    build_tree(src.path());

    let packer = Packer::new(src.path(), &PatternSet::default());
    let source = pack_stream(packer, |_| {});
    let summary = unpack_stream(
        source,
        dst.path().to_path_buf(),
        |_| true,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(summary.written.len(), 4);
    let tree = "results/nested/deeper/tree.nwk";
    assert_eq!(
        mtime(&src.path().join(tree)),
        mtime(&dst.path().join(tree))
    );
}

#[tokio::test]
async fn pack_failures_end_the_stream_with_an_error() {
    let missing = tempfile::tempdir().unwrap().path().join("gone");
    let mut source = pack_stream(Packer::new(missing, &PatternSet::default()), |_| {});

    let mut failed = false;
    while let Some(chunk) = source.next().await {
        if chunk.is_err() {
            failed = true;
        }
    }
    assert!(failed);
}

#[tokio::test]
async fn cancelled_unpacks_stop_early() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    build_tree(src.path());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let source = pack_stream(Packer::new(src.path(), &PatternSet::default()), |_| {});

    let result = unpack_stream(source, dst.path().to_path_buf(), |_| true, cancel).await;

    assert!(result.is_err());
    assert!(!dst.path().join("Snakefile").exists());
}
