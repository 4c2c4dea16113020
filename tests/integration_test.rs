// tests/integration_test.rs

//! Integration tests for installdb
//!
//! These tests merge real image trees onto scratch roots and check the
//! results on disk, in the Contents Store and in the index.

use filetime::FileTime;
use installdb::contents::{read_contents, ContentsEntry};
use installdb::merger::{EntryType, MergeObserver, MergeReporter, Merger, Ownership, Partitioning};
use installdb::{
    check, merge, unmerge, CategoryName, ConfigProtect, ContentIndex, Error, MergeOptions, MergeParams, MergeTarget,
    QualifiedName,
};
use std::fs;
use std::os::unix::fs::{symlink, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A scratch image and root side by side
struct Scratch {
    dir: TempDir,
    image: PathBuf,
    root: PathBuf,
}

impl Scratch {
    fn new() -> Self {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("image");
        let root = dir.path().join("root");
        fs::create_dir(&image).unwrap();
        fs::create_dir(&root).unwrap();
        Self { dir, image, root }
    }

    fn image_file(&self, path: &str, content: &str) -> PathBuf {
        let path = self.image.join(path);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    fn root_file(&self, path: &str, content: &str) -> PathBuf {
        let path = self.root.join(path);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }
}

fn no_chown() -> MergeParams {
    MergeParams::new(MergeOptions {
        no_chown: true,
        ..Default::default()
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Kind {
    Nothing,
    File,
    Dir,
    SymToDir,
    SymToFile,
}

/// Create `kind` at `dir/entry`
fn make(dir: &Path, kind: Kind) {
    let path = dir.join("entry");
    match kind {
        Kind::Nothing => {}
        Kind::File => fs::write(&path, "content").unwrap(),
        Kind::Dir => {
            fs::create_dir(&path).unwrap();
            fs::write(path.join("child"), "child").unwrap();
        }
        Kind::SymToDir => {
            fs::create_dir(dir.join("target-dir")).unwrap();
            symlink("target-dir", &path).unwrap();
        }
        Kind::SymToFile => {
            fs::write(dir.join("target-file"), "target").unwrap();
            symlink("target-file", &path).unwrap();
        }
    }
}

#[test]
fn test_conflict_matrix() {
    let images = [Kind::File, Kind::Dir, Kind::SymToFile];
    let roots = [Kind::Nothing, Kind::File, Kind::Dir, Kind::SymToDir, Kind::SymToFile];

    for image_kind in images {
        for root_kind in roots {
            let expect_conflict = matches!(
                (image_kind, root_kind),
                (Kind::File, Kind::Dir)
                    | (Kind::Dir, Kind::File)
                    | (Kind::Dir, Kind::SymToFile)
                    | (Kind::SymToFile, Kind::Dir)
            );

            let scratch = Scratch::new();
            make(&scratch.image, image_kind);
            make(&scratch.root, root_kind);
            let params = no_chown();

            let report = check(&scratch.image, &scratch.root, &params).unwrap();
            assert_eq!(
                report.is_clean(),
                !expect_conflict,
                "check of {:?} over {:?}: {}",
                image_kind,
                root_kind,
                report
            );
            if expect_conflict {
                assert!(report.mentions("/entry"), "{}", report);
            }

            let merged = Merger::new(&scratch.image, &scratch.root, &params)
                .unwrap()
                .merge(None);
            match merged {
                Err(Error::Conflict(report)) => {
                    assert!(expect_conflict, "unexpected conflict {:?} over {:?}: {}", image_kind, root_kind, report)
                }
                Err(e) => panic!("merge of {:?} over {:?} failed: {}", image_kind, root_kind, e),
                Ok(()) => assert!(!expect_conflict, "{:?} over {:?} should conflict", image_kind, root_kind),
            }
        }
    }
}

#[test]
fn test_merged_types_after_replacement() {
    // file replaces a symlink to a directory, not the directory itself
    let scratch = Scratch::new();
    make(&scratch.image, Kind::File);
    make(&scratch.root, Kind::SymToDir);
    Merger::new(&scratch.image, &scratch.root, &no_chown())
        .unwrap()
        .merge(None)
        .unwrap();
    assert_eq!(EntryType::of(&scratch.root.join("entry")), EntryType::File);
    assert!(scratch.root.join("target-dir").is_dir());

    // a directory merges through a symlink to a directory
    let scratch = Scratch::new();
    make(&scratch.image, Kind::Dir);
    make(&scratch.root, Kind::SymToDir);
    Merger::new(&scratch.image, &scratch.root, &no_chown())
        .unwrap()
        .merge(None)
        .unwrap();
    assert_eq!(EntryType::of(&scratch.root.join("entry")), EntryType::Symlink);
    assert_eq!(fs::read_to_string(scratch.root.join("target-dir/child")).unwrap(), "child");
}

#[test]
fn test_dir_over_unresolvable_symlink_conflicts() {
    let scratch = Scratch::new();
    scratch.image_file("broken/file", "x");
    scratch.image_file("cycle/file", "x");
    symlink("nowhere", scratch.root.join("broken")).unwrap();
    symlink("cycle-b", scratch.root.join("cycle")).unwrap();
    symlink("cycle", scratch.root.join("cycle-b")).unwrap();

    let report = check(&scratch.image, &scratch.root, &no_chown()).unwrap();
    assert!(report.mentions("/broken"), "{}", report);
    assert!(report.mentions("/cycle"), "{}", report);

    let merged = Merger::new(&scratch.image, &scratch.root, &no_chown())
        .unwrap()
        .merge(None);
    assert!(matches!(merged, Err(Error::Conflict(_))));
    // neither link was followed or replaced
    assert_eq!(fs::read_link(scratch.root.join("broken")).unwrap(), PathBuf::from("nowhere"));
    assert_eq!(EntryType::of(&scratch.root.join("cycle")), EntryType::Symlink);
}

#[test]
fn test_check_collects_every_conflict() {
    let scratch = Scratch::new();
    scratch.image_file("a/file", "x");
    scratch.image_file("b", "x");
    scratch.image_file("c/d/file", "x");
    scratch.image_file("e", "x");
    fs::create_dir(scratch.image.join("c/empty")).unwrap();
    scratch.root_file("a", "file in the way");
    scratch.root_file("b/child", "dir in the way");
    scratch.root_file("c/d", "nested file in the way");

    let report = check(&scratch.image, &scratch.root, &no_chown()).unwrap();
    assert_eq!(report.conflicts().len(), 4, "{}", report);
    for path in ["/a", "/b", "/c/d", "/c/empty"] {
        assert!(report.mentions(path), "{} missing from {}", path, report);
    }
    // check leaves the root alone
    assert!(!scratch.root.join("e").exists());
}

#[test]
fn test_empty_directories() {
    let scratch = Scratch::new();
    fs::create_dir(scratch.image.join("empty")).unwrap();

    // Rejected by default
    let report = check(&scratch.image, &scratch.root, &no_chown()).unwrap();
    assert!(!report.is_clean());
    assert!(report.mentions("/empty"));

    // Accepted when allowed, and created by the merge
    let mut params = no_chown();
    params.options.allow_empty_dirs = true;
    let report = check(&scratch.image, &scratch.root, &params).unwrap();
    assert!(report.is_clean(), "{}", report);

    Merger::new(&scratch.image, &scratch.root, &params)
        .unwrap()
        .merge(None)
        .unwrap();
    assert!(scratch.root.join("empty").is_dir());
}

#[test]
fn test_empty_image_is_rejected() {
    let scratch = Scratch::new();
    let report = check(&scratch.image, &scratch.root, &no_chown()).unwrap();
    assert!(report.mentions("/"));

    let result = Merger::new(&scratch.image, &scratch.root, &no_chown())
        .unwrap()
        .merge(None);
    assert!(matches!(result, Err(Error::Conflict(_))));
}

#[test]
fn test_dir_over_dir_recurses() {
    let scratch = Scratch::new();
    scratch.root_file("dir/keep", "kept");
    scratch.image_file("dir/new", "new");
    scratch.image_file("dir/sub/deeper", "deeper");

    let contents_path = scratch.dir.path().join("contents");
    let mut writer = installdb::contents::ContentsWriter::create(&contents_path).unwrap();
    Merger::new(&scratch.image, &scratch.root, &no_chown())
        .unwrap()
        .merge(Some(&mut writer))
        .unwrap();
    writer.finish().unwrap();

    assert_eq!(fs::read_to_string(scratch.root.join("dir/keep")).unwrap(), "kept");
    assert_eq!(fs::read_to_string(scratch.root.join("dir/new")).unwrap(), "new");
    assert_eq!(fs::read_to_string(scratch.root.join("dir/sub/deeper")).unwrap(), "deeper");

    let paths: Vec<String> = read_contents(&contents_path)
        .unwrap()
        .iter()
        .map(|e| format!("{} {}", e.type_name(), e.path().display()))
        .collect();
    assert_eq!(
        paths,
        vec!["dir /dir", "file /dir/new", "dir /dir/sub", "file /dir/sub/deeper"]
    );
}

#[test]
fn test_symlink_into_image_is_rewritten() {
    let scratch = Scratch::new();
    let target = scratch.image.join("rewrite_target");
    symlink(&target, scratch.image.join("sym")).unwrap();
    scratch.image_file("rewrite_target", "x");

    // Without the option this is a conflict
    let report = check(&scratch.image, &scratch.root, &no_chown()).unwrap();
    assert!(report.mentions("/sym"), "{}", report);

    let mut params = no_chown();
    params.options.rewrite_symlinks = true;
    assert!(check(&scratch.image, &scratch.root, &params).unwrap().is_clean());

    Merger::new(&scratch.image, &scratch.root, &params)
        .unwrap()
        .merge(None)
        .unwrap();
    assert_eq!(
        fs::read_link(scratch.root.join("sym")).unwrap(),
        PathBuf::from("/rewrite_target")
    );
}

#[test]
fn test_relative_symlinks_are_untouched() {
    let scratch = Scratch::new();
    scratch.image_file("lib/libfoo.so.1", "elf");
    symlink("libfoo.so.1", scratch.image.join("lib/libfoo.so")).unwrap();

    Merger::new(&scratch.image, &scratch.root, &no_chown())
        .unwrap()
        .merge(None)
        .unwrap();
    assert_eq!(
        fs::read_link(scratch.root.join("lib/libfoo.so")).unwrap(),
        PathBuf::from("libfoo.so.1")
    );
}

#[test]
fn test_mtimes_fixed_before_cutoff() {
    let scratch = Scratch::new();
    let old = scratch.image_file("old", "o");
    let new = scratch.image_file("new", "n");
    filetime::set_file_mtime(&old, FileTime::from_unix_time(1_000_000, 0)).unwrap();
    filetime::set_file_mtime(&new, FileTime::from_unix_time(1_600_000_000, 0)).unwrap();

    let cutoff = UNIX_EPOCH + Duration::from_secs(1_500_000_000);
    let params = no_chown().with_fix_mtimes_before(cutoff);
    let started = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;

    Merger::new(&scratch.image, &scratch.root, &params)
        .unwrap()
        .merge(None)
        .unwrap();

    let old_mtime = fs::metadata(scratch.root.join("old")).unwrap().mtime();
    let new_mtime = fs::metadata(scratch.root.join("new")).unwrap().mtime();
    assert!(old_mtime >= started, "old file should have been bumped, got {}", old_mtime);
    assert_eq!(new_mtime, 1_600_000_000);
}

#[test]
fn test_mtimes_bumped_without_cutoff_and_kept_with_preserve() {
    let started = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;

    let scratch = Scratch::new();
    let file = scratch.image_file("f", "x");
    filetime::set_file_mtime(&file, FileTime::from_unix_time(1_600_000_000, 0)).unwrap();
    Merger::new(&scratch.image, &scratch.root, &no_chown())
        .unwrap()
        .merge(None)
        .unwrap();
    assert!(fs::metadata(scratch.root.join("f")).unwrap().mtime() >= started);

    let scratch = Scratch::new();
    let file = scratch.image_file("f", "x");
    filetime::set_file_mtime(&file, FileTime::from_unix_time(1_000_000, 0)).unwrap();
    let mut params = no_chown();
    params.options.preserve_mtimes = true;
    params.options.nondestructive = true;
    Merger::new(&scratch.image, &scratch.root, &params)
        .unwrap()
        .merge(None)
        .unwrap();
    assert_eq!(fs::metadata(scratch.root.join("f")).unwrap().mtime(), 1_000_000);
    // nondestructive leaves the image alone
    assert!(file.exists());
}

#[test]
fn test_config_protection() {
    let scratch = Scratch::new();
    scratch.root_file("etc/app.conf", "user edits");
    scratch.root_file("etc/same.conf", "identical");
    scratch.image_file("etc/app.conf", "package default");
    scratch.image_file("etc/same.conf", "identical");
    scratch.image_file("etc/fresh.conf", "fresh");

    let params = no_chown().with_config_protect(ConfigProtect::from_lists("/etc", ""));
    Merger::new(&scratch.image, &scratch.root, &params)
        .unwrap()
        .merge(None)
        .unwrap();

    let etc = scratch.root.join("etc");
    assert_eq!(fs::read_to_string(etc.join("app.conf")).unwrap(), "user edits");
    assert_eq!(fs::read_to_string(etc.join("._cfg0000_app.conf")).unwrap(), "package default");
    assert_eq!(fs::read_to_string(etc.join("same.conf")).unwrap(), "identical");
    assert!(!etc.join("._cfg0000_same.conf").exists());
    assert_eq!(fs::read_to_string(etc.join("fresh.conf")).unwrap(), "fresh");
}

#[test]
fn test_hardlinks_preserved_when_copying() {
    let scratch = Scratch::new();
    let first = scratch.image_file("bin/a", "shared");
    fs::hard_link(&first, scratch.image.join("bin/b")).unwrap();

    let mut params = no_chown();
    params.options.nondestructive = true;
    Merger::new(&scratch.image, &scratch.root, &params)
        .unwrap()
        .merge(None)
        .unwrap();

    let a = fs::metadata(scratch.root.join("bin/a")).unwrap();
    let b = fs::metadata(scratch.root.join("bin/b")).unwrap();
    assert_eq!(a.ino(), b.ino());
    assert_ne!(a.ino(), fs::metadata(&first).unwrap().ino());
}

#[derive(Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl MergeObserver for Recorder {
    fn on_enter_dir(&self, _is_check: bool, image_dir: &Path) {
        let name = image_dir.file_name().unwrap().to_string_lossy().into_owned();
        self.push(format!("enter {}", name));
    }

    fn on_leave_dir(&self, _is_check: bool, image_dir: &Path) {
        let name = image_dir.file_name().unwrap().to_string_lossy().into_owned();
        self.push(format!("leave {}", name));
    }

    fn on_done(&self, is_check: bool) {
        self.push(format!("done {}", is_check));
    }
}

impl MergeReporter for Recorder {
    fn warn(&self, _is_check: bool, message: &str) {
        self.push(format!("warn {}", message));
    }

    fn error(&self, _is_check: bool, message: &str) {
        self.push(format!("error {}", message));
    }

    fn display(&self, line: &str) {
        self.push(line.to_string());
    }
}

#[test]
fn test_observer_and_reporter() {
    let scratch = Scratch::new();
    scratch.image_file("usr/bin/tool", "x");
    fs::create_dir(scratch.root.join("real-usr")).unwrap();
    symlink("real-usr", scratch.root.join("usr")).unwrap();

    let recorder = Recorder::default();
    let params = no_chown()
        .with_observer(recorder.clone())
        .with_reporter(recorder.clone());

    Merger::new(&scratch.image, &scratch.root, &params)
        .unwrap()
        .merge(None)
        .unwrap();

    let events = recorder.events.lock().unwrap().clone();
    let enters: Vec<_> = events.iter().filter(|e| e.starts_with("enter")).collect();
    assert_eq!(enters, vec!["enter image", "enter usr", "enter bin"]);
    assert_eq!(events.last().unwrap(), "done false");
    assert!(events.iter().any(|e| e.starts_with("warn") && e.contains("symlink to a directory")));
    assert!(events.iter().any(|e| e == ">>> [obj] /usr/bin/tool"));
    assert!(scratch.root.join("real-usr/bin/tool").exists());
}

#[test]
fn test_partitioning_skips_disabled_parts() {
    let scratch = Scratch::new();
    scratch.image_file("usr/bin/tool", "x");
    scratch.image_file("usr/share/doc/tool/README", "docs");

    let mut parts = Partitioning::new();
    parts.mark(["/usr/share/doc"], "doc");
    parts.disable("doc");
    let params = no_chown().with_partitioning(parts);

    Merger::new(&scratch.image, &scratch.root, &params)
        .unwrap()
        .merge(None)
        .unwrap();
    assert!(scratch.root.join("usr/bin/tool").exists());
    assert!(!scratch.root.join("usr/share/doc").exists());
}

#[test]
fn test_ownership_mapping_is_consulted() {
    let scratch = Scratch::new();
    scratch.image_file("a/one", "1");
    scratch.image_file("a/two", "2");

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let params = MergeParams::new(MergeOptions::default()).with_ownership(move |_path| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ownership::default()
    });

    Merger::new(&scratch.image, &scratch.root, &params)
        .unwrap()
        .merge(None)
        .unwrap();

    // one directory and two files
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_merge_index_unmerge_round_trip() -> anyhow::Result<()> {
    let scratch = Scratch::new();
    scratch.image_file("usr/bin/tool", "binary");
    scratch.image_file("etc/tool.conf", "config");
    symlink("tool", scratch.image.join("usr/bin/tool-alias"))?;

    let index = ContentIndex::open(scratch.dir.path().join("db"), |f| f == "test", "test")?;
    let q: QualifiedName = "app-misc/tool".parse()?;
    let version_dir = index.data_dir(&q).join("1.0:0:cookie");
    fs::create_dir_all(&version_dir)?;

    let target = MergeTarget {
        name: q.clone(),
        version_dir: version_dir.clone(),
    };
    let entry = merge(&scratch.image, &scratch.root, &no_chown(), &index, &target)?;
    assert_eq!(entry.version.as_str(), "1.0");
    assert_eq!(entry.magic, "cookie");

    // The index sees the new package
    assert!(index.has_package_named(&q)?);
    assert_eq!(index.entries(&q)?.len(), 1);
    index.verify(&q)?;

    // Every installed entry was recorded with a root-relative path
    let recorded = read_contents(&entry.contents_path())?;
    let sym = recorded
        .iter()
        .find_map(|e| match e {
            ContentsEntry::Sym(s) => Some(s.clone()),
            _ => None,
        })
        .expect("symlink recorded");
    assert_eq!(sym.path, PathBuf::from("/usr/bin/tool-alias"));
    assert_eq!(sym.target, PathBuf::from("tool"));
    assert_eq!(recorded.len(), 6);

    // Unmerge removes everything except the protected config file
    let protect = ConfigProtect::from_lists("/etc", "");
    let report = unmerge(&entry, &index, &scratch.root, &protect)?;
    assert_eq!(report.kept.len(), 2, "{:?}", report.kept);
    assert!(scratch.root.join("etc/tool.conf").exists());
    assert!(!scratch.root.join("usr").exists());

    // and takes the only version out of the index
    assert!(!version_dir.exists());
    assert!(!index.has_package_named(&q)?);
    assert!(index.category_names()?.is_empty());

    Ok(())
}

#[test]
fn test_concurrent_merges_share_an_index() -> anyhow::Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let root = dir.path().join("root");
    fs::create_dir(&root)?;
    let index = ContentIndex::open(dir.path().join("db"), |_| true, "test")?;
    let params = no_chown();

    std::thread::scope(|s| {
        for i in 0..4 {
            let (index, params, root, base) = (&index, &params, &root, dir.path());
            s.spawn(move || {
                let image = base.join(format!("image{}", i));
                // each merge owns its own top-level directory
                fs::create_dir_all(image.join(format!("pkg{}", i))).unwrap();
                fs::write(image.join(format!("pkg{}/data", i)), "x").unwrap();

                let q: QualifiedName = format!("cat/pkg{}", i).parse().unwrap();
                let version_dir = index.data_dir(&q).join("1:0:m");
                fs::create_dir_all(&version_dir).unwrap();
                let target = MergeTarget { name: q, version_dir };
                merge(&image, root, params, index, &target).unwrap();
            });
        }
    });

    let category: CategoryName = "cat".parse()?;
    assert_eq!(index.package_names(&category)?.len(), 4);
    assert_eq!(index.all_entries()?.len(), 4);
    Ok(())
}
