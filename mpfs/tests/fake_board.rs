//! End-to-end coverage of the façade against the scripted in-memory board.

use std::path::PathBuf;

use pretty_assertions::assert_eq;
use test_case::test_case;

use mpfs::board::{Board, Timeouts};
use mpfs::connection::fake::FakeBoard;
use mpfs::fs::cache::CachedFs;
use mpfs::fs::{DirEntry, EntryKind, ExecTool, FsOps, OsFlavor, PutOutcome, RemoteFs};
use mpfs::{Error, RemoteIoError, ReplMode, RetryPolicy};

fn attach(fake: &FakeBoard) -> RemoteFs {
    attach_as(fake, "linux")
}

fn attach_as(fake: &FakeBoard, sysname: &str) -> RemoteFs {
    let mut board = Board::new(fake.connection());
    board.set_timeouts(Timeouts::fast());
    RemoteFs::attach_with(board, sysname.to_string(), RetryPolicy::no_wait())
        .expect("attach to fake board")
}

/// A scratch directory on the host, removed on drop.
struct Scratch(PathBuf);

impl Scratch {
    fn new(name: &str) -> Self {
        let path = std::env::temp_dir().join(format!("mpfs-test-{}-{name}", std::process::id()));
        let _ = std::fs::remove_dir_all(&path);
        std::fs::create_dir_all(&path).unwrap();
        Scratch(path)
    }

    fn file(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.0.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    fn path(&self) -> &std::path::Path {
        &self.0
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

fn pattern_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn attach_lands_in_raw_repl_at_the_root() {
    let fake = FakeBoard::new();
    let mut fs = attach(&fake);

    assert_eq!(fs.pwd(), "/");
    assert!(fs.ledger().is_empty());
    assert_eq!(fs.board_mut().mode(), ReplMode::Raw);
    assert_eq!(fs.exec_tool(), ExecTool::Shell);
    assert_eq!(fs.os_flavor(), OsFlavor::Os);
}

#[test]
fn model_detection_selects_the_uos_flavor() {
    let fake = FakeBoard::with_model("stm32l401");
    fake.add_dir("/flash");
    fake.set_cwd("/flash");
    let mut fs = attach(&fake);

    assert_eq!(fs.model(), Some("stm32l401"));
    assert_eq!(fs.os_flavor(), OsFlavor::Uos);
    // The `uos.system('pwd')` status tail must not leak into the path.
    assert_eq!(fs.pwd(), "/flash");

    // File traffic still works through the uos projections.
    let scratch = Scratch::new("uos");
    let src = scratch.file("a.py", b"print('hi')");
    fs.put(&src, "a.py").unwrap();
    assert_eq!(fake.file("/flash/a.py").unwrap(), b"print('hi')");
    fs.rm("a.py").unwrap();
    assert_eq!(fake.file("/flash/a.py"), None);
}

#[test]
fn esp_modules_execute_through_the_repl() {
    let fake = FakeBoard::esp_module("ESP8266");
    let fs = attach(&fake);
    assert_eq!(fs.exec_tool(), ExecTool::Repl);
}

#[test]
fn a_board_without_micropython_is_fatal() {
    let fake = FakeBoard::new();
    fake.set_no_micropython();

    let mut board = Board::new(fake.connection());
    board.set_timeouts(Timeouts::fast());
    let result = RemoteFs::attach_with(board, "linux".into(), RetryPolicy::no_wait());

    assert!(matches!(result, Err(Error::NoMicroPython)));
}

#[test]
fn a_wedged_board_surfaces_a_driver_error() {
    let fake = FakeBoard::new();
    fake.set_wedged();

    let mut board = Board::new(fake.connection());
    board.set_timeouts(Timeouts::fast());
    let result = RemoteFs::attach_with(board, "linux".into(), RetryPolicy::no_wait());

    assert!(matches!(result, Err(Error::Driver(_))));
}

#[test]
fn md_cd_pwd_roundtrip() {
    let fake = FakeBoard::new();
    let mut fs = attach(&fake);

    fs.md("foo", true).unwrap();
    fs.cd("foo").unwrap();
    assert_eq!(fs.pwd(), "/foo");

    fs.cd("..").unwrap();
    assert_eq!(fs.pwd(), "/");

    assert!(fake.has_dir("/foo"));
}

#[test]
fn md_with_verify_creates_parents_and_tolerates_existing_ones() {
    let fake = FakeBoard::new();
    let mut fs = attach(&fake);

    fs.md("a", true).unwrap();
    fs.md("a/b/c", true).unwrap();
    assert!(fake.has_dir("/a/b"));
    assert!(fake.has_dir("/a/b/c"));

    // Creating it again is silent.
    fs.md("a/b/c", true).unwrap();
}

#[test]
fn cd_into_a_missing_directory_reports_no_such_directory() {
    let fake = FakeBoard::new();
    let mut fs = attach(&fake);

    let err = fs.cd("nowhere").unwrap_err();
    assert_eq!(err.to_string(), "No such directory: nowhere");
    assert_eq!(fs.pwd(), "/");
}

#[test]
fn listing_cannot_tell_empty_directories_from_files() {
    let fake = FakeBoard::new();
    fake.add_dir("/work");
    fake.add_dir("/work/empty_dir");
    fake.add_file("/work/data.bin", b"\x00\x01\x02");
    fake.add_dir("/work/lib");
    fake.add_file("/work/lib/util.py", b"pass");

    let mut fs = attach(&fake);
    fs.cd("work").unwrap();

    let mut entries = fs.ls().unwrap();
    entries.sort();
    assert_eq!(
        entries,
        vec![
            DirEntry::new("data.bin", EntryKind::File),
            DirEntry::new("empty_dir", EntryKind::File),
            DirEntry::new("lib", EntryKind::Dir),
        ]
    );
}

#[test]
fn filtered_listing_with_dirs_returns_the_raw_names() {
    let fake = FakeBoard::new();
    fake.add_dir("/work");
    fake.add_file("/work/a.py", b"1");
    fake.add_dir("/work/lib");
    fake.add_file("/work/lib/x.py", b"2");

    let mut fs = attach(&fake);
    fs.cd("work").unwrap();

    let mut raw = fs.ls_filtered(true, true).unwrap();
    raw.sort();
    assert_eq!(raw, vec!["a.py", "lib"]);

    let files = fs.ls_filtered(true, false).unwrap();
    assert_eq!(files, vec!["a.py"]);
}

#[test]
fn wipy_hosts_treat_root_entries_as_mount_points() {
    let fake = FakeBoard::new();
    fake.add_dir("/flash");
    fake.add_file("/boot.log", b"x");

    let mut fs = attach_as(&fake, "WiPy");
    let mut entries = fs.ls().unwrap();
    entries.retain(|e| e.name != "sign");
    entries.sort();

    assert_eq!(
        entries,
        vec![
            DirEntry::new("boot.log", EntryKind::Dir),
            DirEntry::new("flash", EntryKind::Dir),
        ]
    );
}

#[test_case(0; "empty")]
#[test_case(1; "one byte")]
#[test_case(1599; "one under chunk")]
#[test_case(1600; "exact chunk")]
#[test_case(1601; "one over chunk")]
#[test_case(10 * 1600 + 7; "ten chunks and change")]
#[test_case(1024 * 1024; "one mebibyte")]
fn put_then_get_roundtrips(len: usize) {
    let fake = FakeBoard::new();
    let mut fs = attach(&fake);
    let scratch = Scratch::new(&format!("roundtrip-{len}"));

    let data = pattern_bytes(len);
    let src = scratch.file("blob.bin", &data);

    assert_eq!(fs.put(&src, "blob.bin").unwrap(), PutOutcome::Written(len));
    assert_eq!(fake.file("/blob.bin").unwrap(), data);

    let dst = scratch.path().join("back.bin");
    fs.get("blob.bin", &dst, true).unwrap();
    assert_eq!(std::fs::read(&dst).unwrap(), data);
}

#[test]
fn put_chunks_by_1600_source_bytes_and_writes_the_ledger() {
    let fake = FakeBoard::new();
    let mut fs = attach(&fake);
    let scratch = Scratch::new("chunks");

    fs.md("foo", true).unwrap();
    let src = scratch.file("local.bin", &pattern_bytes(1700));

    let before = fake.write_chunk_count();
    fs.put(&src, "foo/x").unwrap();

    // 1700 bytes travel as 1600 + 100, plus one chunk for the ledger.
    assert_eq!(fake.write_chunk_count() - before, 3);
    assert_eq!(fake.file("/foo/x").unwrap().len(), 1700);
    assert_eq!(fs.ledger().get("/foo/x"), Some(mpfs::ledger::digest(&pattern_bytes(1700)).as_str()));

    // The ledger survives on the board and is not empty.
    assert!(fake.file("/sign").unwrap().len() > 2);
}

#[test]
fn a_second_put_of_unchanged_bytes_moves_nothing() {
    let fake = FakeBoard::new();
    let mut fs = attach(&fake);
    let scratch = Scratch::new("idempotent");

    let src = scratch.file("app.py", b"print('x')\n");
    assert!(matches!(fs.put(&src, "app.py").unwrap(), PutOutcome::Written(_)));

    let chunks = fake.write_chunk_count();
    let execs = fake.exec_count();
    assert_eq!(fs.put(&src, "app.py").unwrap(), PutOutcome::Unchanged);

    assert_eq!(fake.write_chunk_count(), chunks);
    assert_eq!(fake.exec_count(), execs);

    // Changing the bytes uploads again.
    std::fs::write(&src, b"print('y')\n").unwrap();
    assert!(matches!(fs.put(&src, "app.py").unwrap(), PutOutcome::Written(_)));
    assert_eq!(fake.file("/app.py").unwrap(), b"print('y')\n");
}

#[test]
fn put_of_a_directory_creates_the_remote_directory() {
    let fake = FakeBoard::new();
    let mut fs = attach(&fake);
    let scratch = Scratch::new("putdir");

    assert_eq!(
        fs.put(scratch.path(), "tree").unwrap(),
        PutOutcome::CreatedDir
    );
    assert!(fake.has_dir("/tree"));
}

#[test]
fn get_with_verify_rejects_unknown_names() {
    let fake = FakeBoard::new();
    let mut fs = attach(&fake);
    let scratch = Scratch::new("verify");

    let err = fs
        .get("ghost.py", &scratch.path().join("ghost.py"), true)
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Remote(RemoteIoError::NoSuchFileOrDirectory(_))
    ));
}

#[test]
fn get_of_a_directory_recurses() {
    let fake = FakeBoard::new();
    fake.add_dir("/src");
    fake.add_file("/src/main.py", b"print('main')");
    fake.add_dir("/src/lib");
    fake.add_file("/src/lib/util.py", b"pass");

    let mut fs = attach(&fake);
    let scratch = Scratch::new("gettree");
    let dst = scratch.path().join("src");

    fs.get("src", &dst, false).unwrap();

    assert_eq!(std::fs::read(dst.join("main.py")).unwrap(), b"print('main')");
    assert_eq!(std::fs::read(dst.join("lib/util.py")).unwrap(), b"pass");
    // The walk must land back where it started.
    assert_eq!(fs.pwd(), "/");
}

#[test]
fn gets_returns_text_and_hexdumps_binaries() {
    let fake = FakeBoard::new();
    fake.add_file("/readme.txt", b"hello board\n");
    fake.add_file("/blob.bin", &[0xff, 0xfe, 0x00, 0x41]);

    let mut fs = attach(&fake);

    assert_eq!(fs.gets("readme.txt").unwrap(), "hello board\n");

    let dump = fs.gets("blob.bin").unwrap();
    assert!(dump.starts_with("\nBinary file:\n\n"));
    assert!(dump.contains("fffe0041"));

    let err = fs.gets("missing.txt").unwrap_err();
    assert_eq!(err.to_string(), "Failed to read file: missing.txt");
}

#[test]
fn rm_distinguishes_missing_targets_from_full_directories() {
    let fake = FakeBoard::new();
    fake.add_dir("/foo");
    fake.add_file("/foo/inner.py", b"1");

    let mut fs = attach(&fake);

    let err = fs.rm("foo").unwrap_err();
    assert_eq!(err.to_string(), "Directory not empty: foo");

    let err = fs.rm("ghost").unwrap_err();
    assert_eq!(err.to_string(), "No such file or directory: ghost");
}

#[test]
fn wipy_hosts_hedge_the_missing_target_message() {
    let fake = FakeBoard::new();
    let mut fs = attach_as(&fake, "WiPy");

    let err = fs.rm("ghost").unwrap_err();
    assert_eq!(
        err.to_string(),
        "No such file or directory or directory not empty: ghost"
    );
}

#[test]
fn rm_of_the_ledger_path_clears_the_ledger() {
    let fake = FakeBoard::new();
    let mut fs = attach(&fake);
    let scratch = Scratch::new("rmsign");

    let a = scratch.file("a.py", b"a");
    let b = scratch.file("b.py", b"b");
    fs.put(&a, "a.py").unwrap();
    fs.put(&b, "b.py").unwrap();
    assert_eq!(fs.ledger().len(), 2);

    fs.rm("/sign").unwrap();
    assert!(fs.ledger().is_empty());
}

#[test]
fn rm_updates_exactly_one_ledger_entry() {
    let fake = FakeBoard::new();
    let mut fs = attach(&fake);
    let scratch = Scratch::new("rmone");

    let a = scratch.file("a.py", b"a");
    let b = scratch.file("b.py", b"b");
    fs.put(&a, "a.py").unwrap();
    fs.put(&b, "b.py").unwrap();

    fs.rm("a.py").unwrap();
    assert_eq!(fs.ledger().get("a.py"), None);
    assert!(fs.ledger().get("b.py").is_some());
}

#[test]
fn rmrf_removes_a_tree_and_its_ledger_entries() {
    let fake = FakeBoard::new();
    let mut fs = attach(&fake);
    let scratch = Scratch::new("rmrf");

    fs.md("foo", true).unwrap();
    fs.md("foo/sub", true).unwrap();
    let a = scratch.file("a.py", b"a");
    let deep = scratch.file("deep.py", b"d");
    fs.put(&a, "foo/a.py").unwrap();
    fs.put(&deep, "foo/sub/deep.py").unwrap();
    let keep = scratch.file("keep.py", b"k");
    fs.put(&keep, "keep.py").unwrap();

    let err = fs.rm("foo").unwrap_err();
    assert!(matches!(
        err,
        Error::Remote(RemoteIoError::DirectoryNotEmpty(_))
    ));

    fs.rmrf("foo").unwrap();

    assert!(!fake.has_dir("/foo"));
    assert!(fs.ledger().paths_with_prefix("/foo").is_empty());
    assert!(fs.ledger().get("keep.py").is_some());
    assert_eq!(fs.pwd(), "/");
}

#[test]
fn glob_operations_match_anchored_patterns() {
    let fake = FakeBoard::new();
    fake.add_file("/app_main.py", b"1");
    fake.add_file("/app_util.py", b"2");
    fake.add_file("/boot.py", b"3");

    let mut fs = attach(&fake);
    let scratch = Scratch::new("glob");

    let mut fetched = fs.mget(r"app_.*\.py", scratch.path()).unwrap();
    fetched.sort();
    assert_eq!(fetched, vec!["app_main.py", "app_util.py"]);
    assert!(scratch.path().join("app_main.py").exists());
    assert!(!scratch.path().join("boot.py").exists());

    let mut removed = fs.mrm(r"app_.*").unwrap();
    removed.sort();
    assert_eq!(removed, vec!["app_main.py", "app_util.py"]);
    assert_eq!(fake.file("/app_main.py"), None);
    assert!(fake.file("/boot.py").is_some());

    // A pattern that does not anchor-match leaves everything alone.
    assert!(fs.mrm(r"main").unwrap().is_empty());
    assert!(fake.file("/boot.py").is_some());

    let err = fs.mrm("[").unwrap_err();
    assert!(matches!(err, Error::Remote(RemoteIoError::Pattern(_))));
}

#[test]
fn mput_uploads_matching_files_only() {
    let fake = FakeBoard::new();
    let mut fs = attach(&fake);
    let scratch = Scratch::new("mput");

    scratch.file("one.py", b"1");
    scratch.file("two.py", b"2");
    scratch.file("notes.txt", b"n");

    fs.md("lib", true).unwrap();
    let mut uploaded = fs
        .mput(scratch.path(), r".*\.py", Some("lib"))
        .unwrap();
    uploaded.sort();

    assert_eq!(uploaded, vec!["one.py", "two.py"]);
    assert!(fake.file("/lib/one.py").is_some());
    assert!(fake.file("/lib/notes.txt").is_none());
}

#[test]
fn synchronize_deletes_remote_leftovers() {
    let fake = FakeBoard::new();
    let mut fs = attach(&fake);
    let scratch = Scratch::new("sync");

    fs.md("app", true).unwrap();
    let keep = scratch.file("keep.py", b"k");
    let gone = scratch.file("gone.py", b"g");
    fs.put(&keep, "app/keep.py").unwrap();
    fs.put(&gone, "app/gone.py").unwrap();

    std::fs::remove_file(&gone).unwrap();

    let removed = fs.synchronize(scratch.path(), "app").unwrap();
    assert_eq!(removed, vec!["app/gone.py"]);
    assert_eq!(fake.file("/app/gone.py"), None);
    assert!(fake.file("/app/keep.py").is_some());
}

#[test]
fn fqn_normalizes_separators_against_the_working_directory() {
    let fake = FakeBoard::new();
    fake.add_dir("/x");
    let mut fs = attach(&fake);
    fs.cd("x").unwrap();

    assert_eq!(fs.fqn("a/b"), "/x/a/b");
    assert_eq!(fs.fqn(r"a\b"), "/x/a/b");
    assert_eq!(fs.fqn("/abs/path"), "/abs/path");
}

#[test]
fn a_swallowed_command_is_retried_and_surfaces_a_driver_error() {
    let fake = FakeBoard::new();
    let mut fs = attach(&fake);

    fake.fail_next_commands(1);
    let err = fs.ls().unwrap_err();
    assert!(matches!(err, Error::Driver(_)));
}

#[test]
fn driver_exec_returns_both_segments() {
    let fake = FakeBoard::new();
    fake.add_file("/data.txt", b"zz");
    let mut fs = attach(&fake);

    // A healthy command: empty error segment.
    let board = fs.board_mut();
    let (out, err) = board
        .exec_raw("print(os.listdir('/'))", std::time::Duration::from_millis(100), false)
        .unwrap();
    assert!(!out.is_empty());
    assert!(err.is_empty());

    // A failing one: non-empty error segment surfaces as an error.
    let result = board.exec("print(os.listdir('/nope'))");
    assert!(matches!(
        result,
        Err(mpfs::DriverError::Interpreter { .. })
    ));
}

#[test]
fn shell_excursions_return_the_command_output() {
    let fake = FakeBoard::new();
    fake.add_file("/main.py", b"print('hi')");
    fake.set_script_output("main.py", "hi\r\n");

    let mut fs = attach(&fake);
    let output = fs.exec_in_shell("mpy main.py").unwrap();
    let text = String::from_utf8_lossy(&output);
    assert!(text.contains("hi"));

    // The board needs a fresh session afterwards.
    fs.reattach().unwrap();
    assert_eq!(fs.board_mut().mode(), ReplMode::Raw);
    assert!(!fs.ls().unwrap().is_empty());
}

#[test]
fn cached_listing_stays_coherent_through_mutations() {
    let fake = FakeBoard::new();
    fake.add_dir("/work");
    fake.add_file("/work/seed.py", b"s");

    let mut fs = CachedFs::new(attach(&fake));
    fs.cd("work").unwrap();
    let scratch = Scratch::new("cache");

    // Prime the cache.
    let initial = fs.ls().unwrap();
    assert_eq!(initial.len(), 1);

    let exec_after_prime = fake.exec_count();
    // A second listing is served from the cache, no wire traffic.
    fs.ls().unwrap();
    assert_eq!(fake.exec_count(), exec_after_prime);

    // Mutations patch the cached listing in place.
    let newfile = scratch.file("new.py", b"n");
    fs.put(&newfile, "new.py").unwrap();
    fs.md("subdir", true).unwrap();
    let inner_file = scratch.file("inner.py", b"i");
    fs.put(&inner_file, "subdir/inner.py").unwrap();
    fs.rm("seed.py").unwrap();

    let mut cached: Vec<DirEntry> = fs.ls().unwrap();
    cached.sort();

    // The same sequence without the cache must agree.
    let mut uncached = fs.into_inner();
    let mut fresh = uncached.ls().unwrap();
    fresh.sort();

    assert_eq!(cached, fresh);
    assert_eq!(
        cached,
        vec![
            DirEntry::new("new.py", EntryKind::File),
            DirEntry::new("subdir", EntryKind::Dir),
        ]
    );
}

#[test]
fn cached_rmrf_patches_through_the_walk() {
    let fake = FakeBoard::new();
    fake.add_dir("/doom");
    fake.add_file("/doom/a.py", b"a");
    fake.add_dir("/doom/sub");
    fake.add_file("/doom/sub/b.py", b"b");
    fake.add_file("/stay.py", b"s");

    let mut fs = CachedFs::new(attach(&fake));
    fs.ls().unwrap();

    fs.rmrf("doom").unwrap();

    let mut names: Vec<String> = fs.ls().unwrap().into_iter().map(|e| e.name).collect();
    names.retain(|n| n != "sign");
    assert_eq!(names, vec!["stay.py"]);
    assert!(!fake.has_dir("/doom"));
}
