mod support;

use anyhow::Result;
use loadtrace::capture::sink::{self, StoreSink, origin_store_dir};
use loadtrace::loader::ambient;
use loadtrace::{CaptureError, CaptureRequest, Capturer, Runtime, SecondPassSettings, Sink};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use support::{Fixture, files_under};

fn names(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|value| value.to_string()).collect()
}

fn demo_fixture() -> Result<Fixture> {
    let fixture = Fixture::new()?;
    fixture.unit("app", "Demo", "load Demo$Helper\n")?;
    fixture.unit("app", "Demo$Helper", "# no dependencies\n")?;
    Ok(fixture)
}

#[test]
fn demo_captures_only_its_helper() -> Result<()> {
    let fixture = demo_fixture()?;
    let app = fixture.path("app");
    let store = fixture.path("store");

    let capture = Capturer::default().capture(
        CaptureRequest::new("Demo", [app.clone()])
            .unit_sink(sink::store())
            .store(&store),
    )?;
    capture.wait()?;

    assert_eq!(capture.unit_names(), names(&["Demo$Helper"]));
    let stored = files_under(&store);
    assert_eq!(stored.len(), 1, "store holds {stored:?}");
    let expected = origin_store_dir(&store, &app).join("Demo$Helper.unit");
    assert_eq!(store.join(&stored[0]), expected);
    Ok(())
}

#[test]
fn entry_is_captured_only_when_included() -> Result<()> {
    let fixture = demo_fixture()?;
    let app = fixture.path("app");

    for include in [false, true] {
        let capture = Capturer::default().capture(
            CaptureRequest::new("Demo", [app.clone()])
                .unit_sink(sink::collect())
                .include_entry(include),
        )?;
        capture.wait()?;
        assert_eq!(capture.unit_names().contains("Demo"), include);
        assert!(capture.unit_names().contains("Demo$Helper"));
    }
    Ok(())
}

#[test]
fn resource_reaches_store_once() -> Result<()> {
    let fixture = Fixture::new()?;
    fixture.unit(
        "app",
        "Demo",
        "resource config.properties\nresource config.properties\nresource missing.properties\n",
    )?;
    fixture.file("app", "config.properties", "mode=test\n")?;
    let app = fixture.path("app");
    let store = fixture.path("store");

    let fired = Arc::new(Mutex::new(Vec::new()));
    let seen = fired.clone();
    let counting = move |root: Option<&Path>, key: &str, relative: &str, content: &[u8]| -> anyhow::Result<()> {
        seen.lock().unwrap().push(relative.to_string());
        StoreSink.accept(root, key, relative, content)
    };

    let capture = Capturer::default().capture(
        CaptureRequest::new("Demo", [app.clone()])
            .resource_sink(Arc::new(counting))
            .store(&store),
    )?;
    capture.wait()?;

    assert_eq!(*fired.lock().unwrap(), vec!["config.properties"]);
    assert_eq!(capture.resources().len(), 1);
    let stored = files_under(&store);
    assert_eq!(stored.len(), 1);
    let target = origin_store_dir(&store, &app).join("config.properties");
    assert_eq!(fs::read_to_string(target)?, "mode=test\n");
    Ok(())
}

#[test]
fn absent_resource_sink_writes_no_resources() -> Result<()> {
    let fixture = Fixture::new()?;
    fixture.unit("app", "Demo", "resource config.properties\nload Demo$Helper\n")?;
    fixture.unit("app", "Demo$Helper", "")?;
    fixture.file("app", "config.properties", "mode=test\n")?;
    let store = fixture.path("store");

    let capture = Capturer::default().capture(
        CaptureRequest::new("Demo", [fixture.path("app")])
            .unit_sink(sink::store())
            .store(&store),
    )?;
    capture.wait()?;

    assert!(capture.resources().is_empty());
    let stored = files_under(&store);
    assert!(
        stored.iter().all(|path| path.extension().is_some_and(|ext| ext == "unit")),
        "unexpected store content {stored:?}"
    );
    Ok(())
}

#[test]
fn entry_failure_surfaces_through_wait() -> Result<()> {
    let fixture = Fixture::new()?;
    fixture.unit("app", "Demo", "load Demo$Helper\nfail configuration missing\n")?;
    fixture.unit("app", "Demo$Helper", "")?;

    let capture = Capturer::default().capture(
        CaptureRequest::new("Demo", [fixture.path("app")]).unit_sink(sink::collect()),
    )?;
    match capture.wait() {
        Err(CaptureError::EntryPoint { entry, message }) => {
            assert_eq!(entry, "Demo");
            assert!(message.contains("configuration missing"), "{message}");
        }
        other => panic!("expected entry point failure, got {other:?}"),
    }
    assert!(capture.unit_names().contains("Demo$Helper"));
    let _owner = ambient::acquire();
    assert!(!ambient::is_installed());
    Ok(())
}

#[test]
fn panicking_native_entry_restores_ambient_loader() -> Result<()> {
    let fixture = demo_fixture()?;
    let capturer = Capturer::new(Runtime::new().with_native("Crash", |ctx| {
        ctx.load("Demo$Helper")?;
        panic!("native entry exploded");
    }));

    let capture = capturer.capture(
        CaptureRequest::new("Crash", [fixture.path("app")]).unit_sink(sink::collect()),
    )?;
    let err = capture.wait().unwrap_err();
    assert!(err.to_string().contains("native entry exploded"), "{err}");
    assert!(capture.unit_names().contains("Demo$Helper"));
    let _owner = ambient::acquire();
    assert!(!ambient::is_installed());
    Ok(())
}

#[test]
fn grace_delay_observes_deferred_loads() -> Result<()> {
    let fixture = Fixture::new()?;
    fixture.unit("app", "Demo", "defer 200 Late\n")?;
    fixture.unit("app", "Late", "")?;
    let app = fixture.path("app");

    let patient = Capturer::default().capture(
        CaptureRequest::new("Demo", [app.clone()])
            .unit_sink(sink::collect())
            .grace(Some(Duration::from_millis(1000))),
    )?;
    patient.wait()?;
    assert!(patient.unit_names().contains("Late"));

    let hasty = Capturer::default()
        .capture(CaptureRequest::new("Demo", [app]).unit_sink(sink::collect()))?;
    hasty.wait()?;
    thread::sleep(Duration::from_millis(400));
    assert!(!hasty.unit_names().contains("Late"));
    Ok(())
}

#[test]
fn spawned_threads_load_through_the_ambient_loader() -> Result<()> {
    let fixture = Fixture::new()?;
    fixture.unit("app", "Demo", "spawn Worker\nspawn Other\n")?;
    fixture.unit("app", "Worker", "load Shared\n")?;
    fixture.unit("app", "Other", "load Shared\nresources data.txt\n")?;
    fixture.unit("app", "Shared", "")?;
    fixture.file("app", "data.txt", "payload")?;

    let capture = Capturer::default().capture(
        CaptureRequest::new("Demo", [fixture.path("app")])
            .unit_sink(sink::collect())
            .resource_sink(sink::collect()),
    )?;
    capture.wait()?;

    assert_eq!(capture.unit_names(), names(&["Other", "Shared", "Worker"]));
    assert_eq!(capture.resources().len(), 1);
    Ok(())
}

#[test]
fn rerun_never_overwrites_the_store() -> Result<()> {
    let fixture = demo_fixture()?;
    let app = fixture.path("app");
    let store = fixture.path("store");
    let request = || {
        CaptureRequest::new("Demo", [app.clone()])
            .unit_sink(sink::store())
            .store(&store)
    };

    Capturer::default().capture(request())?.wait()?;
    let stored = origin_store_dir(&store, &app).join("Demo$Helper.unit");
    fs::write(&stored, "edited after first run")?;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let counting = move |root: Option<&Path>, key: &str, relative: &str, content: &[u8]| -> anyhow::Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        StoreSink.accept(root, key, relative, content)
    };
    let second = Capturer::default().capture(request().unit_sink(Arc::new(counting)))?;
    second.wait()?;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(fs::read_to_string(&stored)?, "edited after first run");
    assert_eq!(files_under(&store).len(), 1);
    Ok(())
}

#[test]
fn close_cancels_a_running_capture() -> Result<()> {
    let fixture = Fixture::new()?;
    fixture.unit("app", "Demo", "load Demo$Helper\nsleep 30000\n")?;
    fixture.unit("app", "Demo$Helper", "")?;

    let capture = Capturer::default().capture(
        CaptureRequest::new("Demo", [fixture.path("app")]).unit_sink(sink::collect()),
    )?;
    thread::sleep(Duration::from_millis(50));
    capture.close();

    assert!(capture.is_closed());
    assert!(capture.units().is_empty());
    assert!(matches!(capture.wait(), Err(CaptureError::Closed)));
    assert!(matches!(capture.load("Demo"), Err(CaptureError::Closed)));
    Ok(())
}

#[test]
fn units_from_archives_are_captured_by_key() -> Result<()> {
    let fixture = Fixture::new()?;
    fixture.unit("app", "Demo", "load util.Tool\n")?;
    let archive = fixture.archive("util.zip", &[("util/Tool.unit", "")])?;
    let store = fixture.path("store");

    let capture = Capturer::default().capture(
        CaptureRequest::new("Demo", [fixture.path("app"), archive.clone()])
            .unit_sink(sink::store())
            .store(&store),
    )?;
    capture.wait()?;

    let units = capture.units();
    let (key, entry) = units.iter().next().expect("one captured unit");
    assert_eq!(entry.name, "util.Tool");
    assert_eq!(
        key.as_str(),
        format!("{}/util/Tool.unit", archive.display())
    );
    assert!(origin_store_dir(&store, &archive).join("util/Tool.unit").is_file());
    Ok(())
}

#[test]
fn missing_candidate_paths_are_skipped() -> Result<()> {
    let fixture = demo_fixture()?;
    let capture = Capturer::default().capture(
        CaptureRequest::new("Demo", [fixture.path("app"), fixture.path("does-not-exist")])
            .unit_sink(sink::collect()),
    )?;
    capture.wait()?;
    assert_eq!(capture.catalog().len(), 2);
    Ok(())
}

#[test]
fn traversing_names_never_write_outside_the_store() -> Result<()> {
    let fixture = Fixture::new()?;
    fixture.file("", "secret.txt", "s3cr3t")?;
    fixture.unit(
        "a/b/c/app",
        "Demo",
        "load Demo$Helper\nresource ../../../../secret.txt\nresources ../../../../secret.txt\n",
    )?;
    fixture.unit("a/b/c/app", "Demo$Helper", "")?;
    let archive = fixture.archive("a/b/c/lib.zip", &[("../../escaped.unit", "# outside")])?;
    let store = fixture.path("a/b/c/store");
    let before = files_under(&fixture.path(""));

    let capture = Capturer::default().capture(
        CaptureRequest::new("Demo", [fixture.path("a/b/c/app"), archive])
            .unit_sink(sink::store())
            .resource_sink(sink::store())
            .store(&store),
    )?;
    capture.wait()?;

    assert!(capture.resources().is_empty());
    assert!(capture.load("......escaped")?.is_none());
    let outside_store: Vec<_> = files_under(&fixture.path(""))
        .into_iter()
        .filter(|path| !path.starts_with("a/b/c/store"))
        .collect();
    assert_eq!(outside_store, before);
    assert_eq!(files_under(&store).len(), 1);
    Ok(())
}

#[test]
fn concurrent_loads_fire_each_sink_once_per_key() -> Result<()> {
    const THREADS: usize = 8;
    const UNITS: [&str; 4] = ["A", "B", "C", "D"];
    let fixture = Fixture::new()?;
    for name in UNITS {
        fixture.unit("app", name, "")?;
    }
    fixture.file("app", "data.txt", "payload")?;

    let capturer = Capturer::new(Runtime::new().with_native("Fan", |ctx| {
        let start = Barrier::new(THREADS);
        thread::scope(|scope| {
            for _ in 0..THREADS {
                let start = &start;
                scope.spawn(move || {
                    start.wait();
                    for name in UNITS {
                        ctx.loader().resolve_unit(name);
                    }
                    ctx.resource("data.txt");
                });
            }
        });
        Ok(())
    }));

    let counts: Arc<Mutex<BTreeMap<String, usize>>> = Arc::default();
    let seen = counts.clone();
    let counting = move |_: Option<&Path>, key: &str, _: &str, _: &[u8]| -> anyhow::Result<()> {
        *seen.lock().unwrap().entry(key.to_string()).or_default() += 1;
        Ok(())
    };
    let counting: Arc<dyn Sink> = Arc::new(counting);

    let capture = capturer.capture(
        CaptureRequest::new("Fan", [fixture.path("app")])
            .unit_sink(counting.clone())
            .resource_sink(counting),
    )?;
    capture.wait()?;

    assert_eq!(capture.unit_names(), names(&UNITS));
    assert_eq!(capture.resources().len(), 1);
    let counts = counts.lock().unwrap();
    assert_eq!(counts.len(), UNITS.len() + 1);
    assert!(counts.values().all(|&fired| fired == 1), "{counts:?}");
    Ok(())
}

#[cfg(unix)]
#[test]
fn close_kills_a_running_second_pass() -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    use std::process::Command;

    fn alive(pid: &str) -> bool {
        Command::new("kill")
            .arg("-0")
            .arg(pid)
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    let fixture = demo_fixture()?;
    let pid_file = fixture.path("child.pid");
    let program = fixture.file(
        "bin",
        "slow-pass",
        &format!("#!/bin/sh\necho $$ > '{}'\nexec sleep 30\n", pid_file.display()),
    )?;
    fs::set_permissions(&program, fs::Permissions::from_mode(0o755))?;
    let settings = SecondPassSettings {
        program: Some(program),
        ..SecondPassSettings::default()
    };

    let capture = Capturer::default().capture(
        CaptureRequest::new("Demo", [fixture.path("app")])
            .unit_sink(sink::store())
            .store(fixture.path("store"))
            .second_pass(settings),
    )?;

    let deadline = Instant::now() + Duration::from_secs(10);
    let pid = loop {
        let written = fs::read_to_string(&pid_file).unwrap_or_default();
        if written.ends_with('\n') {
            break written.trim().to_string();
        }
        assert!(Instant::now() < deadline, "relaunched pass never started");
        thread::sleep(Duration::from_millis(20));
    };
    assert!(alive(&pid));
    assert!(!capture.is_finished());

    capture.close();
    let deadline = Instant::now() + Duration::from_secs(5);
    while alive(&pid) {
        assert!(Instant::now() < deadline, "relaunched pass {pid} survived close");
        thread::sleep(Duration::from_millis(20));
    }
    assert!(matches!(capture.wait(), Err(CaptureError::Closed)));
    Ok(())
}
